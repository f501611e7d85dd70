use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

#[inline]
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

#[inline]
fn random_hex32() -> String {
    Uuid::from_u128(fastrand::u128(..)).simple().to_string()
}

/// `call_` followed by 32 lowercase hex digits.
#[inline]
pub(crate) fn new_call_id() -> String {
    let mut id = String::with_capacity(37);
    id.push_str("call_");
    id.push_str(&random_hex32());
    id
}

/// Completion id used when the prepare step did not supply a session id.
#[inline]
pub(crate) fn fallback_session_id() -> String {
    let mut id = String::with_capacity(41);
    id.push_str("chatcmpl-");
    id.push_str(&random_hex32());
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_shape() {
        let id = new_call_id();
        assert_eq!(id.len(), 37);
        assert!(id.starts_with("call_"));
        assert!(id[5..].bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        assert_ne!(id, new_call_id());
    }

    #[test]
    fn session_id_shape() {
        let id = fallback_session_id();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), 41);
    }
}
