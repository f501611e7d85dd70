use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};

use crate::config::{AppConfig, ServerConfig};
use crate::error::GatewayError;
use crate::session::LeaseReleaser;

pub(crate) const INTERNAL_TOKEN_HEADER: &str = "x-ds2-internal-token";
pub(crate) const POW_RESPONSE_HEADER: &str = "x-ds-pow-response";

/// Client headers the prepare collaborator needs to authenticate the caller.
const FORWARDED_CLIENT_HEADERS: [&str; 3] = ["authorization", "x-api-key", "x-ds2-target-account"];

fn build_reqwest_client(server: &ServerConfig) -> Result<reqwest::Client, GatewayError> {
    let pool_idle_timeout = if server.http_pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(server.http_pool_idle_timeout_secs))
    };
    // No overall timeout: completion bodies stream for as long as the model
    // keeps talking. Short calls set their own per-request timeout.
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(server.http_pool_max_idle_per_host.max(1))
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(server.connect_timeout_secs))
        .redirect(reqwest::redirect::Policy::none());

    if !server.http_use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| GatewayError::Transport(format!("Failed to build HTTP client: {err}")))
}

fn parse_url(field: &str, value: &str) -> Result<url::Url, GatewayError> {
    url::Url::parse(value.trim())
        .map_err(|err| GatewayError::Config(format!("{field} is not a valid URL: {err}")))
}

/// Raw answer from the prepare collaborator.
#[derive(Debug, Clone)]
pub struct PrepareReply {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl PrepareReply {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// HTTP client for the three outbound calls of a stream: prepare, vendor
/// completion and lease release.
pub struct UpstreamTransport {
    client: reqwest::Client,
    prepare_url: url::Url,
    release_url: url::Url,
    completion_url: url::Url,
    internal_token: Option<HeaderValue>,
    vendor_headers: HeaderMap,
    prepare_timeout: Duration,
    release_timeout: Duration,
}

impl UpstreamTransport {
    /// Build the transport from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] for unusable URLs or headers and
    /// [`GatewayError::Transport`] when the HTTP client cannot be built.
    pub fn new(config: &AppConfig) -> Result<Self, GatewayError> {
        let internal_token = config
            .prepare
            .internal_token
            .as_deref()
            .map(|token| {
                HeaderValue::from_str(token.trim()).map_err(|_| {
                    GatewayError::Config("prepare.internal_token is not a valid header value".into())
                })
            })
            .transpose()?;

        let mut vendor_headers = HeaderMap::with_capacity(config.vendor.headers.len() + 2);
        for (name, value) in &config.vendor.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| GatewayError::Config(format!("invalid vendor header name '{name}'")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| GatewayError::Config(format!("invalid value for vendor header '{name}'")))?;
            vendor_headers.insert(name, value);
        }

        Ok(Self {
            client: build_reqwest_client(&config.server)?,
            prepare_url: parse_url("prepare.url", &config.prepare.url)?,
            release_url: parse_url("prepare.release_url", &config.prepare.release_url)?,
            completion_url: parse_url("vendor.completion_url", &config.vendor.completion_url)?,
            internal_token,
            vendor_headers,
            prepare_timeout: Duration::from_secs(config.prepare.timeout_secs),
            release_timeout: Duration::from_millis(config.prepare.release_timeout_ms),
        })
    }

    #[must_use]
    pub fn release_timeout(&self) -> Duration {
        self.release_timeout
    }

    fn internal_headers(&self, client_headers: Option<&HeaderMap>) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(6);
        if let Some(client_headers) = client_headers {
            for name in FORWARDED_CLIENT_HEADERS {
                if let Some(value) = client_headers.get(name) {
                    headers.insert(HeaderName::from_static(name), value.clone());
                }
            }
        }
        let content_type = client_headers
            .and_then(|headers| headers.get(CONTENT_TYPE))
            .filter(|value| !value.is_empty())
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, content_type);
        if let Some(token) = &self.internal_token {
            headers.insert(HeaderName::from_static(INTERNAL_TOKEN_HEADER), token.clone());
        }
        headers
    }

    /// Forward the raw client body to the prepare collaborator.
    ///
    /// Non-2xx answers are returned as-is; the caller decides how to relay them.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the collaborator is unreachable
    /// or its body cannot be read.
    pub async fn prepare(&self, client_headers: &HeaderMap, body: Bytes) -> Result<PrepareReply, GatewayError> {
        let response = self
            .client
            .post(self.prepare_url.clone())
            .headers(self.internal_headers(Some(client_headers)))
            .timeout(self.prepare_timeout)
            .body(body)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(format!("prepare request failed: {err}")))?;

        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let body = response
            .bytes()
            .await
            .map_err(|err| GatewayError::Transport(format!("prepare response unreadable: {err}")))?;
        Ok(PrepareReply {
            status,
            content_type,
            body,
        })
    }

    /// Open the vendor completion stream.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Upstream`] with the vendor status when it
    /// answers non-OK, or [`GatewayError::Transport`] when it is unreachable.
    pub async fn open_completion(
        &self,
        bearer_token: &str,
        pow_header: &str,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut headers = self.vendor_headers.clone();
        let authorization = HeaderValue::from_str(&format!("Bearer {bearer_token}"))
            .map_err(|_| GatewayError::Internal("vendor token is not a valid header value".into()))?;
        let pow = HeaderValue::from_str(pow_header)
            .map_err(|_| GatewayError::Internal("pow header is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(HeaderName::from_static(POW_RESPONSE_HEADER), pow);

        let body = serde_json::to_vec(payload)
            .map_err(|err| GatewayError::Internal(format!("failed to encode vendor payload: {err}")))?;

        let response = self
            .client
            .post(self.completion_url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(format!("Failed to get completion: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        let detail = detail.trim();
        let message = if detail.is_empty() {
            "Failed to get completion.".to_owned()
        } else {
            format!("Failed to get completion: {detail}")
        };
        Err(GatewayError::Upstream {
            status: status.as_u16(),
            message,
        })
    }

    /// POST `{"lease_id": ...}` to the release endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] on connection failure and
    /// [`GatewayError::Upstream`] on a non-2xx answer.
    pub async fn release_lease(&self, lease_id: &str) -> Result<(), GatewayError> {
        let body = serde_json::to_vec(&serde_json::json!({ "lease_id": lease_id }))
            .map_err(|err| GatewayError::Internal(format!("failed to encode release body: {err}")))?;
        let response = self
            .client
            .post(self.release_url.clone())
            .headers(self.internal_headers(None))
            .timeout(self.release_timeout)
            .body(body)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(format!("lease release failed: {err}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(GatewayError::Upstream {
                status: status.as_u16(),
                message: "lease release rejected".to_owned(),
            })
        }
    }
}

impl LeaseReleaser for UpstreamTransport {
    fn release<'a>(&'a self, lease_id: &'a str) -> BoxFuture<'a, Result<(), GatewayError>> {
        Box::pin(self.release_lease(lease_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn config(extra: &str) -> AppConfig {
        parse_config(&format!(
            "prepare:\n  url: http://127.0.0.1:5001/prepare\n  release_url: http://127.0.0.1:5001/release\n{extra}"
        ))
        .unwrap()
    }

    #[test]
    fn test_internal_headers_forward_client_auth() {
        let transport = UpstreamTransport::new(&config("  internal_token: secret\n")).unwrap();
        let mut client = HeaderMap::new();
        client.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-client"));
        client.insert("x-ds2-target-account", HeaderValue::from_static("acct-1"));
        client.insert("x-unrelated", HeaderValue::from_static("dropped"));

        let headers = transport.internal_headers(Some(&client));
        assert_eq!(headers[AUTHORIZATION], "Bearer sk-client");
        assert_eq!(headers["x-ds2-target-account"], "acct-1");
        assert_eq!(headers[INTERNAL_TOKEN_HEADER], "secret");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert!(headers.get("x-unrelated").is_none());
    }

    #[test]
    fn test_release_headers_carry_only_internal_token() {
        let transport = UpstreamTransport::new(&config("")).unwrap();
        let headers = transport.internal_headers(None);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_vendor_headers_and_timeouts_from_config() {
        let transport = UpstreamTransport::new(&config("  release_timeout_ms: 250\n")).unwrap();
        assert_eq!(transport.vendor_headers["x-client-platform"], "android");
        assert_eq!(transport.release_timeout(), Duration::from_millis(250));
        assert_eq!(transport.completion_url.host_str(), Some("chat.deepseek.com"));
    }
}
