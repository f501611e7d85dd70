pub mod api;
pub mod config;
pub mod error;
pub mod observability;
pub mod routing;
pub mod session;
pub mod sieve;
pub mod state;
pub mod stream;
pub mod transport;

pub(crate) mod json_scan;
mod util;
