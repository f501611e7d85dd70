use std::sync::Arc;

use crate::config::AppConfig;
use crate::session::{LeaseGuard, LeaseReleaser};
use crate::stream::SkipPaths;
use crate::transport::UpstreamTransport;

/// Shared application state accessible to all handlers. Immutable after
/// startup; per-stream state lives in each request's session.
pub struct AppState {
    pub config: AppConfig,
    pub transport: Arc<UpstreamTransport>,
    pub skip_paths: Arc<SkipPaths>,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, transport: UpstreamTransport) -> Self {
        let skip_paths = Arc::new(SkipPaths::from_config(&config.classifier));
        Self {
            config,
            transport: Arc::new(transport),
            skip_paths,
        }
    }

    /// Lease guard releasing through this server's transport.
    #[must_use]
    pub fn lease_guard(&self, lease_id: Option<String>) -> LeaseGuard {
        let releaser: Arc<dyn LeaseReleaser> = self.transport.clone();
        LeaseGuard::new(lease_id, releaser, self.transport.release_timeout())
    }
}
