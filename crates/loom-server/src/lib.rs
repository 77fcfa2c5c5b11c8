use std::net::SocketAddr;
use std::sync::Arc;

use loom_orchestrator::SessionController;

mod http;

pub use http::serve;

/// Read-only state shared by every handler: the dashboard never mutates
/// the session document, only observes it.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SessionController>,
}

impl AppState {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }
}

pub fn dashboard_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
