use std::sync::Arc;

use application::{Authenticator, RelayEngine};
use config::RelayConfig;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RelayEngine>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(
        engine: Arc<RelayEngine>,
        authenticator: Arc<dyn Authenticator>,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            engine,
            authenticator,
            config,
        }
    }
}
