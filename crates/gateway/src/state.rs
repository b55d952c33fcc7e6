//! Process-wide shared state handed to every connection handler.

use std::sync::Arc;

use vx_domain::config::Config;
use vx_providers::PoolManager;

use crate::bus::EventBus;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pools: Arc<PoolManager>,
    pub bus: Arc<EventBus>,
}
