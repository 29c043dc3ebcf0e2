use std::sync::Arc;

use crate::db::StoreManager;
use crate::services::queue::BrokerManager;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StoreManager>,
    pub broker: Arc<BrokerManager>,
}

impl AppState {
    pub fn new(store: StoreManager, broker: BrokerManager) -> Self {
        Self {
            store: Arc::new(store),
            broker: Arc::new(broker),
        }
    }
}
