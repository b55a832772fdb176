//! Application state.

use std::sync::Arc;

use vparser_queue::{Broker, Publisher};
use vparser_store::JobStore;

use crate::auth::ApiKeyRegistry;
use crate::config::ApiConfig;
use crate::services::RequestLifecycle;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn Broker>,
    pub publisher: Publisher,
    pub api_keys: Arc<ApiKeyRegistry>,
    pub lifecycle: RequestLifecycle,
}

impl AppState {
    /// Assemble state from already-connected dependencies.
    pub fn new(
        config: ApiConfig,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        publisher: Publisher,
        api_keys: ApiKeyRegistry,
    ) -> Self {
        let lifecycle = RequestLifecycle::new(Arc::clone(&store), publisher.clone());
        Self {
            config,
            store,
            broker,
            publisher,
            api_keys: Arc::new(api_keys),
            lifecycle,
        }
    }
}
