//! Service layer for wish-market
//!
//! Services sit between callers (protocol layer, reconcilers) and the store:
//!
//! ```text
//! Protocol layer / reconcilers
//!     ↓
//! MarketService (validation, events)
//!     ↓
//! MarketStore (memory | sqlite)
//! ```

pub mod events;
pub mod market_service;

pub use events::{spawn_logging_listener, Event, EventLog, EventType};
pub use market_service::{MarketService, SYSTEM_ACTOR};

use std::sync::Arc;

use crate::config::Config;
use crate::error::MarketError;
use crate::store::{self, MarketStore};

/// Build the service for an already opened store
pub fn build(store: Arc<dyn MarketStore>, config: &Config) -> Arc<MarketService> {
    let events = Arc::new(EventLog::with_capacity(
        config.event_log_capacity,
        config.subscriber_buffer,
    ));
    Arc::new(MarketService::new(store, events))
}

/// Open the configured backend and wrap it in a service
pub fn open(config: &Config) -> Result<Arc<MarketService>, MarketError> {
    let store = store::open_store(config)?;
    Ok(build(store, config))
}
