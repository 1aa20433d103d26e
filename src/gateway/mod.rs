//! Venue Gateway (C3): market data, idempotent order submission, fees,
//! reservations, reconnection. See spec.md §4.3.

pub mod driver;
pub mod fees;
pub mod handle;
pub mod orders;
pub mod paper_driver;
pub mod reservation;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::errors::EngineError;
use crate::events::GatewayEvent;
use crate::types::VenueId;

pub use driver::{Capabilities, VenueDriver};
pub use handle::{HandleConfig, HandleState, VenueHandle};

/// Registry keyed by `VenueId`, see spec.md §9 "Dynamic access to venue
/// drivers". Built once by the supervisor and handed to the strategy engine.
pub struct VenueDriverRegistry {
    handles: HashMap<VenueId, Arc<VenueHandle>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl VenueDriverRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self { handles: HashMap::new(), events }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Registers a driver under `venue`. Each venue may partially fail to
    /// initialize upstream; that's handled by the supervisor, not here.
    pub fn register(&mut self, venue: VenueId, driver: Arc<dyn VenueDriver>, config: HandleConfig) {
        let handle = Arc::new(VenueHandle::new(venue.clone(), driver, config, self.events.clone()));
        self.handles.insert(venue, handle);
    }

    pub fn get(&self, venue: &VenueId) -> Option<Arc<VenueHandle>> {
        self.handles.get(venue).cloned()
    }

    pub fn venues(&self) -> impl Iterator<Item = &VenueId> {
        self.handles.keys()
    }

    pub fn handles(&self) -> impl Iterator<Item = &Arc<VenueHandle>> {
        self.handles.values()
    }

    pub async fn close_all(&self) {
        for handle in self.handles.values() {
            if let Err(e) = handle.close().await {
                tracing::warn!(venue = %handle.venue, error = %e, "error closing venue handle");
            }
        }
    }

    pub async fn cancel_all_open_orders(&self) {
        for handle in self.handles.values() {
            if let Err(e) = handle.cancel_all_open_orders().await {
                tracing::warn!(venue = %handle.venue, error = %e, "error cancelling open orders");
            }
        }
    }
}

impl Default for VenueDriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VenueDriverRegistry {
    pub fn require(&self, venue: &VenueId) -> Result<Arc<VenueHandle>, EngineError> {
        self.get(venue)
            .ok_or_else(|| EngineError::Config(format!("venue not registered: {venue}")))
    }
}
