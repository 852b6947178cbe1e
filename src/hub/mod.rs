//! The connection hub core: registry, subscriptions, routing, liveness and
//! the external publish surface. Transport glue lives in `crate::ws`.

mod clock;
mod heartbeat;
mod publisher;
mod registry;
mod router;
mod subscriptions;

pub use clock::{Clock, ManualClock, SystemClock};
pub use heartbeat::HeartbeatMonitor;
pub use publisher::{EventPublisher, HubStats};
pub use registry::{
    ConnectionHandle, ConnectionRegistry, Outbound, RegistryError, RegistryStats, TransportClosed,
    Unregistered,
};
pub use router::{BroadcastRouter, DeliveryReport};
pub use subscriptions::SubscriptionManager;
