//! Administrative HTTP surface consumed by the dashboard's backend workflows.

mod handlers;
mod routes;

pub use handlers::{admin_command, health, hub_status, prometheus_metrics};
pub use routes::api_routes;
