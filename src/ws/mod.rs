pub mod handler;
pub mod message;
pub mod session;

pub use handler::ws_handler;
