mod settings;

pub use settings::{AuthConfig, HubConfig, ServerConfig, Settings};
