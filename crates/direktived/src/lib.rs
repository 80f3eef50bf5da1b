pub mod cloud;
pub mod config;
pub mod crypto;
pub mod directives;
pub mod dispatch;
pub mod entry;
pub mod hass;
pub mod publisher;
pub mod sensor;
pub mod server;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
