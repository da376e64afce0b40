//! # Relay Service Configuration
//!
//! Layered configuration for the broker relay: built-in defaults, an
//! optional TOML file, `RELAY__*` environment variables and the `URL_AMQP`
//! override for the broker URL.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use service_config::RelayServiceConfig;
//!
//! let config = RelayServiceConfig::load(None)?;
//! let policy = config.reconnect_policy();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod service;
pub mod service_config;

// Re-export commonly used types
pub use service_config::{
    BrokerSettings, ConsumerSettings, LoggingSettings, PublisherSettings,
    ReconnectKind, ReconnectSettings, RelayServiceConfig,
};
