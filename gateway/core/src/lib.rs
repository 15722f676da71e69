#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod assembler;
pub mod config;
pub mod events;
pub mod gateway;
pub mod scheduler;

pub use config::{ConfigError, ConfigUpdate, GatewayConfig};
pub use gateway::{Gateway, GatewayError};

/// Version reported to the OTA endpoint.
pub const FIRMWARE_VERSION: &str = "1.4.2";
