//! Typed gateway configuration. Loaded from TOML, validated as a whole,
//! and updated atomically: a partial update is merged into a candidate,
//! the candidate is validated, and only then swapped in. Unknown options
//! are rejected at parse time.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// A field is out of bounds; the message names it.
    Invalid(&'static str),
    /// The file or blob could not be read or parsed.
    Unparseable,
}

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

const SUPPORTED_BAUD: [u32; 6] = [9_600, 19_200, 38_400, 57_600, 115_200, 230_400];

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub device_id: String,
    pub data_dir: String,
    pub gateway_address: u8,

    // Bus
    pub bus_baud: u32,
    pub bus_parity: char,
    pub response_timeout_ms: u32,
    pub max_retries: u8,

    // Storage
    pub enable_compression: bool,
    pub compression_level: u32,
    pub max_file_size_bytes: u32,
    pub capacity_bytes: u64,
    pub flush_buffer_bytes: u32,
    pub cleanup_threshold_percent: u8,

    // Cloud
    pub server_url: String,
    pub api_key: String,
    pub use_https: bool,

    // Task periods
    pub sensor_poll_ms: u32,
    pub telemetry_flush_ms: u32,
    pub heartbeat_ms: u32,
    pub ota_poll_ms: u32,
}

impl Default for GatewayConfig {
    fn default() -> GatewayConfig {
        GatewayConfig {
            device_id: "edge-0000".to_string(),
            data_dir: "/var/lib/gateway".to_string(),
            gateway_address: 1,
            bus_baud: 115_200,
            bus_parity: 'E',
            response_timeout_ms: 200,
            max_retries: 3,
            enable_compression: true,
            compression_level: 3,
            max_file_size_bytes: 1024 * 1024,
            capacity_bytes: 256 * 1024 * 1024,
            flush_buffer_bytes: 32 * 1024,
            cleanup_threshold_percent: 90,
            server_url: "https://iot.example.com".to_string(),
            api_key: String::new(),
            use_https: true,
            sensor_poll_ms: 250,
            telemetry_flush_ms: 5_000,
            heartbeat_ms: 30_000,
            ota_poll_ms: 3_600_000,
        }
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<GatewayConfig, ConfigError> {
        let config: GatewayConfig =
            serdeconv::from_toml_file(path).map_err(|_| ConfigError::Unparseable)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::Invalid("device_id"));
        }

        if self.data_dir.is_empty() {
            return Err(ConfigError::Invalid("data_dir"));
        }

        if self.gateway_address < 1 || self.gateway_address > 247 {
            return Err(ConfigError::Invalid("gateway_address"));
        }

        if !SUPPORTED_BAUD.contains(&self.bus_baud) {
            return Err(ConfigError::Invalid("bus_baud"));
        }

        if !matches!(self.bus_parity, 'N' | 'E' | 'O') {
            return Err(ConfigError::Invalid("bus_parity"));
        }

        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid("response_timeout_ms"));
        }

        if self.compression_level < 1 || self.compression_level > 22 {
            return Err(ConfigError::Invalid("compression_level"));
        }

        if self.cleanup_threshold_percent > 100 {
            return Err(ConfigError::Invalid("cleanup_threshold_percent"));
        }

        if self.max_file_size_bytes == 0
            || u64::from(self.max_file_size_bytes) > self.capacity_bytes
        {
            return Err(ConfigError::Invalid("max_file_size_bytes"));
        }

        if self.flush_buffer_bytes == 0 || self.flush_buffer_bytes > self.max_file_size_bytes {
            return Err(ConfigError::Invalid("flush_buffer_bytes"));
        }

        if self.sensor_poll_ms == 0
            || self.telemetry_flush_ms == 0
            || self.heartbeat_ms == 0
            || self.ota_poll_ms == 0
        {
            return Err(ConfigError::Invalid("task period"));
        }

        self.server_endpoint()?;

        Ok(())
    }

    /// Host and port from `server_url`. The scheme prefix is optional and
    /// only the authority is used; `use_https` decides the default port.
    pub fn server_endpoint(&self) -> Result<(String, u16), ConfigError> {
        let trimmed = self
            .server_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');

        if trimmed.is_empty() {
            return Err(ConfigError::Invalid("server_url"));
        }

        match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(ConfigError::Invalid("server_url"));
                }

                let port: u16 = port.parse().map_err(|_| ConfigError::Invalid("server_url"))?;
                Ok((host.to_string(), port))
            }
            None => {
                let port = if self.use_https {
                    DEFAULT_HTTPS_PORT
                } else {
                    DEFAULT_HTTP_PORT
                };

                Ok((trimmed.to_string(), port))
            }
        }
    }

    /// Applies a partial update atomically: the merged candidate must
    /// validate before anything changes. Returns whether a swap happened.
    pub fn apply(&mut self, update: &ConfigUpdate) -> Result<bool, ConfigError> {
        let candidate = update.merged_into(self);
        candidate.validate()?;

        let changed = candidate != *self;
        *self = candidate;

        Ok(changed)
    }
}

/// Partial configuration as pushed by the cloud or an operator. Unknown
/// options fail the parse outright.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    pub device_id: Option<String>,
    pub data_dir: Option<String>,
    pub gateway_address: Option<u8>,
    pub bus_baud: Option<u32>,
    pub bus_parity: Option<char>,
    pub response_timeout_ms: Option<u32>,
    pub max_retries: Option<u8>,
    pub enable_compression: Option<bool>,
    pub compression_level: Option<u32>,
    pub max_file_size_bytes: Option<u32>,
    pub capacity_bytes: Option<u64>,
    pub flush_buffer_bytes: Option<u32>,
    pub cleanup_threshold_percent: Option<u8>,
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub use_https: Option<bool>,
    pub sensor_poll_ms: Option<u32>,
    pub telemetry_flush_ms: Option<u32>,
    pub heartbeat_ms: Option<u32>,
    pub ota_poll_ms: Option<u32>,
}

impl ConfigUpdate {
    pub fn from_toml(blob: &str) -> Result<ConfigUpdate, ConfigError> {
        serdeconv::from_toml_str(blob).map_err(|_| ConfigError::Unparseable)
    }

    fn merged_into(&self, base: &GatewayConfig) -> GatewayConfig {
        macro_rules! pick {
            ($field:ident) => {
                self.$field.clone().unwrap_or_else(|| base.$field.clone())
            };
        }

        GatewayConfig {
            device_id: pick!(device_id),
            data_dir: pick!(data_dir),
            gateway_address: pick!(gateway_address),
            bus_baud: pick!(bus_baud),
            bus_parity: pick!(bus_parity),
            response_timeout_ms: pick!(response_timeout_ms),
            max_retries: pick!(max_retries),
            enable_compression: pick!(enable_compression),
            compression_level: pick!(compression_level),
            max_file_size_bytes: pick!(max_file_size_bytes),
            capacity_bytes: pick!(capacity_bytes),
            flush_buffer_bytes: pick!(flush_buffer_bytes),
            cleanup_threshold_percent: pick!(cleanup_threshold_percent),
            server_url: pick!(server_url),
            api_key: pick!(api_key),
            use_https: pick!(use_https),
            sensor_poll_ms: pick!(sensor_poll_ms),
            telemetry_flush_ms: pick!(telemetry_flush_ms),
            heartbeat_ms: pick!(heartbeat_ms),
            ota_poll_ms: pick!(ota_poll_ms),
        }
    }
}
