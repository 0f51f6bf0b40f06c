//! Runtime configuration
//!
//! Loaded from a TOML file; every section has serde defaults so a
//! minimal config only needs the network subnets and the plant
//! credentials. Validation failures are fatal at startup and nowhere
//! else.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub intervals: IntervalConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub plant: PlantConfig,
}

impl AppConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::Validation("database path is required".into()));
        }
        if self.network.subnets.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "at least one network subnet is required".into(),
            ));
        }
        if self.plant.api_key.trim().is_empty() {
            return Err(ConfigError::Validation("plant API key is required".into()));
        }
        if self.plant.plant_id.trim().is_empty() {
            return Err(ConfigError::Validation("plant ID is required".into()));
        }
        self.http.socket_addr()?;
        Ok(())
    }
}

/// Durable state location
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "powerhive.db".to_string()
}

/// Discovery scan parameters
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// CIDR list to scan for miners.
    #[serde(default)]
    pub subnets: Vec<String>,

    /// TCP-connect timeout for the light sweep, in milliseconds.
    #[serde(default = "default_light_scan_timeout_ms")]
    pub light_scan_timeout_ms: u64,

    /// Per-call firmware request timeout, in milliseconds.
    #[serde(default = "default_miner_probe_timeout_ms")]
    pub miner_probe_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnets: Vec::new(),
            light_scan_timeout_ms: default_light_scan_timeout_ms(),
            miner_probe_timeout_ms: default_miner_probe_timeout_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn light_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.light_scan_timeout_ms.max(1))
    }

    pub fn miner_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.miner_probe_timeout_ms.max(1))
    }
}

fn default_light_scan_timeout_ms() -> u64 {
    300
}

fn default_miner_probe_timeout_ms() -> u64 {
    1500
}

/// Tick intervals for the periodic services, in seconds. Zero falls
/// back to the default.
#[derive(Debug, Clone, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_discovery_seconds")]
    pub discovery_seconds: u64,

    #[serde(default = "default_status_seconds")]
    pub status_seconds: u64,

    #[serde(default = "default_telemetry_seconds")]
    pub telemetry_seconds: u64,

    #[serde(default = "default_plant_seconds")]
    pub plant_seconds: u64,

    #[serde(default = "default_balancer_seconds")]
    pub balancer_seconds: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            discovery_seconds: default_discovery_seconds(),
            status_seconds: default_status_seconds(),
            telemetry_seconds: default_telemetry_seconds(),
            plant_seconds: default_plant_seconds(),
            balancer_seconds: default_balancer_seconds(),
        }
    }
}

impl IntervalConfig {
    pub fn discovery(&self) -> Duration {
        seconds_or(self.discovery_seconds, default_discovery_seconds())
    }

    pub fn status(&self) -> Duration {
        seconds_or(self.status_seconds, default_status_seconds())
    }

    pub fn telemetry(&self) -> Duration {
        seconds_or(self.telemetry_seconds, default_telemetry_seconds())
    }

    pub fn plant(&self) -> Duration {
        seconds_or(self.plant_seconds, default_plant_seconds())
    }

    pub fn balancer(&self) -> Duration {
        seconds_or(self.balancer_seconds, default_balancer_seconds())
    }
}

fn seconds_or(value: u64, fallback: u64) -> Duration {
    Duration::from_secs(if value == 0 { fallback } else { value })
}

fn default_discovery_seconds() -> u64 {
    30
}

fn default_status_seconds() -> u64 {
    15
}

fn default_telemetry_seconds() -> u64 {
    3600
}

fn default_plant_seconds() -> u64 {
    15
}

fn default_balancer_seconds() -> u64 {
    15
}

/// Dashboard server binding
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
        }
    }
}

impl HttpConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr
            .parse()
            .map_err(|_| ConfigError::Validation(format!("invalid http addr {:?}", self.addr)))
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Plant API source
#[derive(Debug, Clone, Deserialize)]
pub struct PlantConfig {
    #[serde(default = "default_plant_endpoint")]
    pub api_endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub plant_id: String,

    /// Echo projected consumption to the test plant server.
    #[serde(default)]
    pub test_mode: bool,

    #[serde(default)]
    pub test_server_url: Option<String>,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_plant_endpoint(),
            api_key: String::new(),
            plant_id: String::new(),
            test_mode: false,
            test_server_url: None,
        }
    }
}

fn default_plant_endpoint() -> String {
    "https://energy-aggregator.fly.dev/data/latest".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [network]
            subnets = ["10.0.0.0/24"]

            [plant]
            api_key = "secret"
            plant_id = "complexo-paranhos"
        "#
    }

    #[test]
    fn test_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("powerhive.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.plant.plant_id, "complexo-paranhos");
        assert!(AppConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.database.path, "powerhive.db");
        assert_eq!(config.network.light_scan_timeout_ms, 300);
        assert_eq!(config.network.miner_probe_timeout_ms, 1500);
        assert_eq!(config.intervals.discovery(), Duration::from_secs(30));
        assert_eq!(config.intervals.telemetry(), Duration::from_secs(3600));
        assert_eq!(config.http.addr, "0.0.0.0:8080");
        assert!(!config.plant.test_mode);
    }

    #[test]
    fn test_zero_interval_falls_back_to_default() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            subnets = ["10.0.0.0/24"]

            [intervals]
            plant_seconds = 0
            balancer_seconds = 60

            [plant]
            api_key = "secret"
            plant_id = "p"
        "#,
        )
        .unwrap();

        assert_eq!(config.intervals.plant(), Duration::from_secs(15));
        assert_eq!(config.intervals.balancer(), Duration::from_secs(60));
    }

    #[test]
    fn test_validation_requires_subnets_and_plant() {
        let config: AppConfig = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let config: AppConfig = toml::from_str(
            r#"
            [network]
            subnets = ["10.0.0.0/24"]
        "#,
        )
        .unwrap();
        assert!(config.validate().is_err(), "plant api key is required");
    }

    #[test]
    fn test_invalid_http_addr_is_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            subnets = ["10.0.0.0/24"]

            [http]
            addr = ":8080"

            [plant]
            api_key = "secret"
            plant_id = "p"
        "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
