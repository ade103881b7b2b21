//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hub.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: bind address and allowed CORS origins.
//!     - StorageConfig: where the json data files and daily logs live.
//!     - GeofenceConfig: alert dedup window and alert list cap.
//!     - SpeedLimitConfig: max settable limit and log caps.
//!     - WebsocketConfig: broadcast buffer size.
//!     - LoggingConfig: default log level.
//!
//! every section is optional in the file; missing sections use defaults.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// env var that points at an explicit config file
pub const CONFIG_ENV: &str = "SMART_CYCLE_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub geofence: GeofenceConfig,
    #[serde(default)]
    pub speed_limit: SpeedLimitConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// "*" or a comma separated list of origins
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            cors_origin: "*".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// defaults to `<data_dir>/daily`
    pub daily_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            daily_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn daily_dir(&self) -> PathBuf {
        self.daily_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("daily"))
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeofenceConfig {
    /// a second breach alert for the same bike inside this window is dropped
    pub alert_dedup_minutes: i64,
    pub max_alerts: usize,
    /// how many active alerts a new websocket client receives
    pub recent_alerts: usize,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            alert_dedup_minutes: 5,
            max_alerts: 100,
            recent_alerts: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SpeedLimitConfig {
    /// km/h
    pub max_limit: f64,
    pub max_violations: usize,
    pub max_history: usize,
}

impl Default for SpeedLimitConfig {
    fn default() -> Self {
        Self {
            max_limit: 200.0,
            max_violations: 5000,
            max_history: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebsocketConfig {
    pub channel_capacity: usize,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self { channel_capacity: 256 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// log every accepted report at info instead of debug
    pub show_bike_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_bike_data: false,
        }
    }
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: HubConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback
    ///
    /// returns the config plus the file it came from, `None` meaning the
    /// built-in defaults. an explicit path from SMART_CYCLE_CONFIG must
    /// load. a well-known location that exists but does not parse is an
    /// error too; only missing files fall through to the defaults.
    pub fn load_or_default() -> anyhow::Result<(Self, Option<PathBuf>)> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            let config = Self::load(&explicit)?;
            return Ok((config, Some(PathBuf::from(explicit))));
        }

        let paths = [
            PathBuf::from("config").join("hub.toml"),
            PathBuf::from("..").join("config").join("hub.toml"),
        ];

        match Self::load_first(&paths)? {
            Some((config, path)) => Ok((config, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// first existing file of `paths`, parsed
    fn load_first(paths: &[PathBuf]) -> anyhow::Result<Option<(Self, PathBuf)>> {
        for path in paths {
            if path.exists() {
                let config = Self::load(path).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
                return Ok(Some((config, path.clone())));
            }
        }
        Ok(None)
    }

    /// Log where the config came from and what it says
    pub fn log_source(&self, source: Option<&Path>) {
        match source {
            Some(path) => info!("[CONFIG] Loaded from {}", path.display()),
            None => warn!("[CONFIG] No config file found - using defaults"),
        }
        self.log_summary();
    }

    /// Log configuration summary
    fn log_summary(&self) {
        info!("Bind address: {}:{}", self.server.host, self.server.port);
        info!("CORS origin: {}", self.server.cors_origin);
        info!("Data dir: {}", self.storage.data_dir.display());
        info!("Daily log dir: {}", self.storage.daily_dir().display());
        info!(
            "Alert dedup window: {} min, cap {}",
            self.geofence.alert_dedup_minutes, self.geofence.max_alerts
        );
        info!("Max speed limit: {} km/h", self.speed_limit.max_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            [server]
            port = 8080

            [storage]
            data_dir = "/var/lib/smart-cycle"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.daily_dir(), PathBuf::from("/var/lib/smart-cycle/daily"));
        assert_eq!(config.geofence.alert_dedup_minutes, 5);
        assert_eq!(config.speed_limit.max_violations, 5000);
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config: HubConfig = toml::from_str("").unwrap();
        assert_eq!(config.geofence.max_alerts, 100);
        assert_eq!(config.storage.file("bikes.json"), PathBuf::from("data/bikes.json"));
    }

    #[test]
    fn test_broken_well_known_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("hub.toml");
        std::fs::write(&broken, "[server]\nport = \"not a number\"\n").unwrap();
        let missing = dir.path().join("absent.toml");

        let err = HubConfig::load_first(&[missing.clone(), broken.clone()]).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"), "{err}");
        assert!(err.to_string().contains("hub.toml"), "{err}");

        assert!(HubConfig::load_first(&[missing]).unwrap().is_none());
    }

    #[test]
    fn test_load_first_picks_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("hub.toml");
        std::fs::write(&good, "[server]\nport = 9000\n").unwrap();

        let (config, path) = HubConfig::load_first(&[dir.path().join("absent.toml"), good.clone()])
            .unwrap()
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(path, good);
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = HubConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
