use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use hfprop_common::Season;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "HFPROP_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "hfprop.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Interval of the periodic propagation update
    #[serde(default = "default_update_interval_minutes")]
    pub update_interval_minutes: u64,

    /// Minimum time between two external feed fetches
    #[serde(default = "default_external_refresh_minutes")]
    pub external_refresh_minutes: u64,

    #[serde(default = "default_feed_timeout_secs")]
    pub feed_timeout_secs: u64,

    #[serde(default = "default_solar_flux_index")]
    pub solar_flux_index: i64,

    #[serde(default = "default_k_index")]
    pub k_index: i64,

    #[serde(default)]
    pub season: Season,

    #[serde(default = "default_true")]
    pub auto_time: bool,

    #[serde(default)]
    pub use_external_data: bool,

    #[serde(default)]
    pub use_dxview_data: bool,

    #[serde(default)]
    pub use_swpc_data: bool,

    /// Random walk of SFI/K while external data is off
    #[serde(default = "default_true")]
    pub solar_drift: bool,

    /// Channel id assigned to 160m, the other bands follow in order
    #[serde(default = "default_band_channel_base")]
    pub band_channel_base: u32,

    #[serde(default = "default_dxview_url")]
    pub dxview_url: String,

    #[serde(default = "default_swpc_flux_url")]
    pub swpc_flux_url: String,

    #[serde(default = "default_swpc_kindex_url")]
    pub swpc_kindex_url: String,

    #[serde(default = "default_true")]
    pub perform_initial_update: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_update_interval_minutes() -> u64 {
    5
}

fn default_external_refresh_minutes() -> u64 {
    30
}

fn default_feed_timeout_secs() -> u64 {
    10
}

fn default_solar_flux_index() -> i64 {
    120
}

fn default_k_index() -> i64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_band_channel_base() -> u32 {
    1
}

fn default_dxview_url() -> String {
    "https://www.hamqsl.com/solarxml.php".to_string()
}

fn default_swpc_flux_url() -> String {
    "https://services.swpc.noaa.gov/json/f107_cm_flux.json".to_string()
}

fn default_swpc_kindex_url() -> String {
    "https://services.swpc.noaa.gov/products/noaa-planetary-k-index.json".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            update_interval_minutes: default_update_interval_minutes(),
            external_refresh_minutes: default_external_refresh_minutes(),
            feed_timeout_secs: default_feed_timeout_secs(),
            solar_flux_index: default_solar_flux_index(),
            k_index: default_k_index(),
            season: Season::default(),
            auto_time: true,
            use_external_data: false,
            use_dxview_data: false,
            use_swpc_data: false,
            solar_drift: true,
            band_channel_base: default_band_channel_base(),
            dxview_url: default_dxview_url(),
            swpc_flux_url: default_swpc_flux_url(),
            swpc_kindex_url: default_swpc_kindex_url(),
            perform_initial_update: true,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path`, or fall back to defaults when the file does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.update_interval_minutes.max(1) * 60)
    }

    pub fn external_refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.external_refresh_minutes as i64)
    }

    pub fn feed_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.feed_timeout_secs.max(1))
    }
}

pub static CONFIG: OnceLock<EngineConfig> = OnceLock::new();

pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load the process-wide config once. Later calls return the loaded value.
pub fn read_config() -> anyhow::Result<&'static EngineConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let path = config_path();
    let config = EngineConfig::load_or_default(&path)?;
    Ok(CONFIG.get_or_init(|| config))
}
