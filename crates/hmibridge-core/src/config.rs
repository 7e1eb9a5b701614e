//! Bridge configuration.
//!
//! Configuration is read from a TOML file or a JSON options file (the format
//! the Home Assistant add-on supervisor writes to `/data/options.json`).
//! Keys absent from the file fall back to environment variables, then to the
//! built-in defaults below.
//!
//! ```toml
//! device_host = "http://192.168.1.50/"
//! username = "ADMIN"
//! password = "SBTAdmin!"
//! poll_interval = 60
//! include_pages = ["HMI00001.cgi", "HMI00033.cgi"]
//! profile = "monitor"
//!
//! [mqtt]
//! host = "core-mosquitto"
//! port = 1883
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Built-in defaults.
pub mod defaults {
    /// The device cannot sustain faster polling.
    pub const MIN_POLL_INTERVAL_SECS: u64 = 30;
    pub const POLL_INTERVAL_SECS: u64 = 30;
    pub const DISCOVERY_PREFIX: &str = "homeassistant";
    pub const BASE_TOPIC: &str = "benekov";
    pub const MQTT_HOST: &str = "core-mosquitto";
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_KEEP_ALIVE_SECS: u64 = 30;
    pub const HTTP_TIMEOUT_SECS: u64 = 10;
    /// Delay between a successful write and the refresh poll.
    pub const WRITE_SETTLE_MILLIS: u64 = 500;
    /// Home page; carries the baseline monitoring points.
    pub const CRITICAL_PAGE: &str = "HMI00001.cgi";
    /// Home, alarms, feeder/fan.
    pub const PAGES: &[&str] = &["HMI00001.cgi", "HMI65000.cgi", "HMI00033.cgi"];
}

/// Environment variable names.
pub mod env_vars {
    pub const HMI_BASE_URL: &str = "HMI_BASE_URL";
    pub const HMI_USER: &str = "HMI_USER";
    pub const HMI_PASS: &str = "HMI_PASS";
    pub const HMI_PROFILE: &str = "HMI_PROFILE";
    pub const HMI_LANGUAGE: &str = "HMI_LANGUAGE";
    pub const POLL_INTERVAL: &str = "POLL_INTERVAL";
    pub const DISCOVERY_PREFIX: &str = "DISCOVERY_PREFIX";
    pub const BASE_TOPIC: &str = "BASE_TOPIC";
    pub const INCLUDE_PAGES: &str = "INCLUDE_PAGES";
    pub const MQTT_HOST: &str = "MQTT_HOST";
    pub const MQTT_PORT: &str = "MQTT_PORT";
    pub const MQTT_USER: &str = "MQTT_USER";
    pub const MQTT_PASS: &str = "MQTT_PASS";
    /// Config file path for the binary.
    pub const CONFIG: &str = "HMIBRIDGE_CONFIG";
    /// `true` switches log output to JSON.
    pub const LOG_JSON: &str = "HMIBRIDGE_LOG_JSON";
}

/// Read an environment variable, treating empty and placeholder values as unset.
pub fn env_value(name: &str) -> Option<String> {
    normalize_env_value(std::env::var(name).ok())
}

/// Supervisor-generated environments pass `null`/`None` for unset options.
pub fn normalize_env_value(value: Option<String>) -> Option<String> {
    value.filter(|v| !matches!(v.as_str(), "" | "null" | "None"))
}

fn env_or(name: &str, default: &str) -> String {
    env_value(name).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_value(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Synchronization profile.
///
/// Anything other than `all` selects the read-only monitor profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Profile {
    /// Whitelisted, read-only entities.
    Monitor,
    /// Every parsed entity, writes enabled.
    All,
}

impl From<String> for Profile {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<&str> for Profile {
    fn from(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("all") {
            Self::All
        } else {
            Self::Monitor
        }
    }
}

/// One allow-listed point for the monitor profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistRule {
    /// Page the point lives on, e.g. `HMI00001.cgi`.
    pub page: String,
    /// Object id, e.g. `o044`.
    #[serde(alias = "id")]
    pub object_id: String,
    /// Friendly label override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Unit override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl WhitelistRule {
    pub fn new(page: &str, object_id: &str, label: &str, unit: Option<&str>) -> Self {
        Self {
            page: page.to_string(),
            object_id: object_id.to_string(),
            label: Some(label.to_string()),
            unit: unit.map(str::to_string),
        }
    }
}

/// Default monitor whitelist.
pub fn default_whitelist() -> Vec<WhitelistRule> {
    vec![
        WhitelistRule::new("HMI00001.cgi", "o044", "Aktuální výkon", Some("%")),
        WhitelistRule::new("HMI00001.cgi", "o075", "B2 Teplota kotle", Some("°C")),
        WhitelistRule::new("HMI00001.cgi", "o082", "B7 Teplota zpátečky", Some("°C")),
        WhitelistRule::new("HMI00001.cgi", "o089", "B8 Teplota spalin", Some("°C")),
        WhitelistRule::new("HMI00001.cgi", "o038", "Stav kotle", None),
        WhitelistRule::new("HMI00001.cgi", "o148", "Palivo", None),
        WhitelistRule::new("HMI65000.cgi", "o011", "Alarmy aktivní", None),
        WhitelistRule::new("HMI65000.cgi", "o018", "Alarmy historie", None),
        WhitelistRule::new("HMI65000.cgi", "o025", "Alarm ID", None),
        WhitelistRule::new("HMI00033.cgi", "o010", "Čas podávání", Some("s")),
        WhitelistRule::new("HMI00033.cgi", "o020", "Výkon ventilátoru", Some("%")),
    ]
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_username")]
    pub username: String,
    #[serde(default = "default_mqtt_password")]
    pub password: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

fn default_mqtt_host() -> String {
    env_or(env_vars::MQTT_HOST, defaults::MQTT_HOST)
}

fn default_mqtt_port() -> u16 {
    env_parse_or(env_vars::MQTT_PORT, defaults::MQTT_PORT)
}

fn default_mqtt_username() -> String {
    env_or(env_vars::MQTT_USER, "")
}

fn default_mqtt_password() -> String {
    env_or(env_vars::MQTT_PASS, "")
}

fn default_keep_alive() -> u64 {
    defaults::MQTT_KEEP_ALIVE_SECS
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: default_mqtt_username(),
            password: default_mqtt_password(),
            keep_alive: default_keep_alive(),
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Device web console base URL.
    #[serde(default = "default_device_host", alias = "base_url")]
    pub device_host: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Requested poll interval in seconds; see [`BridgeConfig::poll_interval`].
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    /// Pages to synchronize. Empty selects [`defaults::PAGES`].
    #[serde(default = "default_include_pages")]
    pub include_pages: Vec<String>,
    #[serde(default = "default_profile")]
    pub profile: Profile,
    /// Language slot used when resolving localized labels.
    #[serde(default = "default_language_index")]
    pub language_index: usize,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,
    #[serde(default)]
    pub mqtt: MqttSettings,
    /// Monitor profile allow-list.
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<WhitelistRule>,
}

fn default_device_host() -> String {
    env_or(env_vars::HMI_BASE_URL, "")
}

fn default_username() -> String {
    env_or(env_vars::HMI_USER, "")
}

fn default_password() -> String {
    env_or(env_vars::HMI_PASS, "")
}

fn default_poll_interval() -> u64 {
    env_parse_or(env_vars::POLL_INTERVAL, defaults::POLL_INTERVAL_SECS)
}

fn default_discovery_prefix() -> String {
    env_or(env_vars::DISCOVERY_PREFIX, defaults::DISCOVERY_PREFIX)
}

fn default_base_topic() -> String {
    env_or(env_vars::BASE_TOPIC, defaults::BASE_TOPIC)
}

fn default_include_pages() -> Vec<String> {
    env_value(env_vars::INCLUDE_PAGES)
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn default_profile() -> Profile {
    env_value(env_vars::HMI_PROFILE)
        .map(Profile::from)
        .unwrap_or(Profile::Monitor)
}

fn default_language_index() -> usize {
    env_parse_or(env_vars::HMI_LANGUAGE, 0)
}

fn default_http_timeout() -> u64 {
    defaults::HTTP_TIMEOUT_SECS
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_host: default_device_host(),
            username: default_username(),
            password: default_password(),
            poll_interval: default_poll_interval(),
            discovery_prefix: default_discovery_prefix(),
            base_topic: default_base_topic(),
            include_pages: default_include_pages(),
            profile: default_profile(),
            language_index: default_language_index(),
            http_timeout: default_http_timeout(),
            mqtt: MqttSettings::default(),
            whitelist: default_whitelist(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `path`, or from the environment alone when
    /// no path is given. Files ending in `.json` are parsed as JSON, anything
    /// else as TOML.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            tracing::info!(category = "config", "Loading config from environment variables");
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        tracing::info!(category = "config", path = %path.display(), "Loading config file");

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Parse TOML configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Parse JSON configuration.
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("Invalid JSON: {}", e)))
    }

    /// Reject configurations nothing useful can run with.
    pub fn validate(&self) -> Result<()> {
        if self.device_host.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "device_host is not set (file key `device_host` or env {})",
                env_vars::HMI_BASE_URL
            )));
        }
        if self.base_topic.trim().is_empty() {
            return Err(Error::Configuration("base_topic must not be empty".into()));
        }
        Ok(())
    }

    /// Device base URL with a scheme and a trailing slash.
    pub fn base_url(&self) -> String {
        let host = self.device_host.trim();
        let mut url = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        };
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }

    /// Effective poll interval, never below [`defaults::MIN_POLL_INTERVAL_SECS`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(defaults::MIN_POLL_INTERVAL_SECS))
    }

    /// Effective HTTP timeout.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout.max(1))
    }

    /// Pages to synchronize.
    pub fn pages(&self) -> Vec<String> {
        let pages: Vec<String> = self
            .include_pages
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if pages.is_empty() {
            defaults::PAGES.iter().map(|p| p.to_string()).collect()
        } else {
            pages
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.profile == Profile::Monitor
    }
}
