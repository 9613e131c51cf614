//! Configuration management for the courtside booking core
//!
//! This module handles loading and validating configuration from environment
//! variables and an optional TOML file. The platform's RSA public key, its
//! endpoint paths and the rate-limit classification are all static
//! configuration here; none of it is discovered at runtime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::error::BookingError;

/// Platform public key used for the `sid`/`tim` order headers.
///
/// This is the key the platform currently publishes. If the platform rotates
/// it, deploy a new value via `COURTSIDE_RSA_PUBLIC_KEY`; there is no
/// self-discovery.
pub const DEFAULT_RSA_PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEArKZOdKQAL+iYzJ4Q5EQzwv/yvVPnfdNVKRgNG19HbCYM4qIzFPEOFv28SVFQh+xqAj8tAfjpMSTihFwt6BQuWfZXWYpAqf4jF4cU7ez/VHJyzsn8Cb7Lf/1KsLpuz+MbqufrA57AysnLAnRXHOwik+QnpsXZYjTcjgxQ0iLMe5iJyo06CKFxH1rmgYMwS4E89kNg1VtYrFKs1MajApfhu9hTEXnm/lP24TPdefRXbf+z84p1GLue2HRhZs3wECH1HJWZOsrdL/M+wigWldY0fHoiaKsjD9rK1NyaPtk4bIYuwPsfQu5RN4hkEPpTvdw1nKzOdo77zNa5ovCY0uNLZwIDAQAB
-----END PUBLIC KEY-----";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Platform configuration (base URL, endpoints, keys)
    #[serde(default)]
    pub platform: PlatformConfig,

    /// HTTP client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Monitor defaults
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Precision scheduler configuration
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Account failover configuration
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Local data and credential store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Platform-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Base URL for all API requests
    pub base_url: String,

    /// API endpoint paths
    pub endpoints: EndpointSet,

    /// PEM-encoded RSA public key for order header encryption
    pub rsa_public_key: String,

    /// Return URL embedded in the order payload
    pub return_url: String,

    /// Browser User-Agent presented on every request
    pub user_agent: String,

    /// Preset venue/field-type pairs selectable by index
    pub presets: Vec<Preset>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let base_url = "https://sports.sjtu.edu.cn".to_string();
        Self {
            return_url: format!("{base_url}/#/paymentResult/1"),
            base_url,
            endpoints: EndpointSet::default(),
            rsa_public_key: DEFAULT_RSA_PUBLIC_KEY.to_string(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0 Safari/537.36"
                .to_string(),
            presets: default_presets(),
        }
    }
}

/// API endpoint paths, relative to the base URL unless absolute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSet {
    pub current_user: String,
    pub list_venues: String,
    pub venue_detail: String,
    pub field_situation: String,
    pub field_reserve: String,
    pub order_submit: String,
    pub order_confirm: String,
    pub login_prepare: String,
    pub login_submit: String,
    pub login_captcha: String,
    pub ping: String,
}

impl Default for EndpointSet {
    fn default() -> Self {
        Self {
            current_user: "/system/user/currentUser".into(),
            list_venues: "/manage/venue/listOrderCount".into(),
            venue_detail: "/manage/venue/queryVenueById".into(),
            field_situation: "/manage/fieldDetail/queryFieldSituation".into(),
            field_reserve: "/manage/fieldDetail/queryFieldReserveSituationIsFull".into(),
            order_submit: "/venue/personal/orderImmediatelyPC".into(),
            order_confirm: "/venue/personal/ConfirmOrder".into(),
            login_prepare: "https://jaccount.sjtu.edu.cn/oauth2/authorize".into(),
            login_submit: "https://jaccount.sjtu.edu.cn/jaccount/ulogin".into(),
            login_captcha: "https://jaccount.sjtu.edu.cn/jaccount/captcha".into(),
            ping: "/".into(),
        }
    }
}

/// A venue + field-type pair selectable by a small index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub index: u16,
    pub venue_id: String,
    pub venue_name: String,
    pub field_type_id: String,
    pub field_type_name: String,
}

/// Built-in preset table; overridable via `COURTSIDE_PRESETS_JSON`
fn default_presets() -> Vec<Preset> {
    vec![
        Preset {
            index: 1,
            venue_id: "d784ad7c-cb24-4282-afd6-a67aec68c675".into(),
            venue_name: "学生中心".into(),
            field_type_id: "7d46c0a4-3ae6-4398-822b-d4b7b37085fa".into(),
            field_type_name: "学生中心健身房".into(),
        },
        Preset {
            index: 5,
            venue_id: "3b10ff47-7e83-4c21-816c-5edc257168c1".into(),
            venue_name: "气膜体育中心".into(),
            field_type_id: "29942202-d2ac-448e-90b7-14d3c6be19ff".into(),
            field_type_name: "羽毛球".into(),
        },
        Preset {
            index: 6,
            venue_id: "3b10ff47-7e83-4c21-816c-5edc257168c1".into(),
            venue_name: "气膜体育中心".into(),
            field_type_id: "8dc0e52c-564a-4d9a-9cb2-08477f1a18d4".into(),
            field_type_name: "篮球".into(),
        },
    ]
}

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Request timeout in seconds for query traffic
    pub request_timeout_secs: u64,

    /// Request timeout in seconds for order submission (fail fast)
    pub order_timeout_secs: u64,

    /// Rate limit for polling traffic (requests per second)
    pub rate_limit: u32,

    /// Maximum retry attempts for retryable query failures
    pub max_retries: u32,

    /// Base delay in milliseconds for retry backoff
    pub base_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            order_timeout_secs: 3,
            rate_limit: 4,
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }
}

/// Default monitor behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between poll ticks
    pub interval_secs: u64,

    /// Book automatically when a matching window appears
    pub auto_book: bool,

    /// Preferred start hours, in priority order
    pub preferred_hours: Vec<u8>,

    /// Preferred day offsets from today (empty = any)
    pub preferred_days: Vec<u8>,

    /// Hour range within which the monitor actively polls
    pub operating_start_hour: u8,
    pub operating_end_hour: u8,

    /// Hard cap on total monitor runtime in seconds (0 = unlimited)
    pub max_runtime_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 240,
            auto_book: false,
            preferred_hours: vec![19, 20],
            preferred_days: Vec::new(),
            operating_start_hour: 7,
            operating_end_hour: 23,
            max_runtime_secs: 0,
        }
    }
}

/// Precision scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Daily fire time (local wall clock)
    pub hour: u8,
    pub minute: u8,
    pub second: u8,

    /// How many days ahead the fired booking targets
    pub date_offset_days: i64,

    /// Candidate start hours in priority order
    pub start_hours: Vec<u8>,

    /// Warm-up lead before the fire instant, in seconds
    pub warmup_secs: u64,

    /// Firing burst: first attempt this many ms before the instant
    pub pre_fire_ms: u64,

    /// Firing burst: delay between attempts in ms
    pub attempt_interval_ms: u64,

    /// Firing burst: hard cap on attempts
    pub max_attempts: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hour: 12,
            minute: 0,
            second: 0,
            date_offset_days: 7,
            start_hours: vec![18, 19, 20],
            warmup_secs: 35,
            pre_fire_ms: 300,
            attempt_interval_ms: 350,
            max_attempts: 8,
        }
    }
}

/// Account failover configuration
///
/// The exact signals that mean "rate limited" are tunable: the platform has
/// been observed to answer with HTTP 500 plus a throttling message rather
/// than 429.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Business codes classified as rate limiting
    pub rate_limit_codes: Vec<i64>,

    /// Message substrings classified as rate limiting
    pub rate_limit_patterns: Vec<String>,

    /// Consecutive transport-level 5xx responses treated as rate limiting
    pub server_error_threshold: u32,

    /// In all-success mode, how far (hours) an adjacent slot may sit from
    /// the first successful booking
    pub max_adjacent_offset_hours: u8,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            rate_limit_codes: vec![500],
            rate_limit_patterns: vec!["频繁".into(), "too many".into(), "rate".into()],
            server_error_threshold: 2,
            max_adjacent_offset_hours: 1,
        }
    }
}

/// Local data directory and credential store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the job table, job logs and credentials
    pub data_dir: PathBuf,

    /// Credential file name inside the data directory
    pub credentials_file: String,

    /// Environment variable holding the at-rest encryption passphrase
    pub passphrase_env: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            credentials_file: "credentials.json".into(),
            passphrase_env: "COURTSIDE_STORE_SECRET".into(),
        }
    }
}

impl StoreConfig {
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join(&self.credentials_file)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    /// Read the at-rest passphrase from the configured environment variable
    pub fn passphrase(&self) -> Option<String> {
        std::env::var(&self.passphrase_env).ok().filter(|s| !s.is_empty())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Every field has a default; variables only override.
    pub fn from_env() -> Result<Self> {
        let mut config = if let Ok(path) = std::env::var("COURTSIDE_CONFIG") {
            Self::from_file(Path::new(&path))?
        } else {
            Self::default()
        };

        if let Ok(v) = std::env::var("COURTSIDE_BASE_URL") {
            config.platform.return_url = format!("{}/#/paymentResult/1", v.trim_end_matches('/'));
            config.platform.base_url = v;
        }
        if let Ok(v) = std::env::var("COURTSIDE_RSA_PUBLIC_KEY") {
            config.platform.rsa_public_key = v;
        }
        if let Ok(v) = std::env::var("COURTSIDE_RETURN_URL") {
            config.platform.return_url = v;
        }
        if let Ok(v) = std::env::var("COURTSIDE_PRESETS_JSON") {
            config.platform.presets =
                serde_json::from_str(&v).context("COURTSIDE_PRESETS_JSON is not valid JSON")?;
        }

        if let Some(v) = env_parse("COURTSIDE_REQUEST_TIMEOUT") {
            config.client.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("COURTSIDE_ORDER_TIMEOUT") {
            config.client.order_timeout_secs = v;
        }
        if let Some(v) = env_parse("COURTSIDE_RATE_LIMIT") {
            config.client.rate_limit = v;
        }

        if let Some(v) = env_parse("COURTSIDE_MONITOR_INTERVAL") {
            config.monitor.interval_secs = v;
        }
        if let Some(v) = env_bool("COURTSIDE_MONITOR_AUTO_BOOK") {
            config.monitor.auto_book = v;
        }
        if let Some(v) = env_int_list("COURTSIDE_PREFERRED_HOURS") {
            config.monitor.preferred_hours = v;
        }
        if let Some(v) = env_int_list("COURTSIDE_PREFERRED_DAYS") {
            config.monitor.preferred_days = v;
        }

        if let Some(v) = env_parse("COURTSIDE_SCHEDULE_HOUR") {
            config.schedule.hour = v;
        }
        if let Some(v) = env_parse("COURTSIDE_SCHEDULE_MINUTE") {
            config.schedule.minute = v;
        }
        if let Some(v) = env_parse("COURTSIDE_SCHEDULE_SECOND") {
            config.schedule.second = v;
        }
        if let Some(v) = env_parse("COURTSIDE_SCHEDULE_DATE_OFFSET") {
            config.schedule.date_offset_days = v;
        }
        if let Some(v) = env_int_list("COURTSIDE_SCHEDULE_START_HOURS") {
            config.schedule.start_hours = v;
        }
        if let Some(v) = env_parse("COURTSIDE_WARMUP_SECONDS") {
            config.schedule.warmup_secs = v;
        }

        if let Ok(v) = std::env::var("COURTSIDE_DATA_DIR") {
            config.store.data_dir = PathBuf::from(v);
        }

        if let Ok(v) = std::env::var("COURTSIDE_LOG_LEVEL") {
            config.logging.level = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<(), BookingError> {
        if url::Url::parse(&self.platform.base_url).is_err() {
            return Err(BookingError::Config(format!(
                "base_url is not a valid URL: {}",
                self.platform.base_url
            )));
        }
        if !self.platform.rsa_public_key.contains("BEGIN PUBLIC KEY") {
            return Err(BookingError::Config(
                "rsa_public_key is not a PEM public key".into(),
            ));
        }
        if self.schedule.hour > 23 || self.schedule.minute > 59 || self.schedule.second > 59 {
            return Err(BookingError::Config(format!(
                "invalid schedule time {:02}:{:02}:{:02}",
                self.schedule.hour, self.schedule.minute, self.schedule.second
            )));
        }
        if self.monitor.operating_start_hour >= self.monitor.operating_end_hour {
            return Err(BookingError::Config(
                "operating window start must precede end".into(),
            ));
        }
        if let Some(hour) = self
            .monitor
            .preferred_hours
            .iter()
            .chain(self.schedule.start_hours.iter())
            .find(|h| **h > 23)
        {
            return Err(BookingError::Config(format!("invalid hour {hour}")));
        }
        if self.schedule.max_attempts == 0 {
            return Err(BookingError::Config("max_attempts must be positive".into()));
        }
        Ok(())
    }

    /// Look up a preset by index
    pub fn preset(&self, index: u16) -> Option<&Preset> {
        self.platform.presets.iter().find(|p| p.index == index)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_int_list(name: &str) -> Option<Vec<u8>> {
    let raw = std::env::var(name).ok()?;
    let values: Vec<u8> = raw
        .replace(';', ",")
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.platform.rsa_public_key.contains("BEGIN PUBLIC KEY"));
        assert_eq!(config.schedule.hour, 12);
    }

    #[test]
    fn test_validate_rejects_bad_schedule_time() {
        let mut config = Config::default();
        config.schedule.hour = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_operating_window() {
        let mut config = Config::default();
        config.monitor.operating_start_hour = 23;
        config.monitor.operating_end_hour = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let mut config = Config::default();
        config.platform.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_pem_key() {
        let mut config = Config::default();
        config.platform.rsa_public_key = "not a key".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_preset_lookup() {
        let config = Config::default();
        let preset = config.preset(5).unwrap();
        assert_eq!(preset.field_type_name, "羽毛球");
        assert!(config.preset(99).is_none());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.platform.base_url, config.platform.base_url);
        assert_eq!(parsed.schedule.max_attempts, config.schedule.max_attempts);
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides() {
        std::env::set_var("COURTSIDE_RATE_LIMIT", "9");
        std::env::set_var("COURTSIDE_PREFERRED_HOURS", "20,21");
        std::env::set_var("COURTSIDE_MONITOR_AUTO_BOOK", "true");

        let config = Config::from_env().unwrap();
        assert_eq!(config.client.rate_limit, 9);
        assert_eq!(config.monitor.preferred_hours, vec![20, 21]);
        assert!(config.monitor.auto_book);

        std::env::remove_var("COURTSIDE_RATE_LIMIT");
        std::env::remove_var("COURTSIDE_PREFERRED_HOURS");
        std::env::remove_var("COURTSIDE_MONITOR_AUTO_BOOK");
    }

    #[test]
    fn test_store_paths() {
        let store = StoreConfig::default();
        assert!(store.credentials_path().ends_with("credentials.json"));
        assert!(store.jobs_dir().ends_with("jobs"));
    }
}
