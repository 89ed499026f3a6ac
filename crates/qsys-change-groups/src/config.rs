//! Configuration for change groups, auto-polling and the event cache
//!
//! Configuration is typed and validated once, at construction. A TOML file
//! may override any subset of keys on top of a named preset:
//!
//! ```toml
//! preset = "responsive"
//! failure_threshold = 5
//! poll_timeout_ms = 2000
//!
//! [cache]
//! max_entries_per_group = 5000
//! max_age_secs = 600
//! priority = "high"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Eviction weight of a group's cache buffer
///
/// Under global pressure `Low` buffers are trimmed first, then `Normal`,
/// then `High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::str::FromStr for CachePriority {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(CachePriority::Low),
            "normal" => Ok(CachePriority::Normal),
            "high" => Ok(CachePriority::High),
            other => Err(ConfigError::invalid(
                "priority",
                format!("expected low, normal or high, got {:?}", other),
            )),
        }
    }
}

/// Bounds of one group's event buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferConfig {
    pub max_entries: usize,
    pub max_age: Duration,
    pub priority: CachePriority,
}

impl BufferConfig {
    pub fn new(
        max_entries: usize,
        max_age: Duration,
        priority: CachePriority,
    ) -> Result<Self, ConfigError> {
        if max_entries == 0 {
            return Err(ConfigError::invalid("max_entries", "must be at least 1"));
        }
        if max_age.is_zero() {
            return Err(ConfigError::invalid("max_age", "must be greater than zero"));
        }
        Ok(Self {
            max_entries,
            max_age,
            priority,
        })
    }

    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_age_ms(&self) -> u64 {
        self.max_age.as_millis() as u64
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_age: Duration::from_secs(3600),
            priority: CachePriority::Normal,
        }
    }
}

/// Event cache configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheConfig {
    /// When false, polls still detect changes but nothing is recorded
    pub enabled: bool,
    /// Buffer bounds for groups that were never configured explicitly
    pub default_buffer: BufferConfig,
    /// Global budget across every group's buffer
    pub max_total_entries: usize,
    /// Query window used when a query names no start time
    pub default_window: Duration,
    pub default_query_limit: usize,
    pub max_query_limit: usize,
    pub default_query_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_buffer: BufferConfig::default(),
            max_total_entries: 1_000_000,
            default_window: Duration::from_secs(60),
            default_query_limit: 1_000,
            max_query_limit: 10_000,
            default_query_timeout: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        BufferConfig::new(
            self.default_buffer.max_entries,
            self.default_buffer.max_age,
            self.default_buffer.priority,
        )?;
        if self.max_total_entries == 0 {
            return Err(ConfigError::invalid("max_total_entries", "must be at least 1"));
        }
        if self.default_window.is_zero() {
            return Err(ConfigError::invalid("default_window", "must be greater than zero"));
        }
        if self.default_query_limit == 0 || self.default_query_limit > self.max_query_limit {
            return Err(ConfigError::invalid(
                "default_query_limit",
                format!(
                    "must be between 1 and max_query_limit ({})",
                    self.max_query_limit
                ),
            ));
        }
        if self.default_query_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "default_query_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Configuration for the change group subsystem
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeGroupConfig {
    /// Shortest accepted auto-poll interval
    pub min_poll_interval: Duration,
    /// Longest accepted auto-poll interval
    pub max_poll_interval: Duration,
    /// Consecutive scheduled-poll failures before auto-poll disables itself
    pub failure_threshold: u32,
    /// Upper bound on a single scheduled poll
    pub poll_timeout: Duration,
    /// Ask the core whether each control exists before adding it
    pub verify_controls_on_add: bool,
    pub max_group_id_len: usize,
    pub cache: CacheConfig,
}

impl Default for ChangeGroupConfig {
    fn default() -> Self {
        Self {
            min_poll_interval: Duration::from_millis(30),
            max_poll_interval: Duration::from_secs(3600),
            failure_threshold: 10,
            poll_timeout: Duration::from_secs(10),
            verify_controls_on_add: false,
            max_group_id_len: 128,
            cache: CacheConfig::default(),
        }
    }
}

impl ChangeGroupConfig {
    /// Default bounds
    pub fn standard() -> Self {
        Self::default()
    }

    /// Tight timeouts and a smaller history, for UIs that poll fast
    pub fn responsive() -> Self {
        Self {
            poll_timeout: Duration::from_secs(2),
            cache: CacheConfig {
                default_buffer: BufferConfig {
                    max_entries: 10_000,
                    max_age: Duration::from_secs(600),
                    priority: CachePriority::Normal,
                },
                max_total_entries: 200_000,
                default_query_timeout: Duration::from_secs(1),
                ..CacheConfig::default()
            },
            ..Self::default()
        }
    }

    /// Small buffers and a small global budget
    pub fn low_memory() -> Self {
        Self {
            cache: CacheConfig {
                default_buffer: BufferConfig {
                    max_entries: 1_000,
                    max_age: Duration::from_secs(300),
                    priority: CachePriority::Normal,
                },
                max_total_entries: 20_000,
                default_query_limit: 100,
                max_query_limit: 1_000,
                ..CacheConfig::default()
            },
            ..Self::default()
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "standard" => Ok(Self::standard()),
            "responsive" => Ok(Self::responsive()),
            "low_memory" => Ok(Self::low_memory()),
            other => Err(ConfigError::invalid(
                "preset",
                format!("unknown preset {:?}", other),
            )),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_verify_controls_on_add(mut self, verify: bool) -> Self {
        self.verify_controls_on_add = verify;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_poll_interval.is_zero() {
            return Err(ConfigError::invalid(
                "min_poll_interval",
                "must be greater than zero",
            ));
        }
        if self.min_poll_interval > self.max_poll_interval {
            return Err(ConfigError::invalid(
                "min_poll_interval",
                "must not exceed max_poll_interval",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::invalid("poll_timeout", "must be greater than zero"));
        }
        if self.max_group_id_len == 0 {
            return Err(ConfigError::invalid("max_group_id_len", "must be at least 1"));
        }
        self.cache.validate()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(source)?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

/// On-disk shape: every key optional, applied on top of the preset
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    preset: Option<String>,
    min_poll_interval_secs: Option<f64>,
    max_poll_interval_secs: Option<f64>,
    failure_threshold: Option<u32>,
    poll_timeout_ms: Option<u64>,
    verify_controls_on_add: Option<bool>,
    max_group_id_len: Option<usize>,
    cache: CacheFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CacheFile {
    enabled: Option<bool>,
    max_entries_per_group: Option<usize>,
    max_age_secs: Option<f64>,
    priority: Option<CachePriority>,
    max_total_entries: Option<usize>,
    default_window_secs: Option<f64>,
    default_query_limit: Option<usize>,
    max_query_limit: Option<usize>,
    query_timeout_ms: Option<u64>,
}

fn secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::invalid(field, format!("{} is not a valid duration", value)))
}

impl ConfigFile {
    fn into_config(self) -> Result<ChangeGroupConfig, ConfigError> {
        let mut config = match self.preset.as_deref() {
            Some(name) => ChangeGroupConfig::preset(name)?,
            None => ChangeGroupConfig::default(),
        };

        if let Some(v) = self.min_poll_interval_secs {
            config.min_poll_interval = secs("min_poll_interval_secs", v)?;
        }
        if let Some(v) = self.max_poll_interval_secs {
            config.max_poll_interval = secs("max_poll_interval_secs", v)?;
        }
        if let Some(v) = self.failure_threshold {
            config.failure_threshold = v;
        }
        if let Some(v) = self.poll_timeout_ms {
            config.poll_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.verify_controls_on_add {
            config.verify_controls_on_add = v;
        }
        if let Some(v) = self.max_group_id_len {
            config.max_group_id_len = v;
        }

        let cache = &mut config.cache;
        let file = self.cache;
        if let Some(v) = file.enabled {
            cache.enabled = v;
        }
        if let Some(v) = file.max_entries_per_group {
            cache.default_buffer.max_entries = v;
        }
        if let Some(v) = file.max_age_secs {
            cache.default_buffer.max_age = secs("max_age_secs", v)?;
        }
        if let Some(v) = file.priority {
            cache.default_buffer.priority = v;
        }
        if let Some(v) = file.max_total_entries {
            cache.max_total_entries = v;
        }
        if let Some(v) = file.default_window_secs {
            cache.default_window = secs("default_window_secs", v)?;
        }
        if let Some(v) = file.default_query_limit {
            cache.default_query_limit = v;
        }
        if let Some(v) = file.max_query_limit {
            cache.max_query_limit = v;
        }
        if let Some(v) = file.query_timeout_ms {
            cache.default_query_timeout = Duration::from_millis(v);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ChangeGroupConfig::default();
        assert_eq!(config.min_poll_interval, Duration::from_millis(30));
        assert_eq!(config.max_poll_interval, Duration::from_secs(3600));
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.cache.default_buffer.max_entries, 100_000);
        assert_eq!(config.cache.default_buffer.max_age, Duration::from_secs(3600));
        assert_eq!(config.cache.default_buffer.priority, CachePriority::Normal);
        assert_eq!(config.cache.default_window, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        for name in ["standard", "responsive", "low_memory"] {
            let config = ChangeGroupConfig::preset(name).unwrap();
            assert!(config.validate().is_ok(), "preset {} invalid", name);
        }
        assert!(ChangeGroupConfig::preset("turbo").is_err());

        let low = ChangeGroupConfig::low_memory();
        assert!(low.cache.max_total_entries < ChangeGroupConfig::standard().cache.max_total_entries);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(CachePriority::Low < CachePriority::Normal);
        assert!(CachePriority::Normal < CachePriority::High);
        assert_eq!("HIGH".parse::<CachePriority>().unwrap(), CachePriority::High);
        assert!("urgent".parse::<CachePriority>().is_err());
    }

    #[test]
    fn test_buffer_config_validation() {
        assert!(BufferConfig::new(0, Duration::from_secs(1), CachePriority::Low).is_err());
        assert!(BufferConfig::new(10, Duration::ZERO, CachePriority::Low).is_err());

        let buffer = BufferConfig::new(3, Duration::from_secs(2), CachePriority::High).unwrap();
        assert_eq!(buffer.max_age_ms(), 2_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ChangeGroupConfig::default();
        config.min_poll_interval = Duration::from_secs(10);
        config.max_poll_interval = Duration::from_secs(5);
        assert!(config.validate().is_err());

        assert!(ChangeGroupConfig::default().with_failure_threshold(0).validate().is_err());
        assert!(ChangeGroupConfig::default().with_poll_timeout(Duration::ZERO).validate().is_err());

        let mut config = ChangeGroupConfig::default();
        config.cache.default_query_limit = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_overrides_preset() {
        let config = ChangeGroupConfig::from_toml_str(
            r#"
            preset = "responsive"
            failure_threshold = 5
            min_poll_interval_secs = 0.1

            [cache]
            max_entries_per_group = 500
            priority = "high"
            query_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.min_poll_interval, Duration::from_millis(100));
        assert_eq!(config.poll_timeout, Duration::from_secs(2)); // from preset
        assert_eq!(config.cache.default_buffer.max_entries, 500);
        assert_eq!(config.cache.default_buffer.priority, CachePriority::High);
        assert_eq!(config.cache.default_query_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_from_toml_empty_is_default() {
        assert_eq!(
            ChangeGroupConfig::from_toml_str("").unwrap(),
            ChangeGroupConfig::default()
        );
    }

    #[test]
    fn test_from_toml_rejects_unknown_and_invalid() {
        assert!(matches!(
            ChangeGroupConfig::from_toml_str("poll_every = 3"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ChangeGroupConfig::from_toml_str("min_poll_interval_secs = -1.0"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            ChangeGroupConfig::from_toml_str("failure_threshold = 0"),
            Err(ConfigError::Invalid { field: "failure_threshold", .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "verify_controls_on_add = true").unwrap();
        writeln!(file, "[cache]").unwrap();
        writeln!(file, "enabled = false").unwrap();

        let config = ChangeGroupConfig::from_file(file.path()).unwrap();
        assert!(config.verify_controls_on_add);
        assert!(!config.cache.enabled);

        assert!(matches!(
            ChangeGroupConfig::from_file("/nonexistent/qsys.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
