//! Layered configuration using Figment.
//!
//! Settings are loaded from a TOML file (default `config/mx.toml`) and then
//! overridden by environment variables prefixed `MX_`, with `__` separating
//! nested keys: `MX_NETWORK__TIMEOUT_MS=250`.
//!
//! ```no_run
//! use mx_records::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{bail, Context};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::net::{WireFormat, DEFAULT_HOST, DEFAULT_PORT};

/// Configuration file read by [`Settings::load`].
pub const DEFAULT_CONFIG_PATH: &str = "config/mx.toml";
/// Prefix of environment overrides, e.g. `MX_NETWORK__DEFAULT_PORT`.
pub const ENV_PREFIX: &str = "MX_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Complete configuration: file, then environment, over built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Process-wide settings.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Client-side network defaults.
    #[serde(default)]
    pub network: NetworkSettings,
    /// Records to create, in order.
    #[serde(default)]
    pub records: Vec<RecordEntry>,
}

/// Settings not tied to any subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Name reported in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Defaults for network servers that do not set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Host used when a server description leaves it out.
    #[serde(default = "default_host")]
    pub default_host: String,
    /// Port used when a server description leaves it out.
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Per-connection request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Encoding requested for field values.
    #[serde(default)]
    pub wire_format: WireFormat,
    /// Busy-start window for records that do not set `busy_start_interval`.
    /// Zero or negative disables it.
    #[serde(default)]
    pub busy_start_interval_secs: f64,
}

/// One record description: its unique name, driver type and field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Unique record name.
    pub name: String,
    /// Driver type, e.g. `soft_mca`.
    pub driver: String,
    /// Description field values, matched by name against the driver's field table.
    #[serde(default)]
    pub fields: toml::Table,
}

fn default_name() -> String {
    "mx-records".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            default_host: default_host(),
            default_port: default_port(),
            timeout_ms: default_timeout_ms(),
            wire_format: WireFormat::default(),
            busy_start_interval_secs: 0.0,
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file leaves
    /// every setting at its default.
    pub fn load_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        Self::figment(path)
            .extract()
            .with_context(|| format!("loading configuration from {}", path.display()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject an unknown log level, a zero port or timeout, and empty or duplicate record names.
    pub fn validate(&self) -> anyhow::Result<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            bail!(
                "invalid log_level '{}', expected one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            );
        }
        if self.network.default_port == 0 {
            bail!("network.default_port must be non-zero");
        }
        if self.network.timeout_ms == 0 {
            bail!("network.timeout_ms must be non-zero");
        }
        let mut names = HashSet::new();
        for record in &self.records {
            if record.name.is_empty() {
                bail!("a record of driver type '{}' has an empty name", record.driver);
            }
            if !names.insert(record.name.as_str()) {
                bail!("duplicate record name '{}'", record.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_keys_take_defaults() {
        let file = write_config("[application]\nlog_level = \"debug\"\n");
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.application.name, "mx-records");
        assert_eq!(settings.network, NetworkSettings::default());
        assert!(settings.records.is_empty());
        settings.validate().unwrap();
    }

    #[test]
    fn records_keep_their_fields() {
        let file = write_config(
            r#"
[network]
wire_format = "raw"
busy_start_interval_secs = 0.5

[[records]]
name = "mca1"
driver = "soft_mca"
[records.fields]
maximum_num_channels = 1000
maximum_num_rois = 4
"#,
        );
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.network.wire_format, WireFormat::Raw);
        assert_eq!(settings.network.busy_start_interval_secs, 0.5);
        assert_eq!(settings.records.len(), 1);
        let mca = &settings.records[0];
        assert_eq!(mca.driver, "soft_mca");
        assert_eq!(
            mca.fields.get("maximum_num_channels").and_then(toml::Value::as_integer),
            Some(1000)
        );
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.network.timeout_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        let entry = RecordEntry {
            name: "m1".to_string(),
            driver: "soft_motor".to_string(),
            fields: toml::Table::new(),
        };
        settings.records = vec![entry.clone(), entry];
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn unknown_wire_format_fails_to_load() {
        let file = write_config("[network]\nwire_format = \"morse\"\n");
        assert!(Settings::load_from(file.path()).is_err());
    }
}
