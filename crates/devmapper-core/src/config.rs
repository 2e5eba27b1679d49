//! Configuration model for the device-mapper tooling.

use crate::error::{DevmapperError, DevmapperResult};
use crate::table::DEFAULT_CRYPT_CIPHER;
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/devmapper.toml";

/// Environment variable that overrides `dmsetup.path`.
pub const DMSETUP_PATH_ENV: &str = "DEVMAPPER_DMSETUP_PATH";

/// How the `dmsetup` transport is located and run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DmsetupCfg {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// When false, create/remove never wait for udev (e.g. inside containers
    /// without a udev daemon).
    #[serde(default = "default_udev_sync")]
    pub udev_sync: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_udev_sync() -> bool {
    true
}

impl Default for DmsetupCfg {
    fn default() -> Self {
        Self {
            path: None,
            timeout_secs: default_timeout_secs(),
            udev_sync: default_udev_sync(),
        }
    }
}

/// Defaults applied when building dm-crypt tables.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptCfg {
    #[serde(default = "default_cipher")]
    pub cipher: String,

    #[serde(default = "default_allow_discards")]
    pub allow_discards: bool,
}

fn default_cipher() -> String {
    DEFAULT_CRYPT_CIPHER.to_string()
}

fn default_allow_discards() -> bool {
    true
}

impl Default for CryptCfg {
    fn default() -> Self {
        Self {
            cipher: default_cipher(),
            allow_discards: default_allow_discards(),
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DevmapperConfig {
    #[serde(default)]
    pub dmsetup: DmsetupCfg,

    #[serde(default)]
    pub crypt: CryptCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl DevmapperConfig {
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> DevmapperResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        info!(
            "no device-mapper config at {}; using defaults",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            ..Self::default()
        })
    }

    /// Read a config file, picking the format from its extension.
    pub fn load<P: AsRef<Path>>(path: P) -> DevmapperResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        );
        let mut cfg = if is_yaml {
            serde_yaml::from_str::<Self>(&contents)?
        } else {
            toml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_yaml {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        };

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(DevmapperError::InvalidConfig(issues.join("; ")));
        }

        Ok(cfg)
    }

    /// Best-effort validation returning human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.dmsetup.timeout_secs == 0 {
            issues.push("dmsetup.timeout_secs must be greater than zero".to_string());
        }

        if let Some(path) = &self.dmsetup.path {
            if path.trim().is_empty() {
                issues.push("dmsetup.path must not be empty when set".to_string());
            }
        }

        let cipher = self.crypt.cipher.as_str();
        if cipher.is_empty() {
            issues.push("crypt.cipher must not be empty".to_string());
        } else if cipher.chars().any(char::is_whitespace) {
            issues.push(format!("crypt.cipher contains whitespace: {cipher:?}"));
        }

        issues
    }

    pub fn dmsetup_timeout(&self) -> Duration {
        Duration::from_secs(self.dmsetup.timeout_secs)
    }
}

/// JSON schema describing [`DevmapperConfig`].
pub fn config_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(DevmapperConfig)).unwrap_or_default()
}
