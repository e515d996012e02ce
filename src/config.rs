use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/storpool-inventory/config.yaml";

const BUNDLE_FILE_NAME: &str = "collect.json";
const STATE_FILE_NAME: &str = "storpool-inventory.state.json";
const PACKAGE_RECORD_FILE_NAME: &str = "storpool-inventory.packages.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Where collected data goes. Empty means "not configured".
    #[serde(default)]
    pub submit_url: Option<String>,
    #[serde(default)]
    pub config_source: ConfigSource,
    #[serde(default)]
    pub status_sink: StatusSinkKind,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_work_dir_parent")]
    pub work_dir_parent: PathBuf,
    #[serde(default)]
    pub repo_marker: Option<PathBuf>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub use_sudo: SudoMode,
    #[serde(
        default = "default_submit_timeout",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub submit_timeout: Duration,
    #[serde(
        default = "default_command_timeout",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub command_timeout: Duration,
    #[serde(
        default = "default_install_timeout",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub install_timeout: Duration,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    #[default]
    File,
    Juju,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSinkKind {
    #[default]
    Log,
    Juju,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SudoMode {
    #[default]
    Auto,
    Always,
    Never,
}

impl SudoMode {
    pub fn resolve(self, is_root: bool) -> bool {
        match self {
            SudoMode::Auto => !is_root,
            SudoMode::Always => true,
            SudoMode::Never => false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            submit_url: None,
            config_source: ConfigSource::default(),
            status_sink: StatusSinkKind::default(),
            state_dir: default_state_dir(),
            work_dir_parent: default_work_dir_parent(),
            repo_marker: None,
            hostname: None,
            use_sudo: SudoMode::default(),
            submit_timeout: default_submit_timeout(),
            command_timeout: default_command_timeout(),
            install_timeout: default_install_timeout(),
            log_file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`Config::load_from_file`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::load_from_file(path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "state_dir must not be empty".to_string(),
            ));
        }
        if self.work_dir_parent.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "work_dir_parent must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("submit_timeout", self.submit_timeout),
            ("command_timeout", self.command_timeout),
            ("install_timeout", self.install_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!("{name} must be > 0")));
            }
        }
        if let Some(url) = self.submit_url() {
            validate_submit_url(url)?;
        }
        if matches!(self.hostname.as_deref(), Some(h) if h.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "hostname must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn submit_url(&self) -> Option<&str> {
        normalize_submit_url(self.submit_url.as_deref())
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.state_dir.join(BUNDLE_FILE_NAME)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    pub fn package_record_path(&self) -> PathBuf {
        self.state_dir.join(PACKAGE_RECORD_FILE_NAME)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

pub fn normalize_submit_url(url: Option<&str>) -> Option<&str> {
    url.map(str::trim).filter(|u| !u.is_empty())
}

/// A `submit_url` from outside the file (`config-get`): trimmed, blank means
/// unset, anything else must be a valid http(s) URL.
pub fn parse_submit_url(raw: Option<&str>) -> Result<Option<String>, ConfigError> {
    match normalize_submit_url(raw) {
        Some(url) => {
            validate_submit_url(url)?;
            Ok(Some(url.to_string()))
        }
        None => Ok(None),
    }
}

pub fn validate_submit_url(url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|err| ConfigError::Validation(format!("submit_url '{url}' is not a URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Validation(format!(
            "submit_url '{url}' must use http or https"
        )));
    }
    Ok(())
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

fn ser_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/storpool")
}

fn default_work_dir_parent() -> PathBuf {
    PathBuf::from("/tmp")
}

const fn default_submit_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_command_timeout() -> Duration {
    Duration::from_secs(120)
}

const fn default_install_timeout() -> Duration {
    Duration::from_secs(600)
}
