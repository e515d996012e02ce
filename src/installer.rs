use crate::collectors::runner::{CommandLine, CommandRunner, RunError};
use crate::state::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const PACKAGE_OWNER: &str = "storpool-inventory-charm";

pub fn required_packages() -> BTreeMap<String, String> {
    ["dmidecode", "lshw", "nvme-cli", "pciutils", "usbutils"]
        .into_iter()
        .map(|name| (name.to_string(), "*".to_string()))
        .collect()
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("{action} failed with exit code {code:?}: {stderr}")]
    Apt {
        action: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to read package records {path}: {source}")]
    ReadRecord { path: PathBuf, source: io::Error },
    #[error("failed to parse package records {path}: {source}")]
    ParseRecord {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write package records {path}: {source}")]
    WriteRecord { path: PathBuf, source: io::Error },
}

pub trait PackageInstaller {
    async fn install_packages(
        &self,
        wanted: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, InstallError>;

    fn record_packages(&self, owner: &str, names: &[String]) -> Result<(), InstallError>;

    /// Forgets `owner` and removes the packages no other owner still needs.
    /// Returns the removed names.
    async fn unrecord_packages(&self, owner: &str) -> Result<Vec<String>, InstallError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageRecord {
    owners: BTreeMap<String, BTreeSet<String>>,
}

impl PackageRecord {
    pub fn load(path: &Path) -> Result<Self, InstallError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(InstallError::ReadRecord {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| InstallError::ParseRecord {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), InstallError> {
        let write_err = |source| InstallError::WriteRecord {
            path: path.to_path_buf(),
            source,
        };
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| write_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        write_atomic(path, text.as_bytes()).map_err(write_err)
    }

    pub fn add(&mut self, owner: &str, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.owners
            .entry(owner.to_string())
            .or_default()
            .extend(names.iter().cloned());
    }

    /// Drops `owner` and returns its packages that nobody else records.
    pub fn remove_owner(&mut self, owner: &str) -> Vec<String> {
        let Some(mine) = self.owners.remove(owner) else {
            return Vec::new();
        };
        mine.into_iter()
            .filter(|name| !self.owners.values().any(|other| other.contains(name)))
            .collect()
    }

    pub fn packages_of(&self, owner: &str) -> Vec<String> {
        self.owners
            .get(owner)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct AptInstaller<'a, R> {
    runner: &'a R,
    record_path: PathBuf,
    timeout: Duration,
}

impl<'a, R: CommandRunner> AptInstaller<'a, R> {
    pub fn new(runner: &'a R, record_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            record_path: record_path.into(),
            timeout,
        }
    }

    async fn is_installed(&self, name: &str) -> Result<bool, InstallError> {
        let cmd = CommandLine::new("dpkg-query")
            .args(["-W", "-f=${Status}", name]);
        let out = self.runner.run(&cmd, self.timeout).await?;
        Ok(out.success() && String::from_utf8_lossy(&out.stdout).contains("install ok installed"))
    }

    async fn apt_get(&self, action: &'static str, args: Vec<String>) -> Result<(), InstallError> {
        let cmd = CommandLine::new("apt-get")
            .args([action, "-y"])
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive");
        let out = self.runner.run(&cmd, self.timeout).await?;
        if out.success() {
            return Ok(());
        }
        Err(InstallError::Apt {
            action,
            code: out.code,
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

impl<R: CommandRunner> PackageInstaller for AptInstaller<'_, R> {
    async fn install_packages(
        &self,
        wanted: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, InstallError> {
        let mut missing = Vec::new();
        let mut specs = Vec::new();
        for (name, constraint) in wanted {
            if self.is_installed(name).await? {
                continue;
            }
            missing.push(name.clone());
            specs.push(if constraint == "*" {
                name.clone()
            } else {
                format!("{name}={constraint}")
            });
        }
        if missing.is_empty() {
            debug!("all required packages are already installed");
            return Ok(missing);
        }

        info!(packages = ?missing, "installing packages");
        let mut args = vec!["--no-install-recommends".to_string(), "--".to_string()];
        args.extend(specs);
        self.apt_get("install", args).await?;
        Ok(missing)
    }

    fn record_packages(&self, owner: &str, names: &[String]) -> Result<(), InstallError> {
        let mut record = PackageRecord::load(&self.record_path)?;
        record.add(owner, names);
        record.save(&self.record_path)
    }

    async fn unrecord_packages(&self, owner: &str) -> Result<Vec<String>, InstallError> {
        let mut record = PackageRecord::load(&self.record_path)?;
        let orphans = record.remove_owner(owner);
        if !orphans.is_empty() {
            info!(packages = ?orphans, "removing packages");
            let mut args = vec!["--".to_string()];
            args.extend(orphans.iter().cloned());
            self.apt_get("remove", args).await?;
        }
        record.save(&self.record_path)?;
        Ok(orphans)
    }
}

pub trait ReadinessGate {
    fn is_ready(&self) -> bool;
}

/// Open when no marker is configured, otherwise open once the marker file
/// exists.
pub struct MarkerGate {
    marker: Option<PathBuf>,
}

impl MarkerGate {
    pub fn new(marker: Option<PathBuf>) -> Self {
        Self { marker }
    }
}

impl ReadinessGate for MarkerGate {
    fn is_ready(&self) -> bool {
        self.marker.as_deref().map_or(true, Path::exists)
    }
}
