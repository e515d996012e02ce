use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The five reactive flags. `collecting` and `submitting` mean "an attempt is
/// due", not "an attempt is running"; handlers clear them on entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryFlags {
    #[serde(default)]
    pub configured: bool,
    #[serde(default)]
    pub collecting: bool,
    #[serde(default)]
    pub collected: bool,
    #[serde(default)]
    pub submitting: bool,
    #[serde(default)]
    pub submitted: bool,
}

impl RetryFlags {
    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.configured {
            out.push("configured");
        }
        if self.collecting {
            out.push("collecting");
        }
        if self.collected {
            out.push("collected");
        }
        if self.submitting {
            out.push("submitting");
        }
        if self.submitted {
            out.push("submitted");
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub flags: RetryFlags,
    #[serde(default)]
    pub last_submit_url: Option<String>,
    #[serde(default)]
    pub status: Status,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to write state file {path}: {source}")]
    Write { path: String, source: io::Error },
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait FlagStore {
    fn load(&self) -> Result<PersistedState, StateError>;
    fn save(&self, state: &PersistedState) -> Result<(), StateError>;
}

pub struct FileFlagStore {
    path: PathBuf,
}

impl FileFlagStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FlagStore for FileFlagStore {
    fn load(&self) -> Result<PersistedState, StateError> {
        let path_display = self.path.display().to_string();
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(PersistedState::default())
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: path_display,
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| StateError::Parse {
            path: path_display,
            source,
        })
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let mut text = serde_json::to_string_pretty(state)?;
        text.push('\n');
        write_atomic(&self.path, text.as_bytes()).map_err(|source| StateError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// Replaces `path` through a sibling temp file and a rename, so readers see
/// either the old or the new content. Creates a missing parent directory with
/// owner-only permissions.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            create_private_dir(parent)?;
        }
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
