//! The collected bundle: diagnostic output name -> captured text, stored as a
//! single JSON object.
//!
//! Host tools print arbitrary bytes, so the text is carried in the
//! single-byte ISO-8859-1 form: byte `0xNN` becomes code point `U+00NN`. The JSON
//! writer escapes everything outside ASCII, which keeps the file and the
//! submission body plain ASCII.

use crate::state::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to encode JSON: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to parse bundle {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectedBundle {
    entries: BTreeMap<String, String>,
}

impl CollectedBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(name.into(), text.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Reads every regular file directly inside `dir`. Subdirectories and
    /// other special entries are skipped.
    pub fn from_dir(dir: &Path) -> Result<Self, BundleError> {
        let read_err = |path: &Path, source| BundleError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut bundle = Self::new();
        for entry in fs::read_dir(dir).map_err(|e| read_err(dir, e))? {
            let entry = entry.map_err(|e| read_err(dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| read_err(&path, e))?;
            if !file_type.is_file() {
                continue;
            }
            let bytes = fs::read(&path).map_err(|e| read_err(&path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            bundle.insert(name, latin1_decode(&bytes));
        }
        Ok(bundle)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BundleError> {
        Ok(to_ascii_json(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<usize, BundleError> {
        let mut data = self.to_json()?;
        data.push(b'\n');
        write_atomic(path, &data).map_err(|source| BundleError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(data.len())
    }

    pub fn load(path: &Path) -> Result<Self, BundleError> {
        let text = read_raw(path)?;
        serde_json::from_str(&text).map_err(|source| BundleError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub fn read_raw(path: &Path) -> Result<String, BundleError> {
    let bytes = fs::read(path).map_err(|source| BundleError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(latin1_decode(&bytes))
}

pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Serializes `value` as compact JSON with every non-ASCII character written
/// as a `\uXXXX` escape.
pub fn to_ascii_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    value.serialize(&mut ser)?;
    Ok(out)
}

struct AsciiFormatter;

impl serde_json::ser::Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        let mut start = 0;
        for (idx, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(&fragment.as_bytes()[start..idx])?;
            let mut units = [0_u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            start = idx + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }
}
