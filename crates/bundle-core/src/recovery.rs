//! Recovery of persisted state.
//!
//! Metadata, windows, ledgers and sessions are small JSON files. When one
//! cannot be parsed the owner starts from a fresh value instead of failing
//! the exchange. That path is made explicit so callers log it loudly and
//! tests can assert on which path was taken:
//!
//!   Loaded     file parsed, or no file yet (fresh state is the normal start)
//!   Recovered  file present but unreadable as state; fresh value substituted
//!   Fatal      the file could not even be read (permissions, I/O)

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug)]
pub enum Recovery<T> {
    Loaded(T),
    Recovered { value: T, reason: String },
    Fatal(RecoveryError),
}

#[derive(Debug, Error)]
#[error("cannot read {path}")]
pub struct RecoveryError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl<T> Recovery<T> {
    pub fn is_recovered(&self) -> bool {
        matches!(self, Recovery::Recovered { .. })
    }

    pub fn into_result(self) -> Result<T, RecoveryError> {
        match self {
            Recovery::Loaded(value) | Recovery::Recovered { value, .. } => Ok(value),
            Recovery::Fatal(e) => Err(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Recovery<U> {
        match self {
            Recovery::Loaded(v) => Recovery::Loaded(f(v)),
            Recovery::Recovered { value, reason } => Recovery::Recovered { value: f(value), reason },
            Recovery::Fatal(e) => Recovery::Fatal(e),
        }
    }
}

/// Read JSON state at `path`, falling back to `fresh()`.
pub fn load_json<T: DeserializeOwned>(path: &Path, fresh: impl FnOnce() -> T) -> Recovery<T> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Recovery::Loaded(fresh()),
        Err(source) => {
            return Recovery::Fatal(RecoveryError {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Recovery::Loaded(value),
        Err(e) => Recovery::Recovered {
            value: fresh(),
            reason: format!("{}: {e}", path.display()),
        },
    }
}
