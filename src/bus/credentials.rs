//! Rotating bearer credential loaded from a mounted file.
//!
//! The platform mounts the credential and rewrites it on rotation; the file
//! is re-read on every token refresh so a rotation that happened during an
//! outage is picked up on reconnect.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur loading the bearer credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Failed to read the credential file.
    #[error("failed to read credential file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Credential file exists but holds no token.
    #[error("credential file '{0}' is empty")]
    Empty(String),
}

/// Handle to a mounted, periodically-rotated credential file.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current token, trimming surrounding whitespace.
    ///
    /// Reads the file fresh on every call so rotations are always observed.
    pub fn load(&self) -> Result<String, CredentialError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| CredentialError::Io {
            path: self.path.display().to_string(),
            source,
        })?;

        let token = raw.trim();
        if token.is_empty() {
            return Err(CredentialError::Empty(self.path.display().to_string()));
        }
        Ok(token.to_string())
    }
}
