//! Capacity limits of the server.
//!
//! Every limit is fixed for the lifetime of a server; there is no runtime reconfiguration.
//! A [`ServerConfig`] starts from [`Default`], can be read from a JSON file, and is then
//! overridden by command line arguments in `kvs-server`.
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::{Limits, DELETED_MARKER};
use crate::{KvsError, Result};

/// default number of concurrently connected client sessions
pub const DEFAULT_MAX_SESSIONS: usize = 8;
/// default number of keys a single session may subscribe to
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 10;
/// default number of backups that may run at the same time
pub const DEFAULT_MAX_BACKUPS: usize = 1;
/// default number of job worker threads
pub const DEFAULT_MAX_THREADS: usize = 4;
/// default maximum length of keys and values
pub const DEFAULT_MAX_STRING_LEN: usize = 40;
/// default maximum length of a pipe path inside a registration frame
pub const DEFAULT_MAX_PIPE_PATH_LEN: usize = 40;

/// Capacity limits of a kvs server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// maximum number of live client sessions
    pub max_sessions: usize,
    /// maximum number of subscriptions held by one session
    pub max_subscriptions: usize,
    /// maximum number of snapshot backups running concurrently
    pub max_backups: usize,
    /// number of job worker threads
    pub max_threads: usize,
    /// maximum length of a key or a value
    pub max_string_len: usize,
    /// maximum length of a pipe path
    pub max_pipe_path_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            max_backups: DEFAULT_MAX_BACKUPS,
            max_threads: DEFAULT_MAX_THREADS,
            max_string_len: DEFAULT_MAX_STRING_LEN,
            max_pipe_path_len: DEFAULT_MAX_PIPE_PATH_LEN,
        }
    }
}

impl ServerConfig {
    /// reads a configuration from the JSON file at `path`. Fields missing from the file keep
    /// their default value.
    ///
    /// # Errors
    /// returns [`KvsError::Io`] if the file could not be read, [`KvsError::Json`] if it is not
    /// valid JSON, and [`KvsError::Config`] if a value is out of range
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&contents)?;
        debug!(?config, "loaded configuration from {:?}", path);
        config.validate()?;
        Ok(config)
    }

    /// checks that every limit is usable
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_sessions", self.max_sessions),
            ("max_subscriptions", self.max_subscriptions),
            ("max_backups", self.max_backups),
            ("max_threads", self.max_threads),
            ("max_pipe_path_len", self.max_pipe_path_len),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(KvsError::Config(format!("{} must be greater than zero", name)));
        }
        // notifications for deleted keys carry the marker as their value
        if self.max_string_len < DELETED_MARKER.len() {
            return Err(KvsError::Config(format!(
                "max_string_len must be at least {}",
                DELETED_MARKER.len()
            )));
        }
        Ok(())
    }

    /// the frame size limits shared by the server and its clients
    pub fn limits(&self) -> Limits {
        Limits {
            max_string_len: self.max_string_len,
            max_pipe_path_len: self.max_pipe_path_len,
        }
    }
}
