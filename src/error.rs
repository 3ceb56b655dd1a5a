use std::io;
use thiserror::Error;

/// type alias for all operations on the store, the sessions and the job pool that could fail
/// with a [`KvsError`]
pub type Result<T> = std::result::Result<T, KvsError>;

/// The Error variants used throughout the kvs server and client.
///
/// None of these are fatal to the server process: a failing request is reported to its
/// caller (or inline in a job's output) and the server keeps running.
#[derive(Error, Debug)]
pub enum KvsError {
    /// an operation was attempted on a store that was never initialized, or was already
    /// terminated
    #[error("KVS state must be initialized")]
    NotInitialized,

    /// `init` was called twice on the same store
    #[error("KVS state has already been initialized")]
    AlreadyInitialized,

    /// a per-session limit was hit (the other capacity limits block instead of failing)
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// a key was not found in the store
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// a key cannot be placed in the store's table
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// a pipe could not be opened, read or written
    #[error("channel failure on {path}: {source}")]
    ChannelFailure {
        /// path of the pipe (or a description of the endpoint)
        path: String,
        /// the underlying IO error
        #[source]
        source: io::Error,
    },

    /// a frame with an unknown opcode or invalid contents was received
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// a command line argument could not be parsed
    #[error("{0}")]
    Parsing(String),

    /// a configuration value is invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// variant for errors caused by file IO
    #[error(transparent)]
    Io(#[from] io::Error),

    /// serde_json errors, raised while loading a configuration file
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// system call errors (FIFO creation, signal masks)
    #[error(transparent)]
    Sys(#[from] nix::Error),

    /// generic error message
    #[error("{0}")]
    StringErr(String),
}

impl KvsError {
    /// builds a [`KvsError::ChannelFailure`] for the pipe at `path`
    pub fn channel(path: impl Into<String>, source: io::Error) -> Self {
        KvsError::ChannelFailure {
            path: path.into(),
            source,
        }
    }
}
