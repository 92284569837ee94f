use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("couldn't read config '{}': {err}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("config syntax error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("pman daemon is already running (pid: {0})")]
    AlreadyRunning(i32),

    #[error("couldn't launch program '{name}': {err}")]
    Launch {
        name: String,
        #[source]
        err: io::Error,
    },

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("daemon replied with an error: {0}")]
    Remote(String),
}
