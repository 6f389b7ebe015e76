//! Support for dispatching operations: remote-execution configuration and
//! chunking of inputs

use thiserror::Error;

pub mod callpath;
mod remote_info;
mod utils;

#[cfg(test)]
mod tests;

pub use remote_info::{RemoteInfo, Resources};
pub use utils::{
    Caller, DEFAULT_ENV_VAR, Grouper, RemoteInfoConfig, get_remote_info,
    grouper,
};

#[derive(Debug, Error)]
pub enum RemoteInfoError {
    #[error("failed to read remote info from {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse remote info in {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("expected a mapping of remote info from {source_name}, got {got}")]
    NotAMapping { source_name: String, got: String },

    #[error("remote info keys must be strings, got {0:?}")]
    Key(serde_yaml::Value),

    #[error("invalid remote info arguments: {0}")]
    Kwargs(serde_yaml::Error),

    #[error("invalid remote info key pattern: {0}")]
    Pattern(#[from] regex::Error),
}
