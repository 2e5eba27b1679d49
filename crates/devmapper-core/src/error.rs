//! Error types shared by the device-mapper crates.
//!
//! None of these variants carry table parameters or key bytes; messages only
//! name the device, the operation and the step that failed.

use crate::task::{DmOp, TaskStep};
use std::error::Error;
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type DevmapperResult<T> = Result<T, DevmapperError>;

#[derive(Debug, Error)]
pub enum DevmapperError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("failed to parse YAML config: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("{op} task for `{name}` failed at {step}: {source}")]
    Task {
        op: DmOp,
        step: TaskStep,
        name: String,
        #[source]
        source: Box<dyn Error + Send + Sync + 'static>,
    },

    #[error("device `{0}` reported an empty table")]
    MissingTable(String),

    #[error("malformed table: {0}")]
    TableParse(#[from] TableParseError),

    #[error("unable to extract dm-crypt key: {0}")]
    CryptKey(#[from] CryptKeyError),

    #[error("dmsetup error: {0}")]
    Command(String),
}

/// Why a table blob could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableParseError {
    #[error("expected `<start> <size> <type>` header")]
    MissingFields,

    #[error("{field} is not an unsigned 64-bit integer")]
    InvalidNumber { field: &'static str },

    #[error("target type is {len} bytes long (limit 127)")]
    TypeTooLong { len: usize },

    #[error("target type is not printable ASCII")]
    InvalidType,

    #[error("no target parameters follow the header")]
    EmptyParameters,
}

/// Why a dm-crypt key could not be extracted from a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptKeyError {
    #[error("target is not a crypt target")]
    NotCrypt,

    #[error("cipher field missing")]
    MissingCipher,

    #[error("key field missing")]
    MissingKey,

    #[error("key field is not valid hex")]
    InvalidHex,
}
