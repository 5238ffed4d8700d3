//! Wire formats for message payloads.
//!
//! Every [`Endpoint`](crate::Endpoint) names the format its destination
//! speaks; all peers on a destination must agree on it. Formats are keyed by
//! a short string on the wire and in configuration (`"json"`,
//! `"postcard"`), parsed through [`FromStr`].

use core::fmt;
use core::str::FromStr;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Errors produced while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
    #[error("unknown wire format '{0}'")]
    UnknownFormat(String),
}

/// A payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WireFormat {
    /// Human-readable JSON via `serde_json`.
    #[default]
    Json,
    /// Compact binary encoding via `postcard`.
    Postcard,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Postcard => "postcard",
        }
    }

    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, FormatError> {
        match self {
            WireFormat::Json => Ok(serde_json::to_vec(value)?),
            WireFormat::Postcard => Ok(postcard::to_stdvec(value)?),
        }
    }

    pub fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, FormatError> {
        match self {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::Postcard => Ok(postcard::from_bytes(bytes)?),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(WireFormat::Json),
            "postcard" => Ok(WireFormat::Postcard),
            other => Err(FormatError::UnknownFormat(other.to_string())),
        }
    }
}
