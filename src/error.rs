//! Error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from property table lookups and writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    #[error("unknown property '{0}'")]
    NotFound(String),

    #[error("type error: property '{property}' expects a {expected}, got {found}")]
    TypeMismatch {
        property: String,
        expected: &'static str,
        found: String,
    },
}

/// Errors raised while assembling a property table at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableBuildError {
    #[error("property '{0}' registered twice")]
    DuplicateProperty(String),

    #[error("interlock on '{property}' references unknown property '{missing}'")]
    UnknownInterlockProperty { property: String, missing: String },
}

/// Reasons a payload could not be turned into a [`Request`](crate::protocol::Request).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("request is not a JSON object")]
    NotAnObject,

    #[error("request has no command")]
    MissingCommand,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("request has no property")]
    MissingProperty,

    #[error("field '{0}' has the wrong type")]
    InvalidField(&'static str),

    #[error("message exceeds {limit} bytes")]
    Oversized { limit: usize },
}

/// Why a request was answered with an error response.
///
/// Only used for diagnostics; clients always receive `{"command":"error"}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("unknown property '{0}'")]
    UnknownProperty(String),

    #[error("no value for write to '{0}'")]
    NoValue(String),

    #[error("type error: property '{property}' expects a {expected}, got {found}")]
    TypeMismatch {
        property: String,
        expected: &'static str,
        found: String,
    },

    #[error("message exceeds {limit} bytes")]
    Oversized { limit: usize },
}

impl From<DecodeError> for RequestError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::UnknownCommand(command) => RequestError::UnknownCommand(command),
            DecodeError::Oversized { limit } => RequestError::Oversized { limit },
            other => RequestError::InvalidSyntax(other.to_string()),
        }
    }
}

impl From<PropertyError> for RequestError {
    fn from(e: PropertyError) -> Self {
        match e {
            PropertyError::NotFound(name) => RequestError::UnknownProperty(name),
            PropertyError::TypeMismatch {
                property,
                expected,
                found,
            } => RequestError::TypeMismatch {
                property,
                expected,
                found,
            },
        }
    }
}

/// The outbound queue of a connection is at its configured bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("outbound queue of connection {connection} is full ({limit} pending)")]
pub struct QueueFull {
    pub connection: u64,
    pub limit: usize,
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Fatal errors from [`PropertyServer::serve`](crate::server::PropertyServer::serve).
///
/// Connection-level faults never surface here; they are handled inside the
/// event loop by dropping the offending connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to remove {0}: not a socket")]
    NotASocket(PathBuf),

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_errors_map_to_request_errors() {
        assert_eq!(
            RequestError::from(DecodeError::UnknownCommand("delete".into())),
            RequestError::UnknownCommand("delete".into())
        );
        assert!(matches!(
            RequestError::from(DecodeError::MissingCommand),
            RequestError::InvalidSyntax(_)
        ));
        assert_eq!(
            RequestError::from(DecodeError::Oversized { limit: 2048 }),
            RequestError::Oversized { limit: 2048 }
        );
    }

    #[test]
    fn test_property_not_found_maps_to_unknown_property() {
        let err = RequestError::from(PropertyError::NotFound("ghost".into()));
        assert_eq!(err.to_string(), "unknown property 'ghost'");
    }
}
