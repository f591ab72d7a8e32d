//! Wire protocol types.
//!
//! Requests and responses are single JSON objects. Responses are written as
//! one compact line terminated by `\n`; requests may arrive with or without
//! a trailing newline (see [`framing`](crate::framing)).
//!
//! # Examples
//!
//! ```json
//! {"command":"read","property":"printer_state"}
//! {"command":"write","property":"psu_power","value":true}
//! ```
//!
//! ```json
//! {"command":"response","property":"psu_power","value":true}
//! {"command":"error"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DecodeError, RequestError};
use crate::value::PropertyValue;

/// Property name logged for requests whose target could not be determined.
pub const UNKNOWN_PROPERTY: &str = "UNKNOWN";

/// Emitted if a response somehow fails to serialize.
const ERROR_PAYLOAD: &[u8] = br#"{"command":"error"}"#;

/// Request verb. `get` and `set` are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
}

impl Command {
    /// Parse a wire command name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "read" | "get" => Some(Command::Read),
            "write" | "set" => Some(Command::Write),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Read => "read",
            Command::Write => "write",
        }
    }
}

/// Decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: Command,
    pub property: String,
    /// Candidate value; only meaningful for writes. JSON `null` decodes as absent.
    pub value: Option<Value>,
}

impl Request {
    /// Build a read request.
    pub fn read(property: impl Into<String>) -> Self {
        Self {
            command: Command::Read,
            property: property.into(),
            value: None,
        }
    }

    /// Build a write request.
    pub fn write(property: impl Into<String>, value: Value) -> Self {
        Self {
            command: Command::Write,
            property: property.into(),
            value: Some(value),
        }
    }

    /// Parse a request from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let json: Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        Self::from_json(json)
    }

    /// Validate an already-parsed JSON value as a request.
    ///
    /// The command is checked first so that an unknown verb is reported as
    /// such even when other fields are missing too.
    pub fn from_json(json: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut fields) = json else {
            return Err(DecodeError::NotAnObject);
        };

        let command = match fields.remove("command") {
            None | Some(Value::Null) => return Err(DecodeError::MissingCommand),
            Some(Value::String(name)) => {
                Command::parse(&name).ok_or(DecodeError::UnknownCommand(name))?
            }
            Some(_) => return Err(DecodeError::InvalidField("command")),
        };

        let property = match fields.remove("property") {
            None | Some(Value::Null) => return Err(DecodeError::MissingProperty),
            Some(Value::String(name)) => name,
            Some(_) => return Err(DecodeError::InvalidField("property")),
        };

        let value = take_value(&mut fields);

        Ok(Self {
            command,
            property,
            value,
        })
    }

    /// Wire form of the request. An absent value is omitted.
    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("command".into(), Value::from(self.command.as_str()));
        fields.insert("property".into(), Value::from(self.property.as_str()));
        if let Some(value) = &self.value {
            fields.insert("value".into(), value.clone());
        }
        Value::Object(fields)
    }

    /// Serialize to a newline-terminated JSON line.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = self.to_json().to_string();
        line.push('\n');
        line.into_bytes()
    }
}

fn take_value(fields: &mut Map<String, Value>) -> Option<Value> {
    match fields.remove("value") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value),
    }
}

/// Daemon reply to a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Response {
    /// Current (or newly applied) value of a property.
    #[serde(rename = "response")]
    Value { property: String, value: Value },

    /// The request was rejected. Only the tag goes on the wire; the fields
    /// are kept for logging.
    #[serde(rename = "error")]
    Error {
        #[serde(skip)]
        property: Option<String>,
        #[serde(skip)]
        reason: Option<String>,
    },
}

impl Response {
    /// Build a value response.
    pub fn value(property: impl Into<String>, value: &PropertyValue) -> Self {
        Response::Value {
            property: property.into(),
            value: value.to_json(),
        }
    }

    /// Build an error response carrying a diagnostic.
    pub fn error(property: Option<&str>, reason: &RequestError) -> Self {
        Response::Error {
            property: property.map(str::to_string),
            reason: Some(reason.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    /// Property named in the response, or [`UNKNOWN_PROPERTY`].
    pub fn property(&self) -> &str {
        match self {
            Response::Value { property, .. } => property.as_str(),
            Response::Error { property, .. } => property.as_deref().unwrap_or(UNKNOWN_PROPERTY),
        }
    }

    pub fn json_value(&self) -> Option<&Value> {
        match self {
            Response::Value { value, .. } => Some(value),
            Response::Error { .. } => None,
        }
    }

    /// Diagnostic attached to an error response.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Response::Error { reason, .. } => reason.as_deref(),
            Response::Value { .. } => None,
        }
    }

    /// Serialize to a newline-terminated JSON line.
    ///
    /// Property values are drawn from a closed set of JSON shapes, so
    /// serialization does not fail in practice; if it ever does the generic
    /// error payload is sent instead.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(self).unwrap_or_else(|_| ERROR_PAYLOAD.to_vec());
        bytes.push(b'\n');
        bytes
    }

    /// Parse a response from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))
    }
}
