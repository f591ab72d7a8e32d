//! Request dispatch against the property table.
//!
//! Every path through [`dispatch`] ends in a [`Response`]: protocol and
//! validation failures become error responses, interlock refusals become
//! value responses carrying the unchanged value. Nothing here can fail in a
//! way the event loop has to handle.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{DecodeError, RequestError};
use crate::property::{PropertyTable, WriteOutcome};
use crate::protocol::{Command, Request, Response, UNKNOWN_PROPERTY};

/// Resolve one decoded (or undecodable) request.
pub fn dispatch(table: &mut PropertyTable, request: Result<Request, DecodeError>) -> Response {
    let request = match request {
        Ok(request) => request,
        Err(e) => return reject(None, RequestError::from(e)),
    };

    debug!(
        command = request.command.as_str(),
        property = %request.property,
        "Handling request"
    );

    match request.command {
        Command::Read => handle_read(table, &request.property),
        Command::Write => handle_write(table, &request.property, request.value.as_ref()),
    }
}

/// Decode a raw payload and dispatch it.
pub fn dispatch_bytes(table: &mut PropertyTable, payload: &[u8]) -> Response {
    dispatch(table, Request::decode(payload))
}

/// Dispatch a frame produced by [`FrameBuffer`](crate::framing::FrameBuffer).
pub fn dispatch_frame(table: &mut PropertyTable, frame: Result<Value, DecodeError>) -> Response {
    dispatch(table, frame.and_then(Request::from_json))
}

fn handle_read(table: &PropertyTable, property: &str) -> Response {
    match table.get(property) {
        Ok(value) => Response::value(property, &value),
        Err(e) => reject(Some(property), e.into()),
    }
}

fn handle_write(table: &mut PropertyTable, property: &str, value: Option<&Value>) -> Response {
    let Some(candidate) = value else {
        return reject(Some(property), RequestError::NoValue(property.to_string()));
    };

    match table.set(property, candidate) {
        Ok(WriteOutcome::Applied(applied)) => Response::value(property, &applied),
        Ok(WriteOutcome::Rejected { current, reason }) => {
            warn!(property, %reason, "Blocked write");
            Response::value(property, &current)
        }
        Err(e) => reject(Some(property), e.into()),
    }
}

fn reject(property: Option<&str>, reason: RequestError) -> Response {
    warn!(
        property = property.unwrap_or(UNKNOWN_PROPERTY),
        %reason,
        "Invalid request"
    );
    Response::error(property, &reason)
}
