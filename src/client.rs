//! Client for talking to a running prontrd.
//!
//! Each call on [`PropertyClient`] opens a fresh connection. Use
//! [`PropertyClient::connect`] to keep one connection open across requests.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::expand_path;
use crate::protocol::{Request, Response};

/// Property daemon client.
///
/// # Example
///
/// ```rust,no_run
/// use prontrd::PropertyClient;
///
/// let client = PropertyClient::new("/tmp/prontrd.sock");
///
/// let state = client.read("printer_state")?;
/// println!("printer_state = {:?}", state.json_value());
///
/// client.write("psu_power", serde_json::json!(true))?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct PropertyClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl PropertyClient {
    /// Create a client. `~` in `socket_path` is expanded.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: expand_path(socket_path.as_ref()),
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the read/write timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Read a property.
    pub fn read(&self, property: &str) -> Result<Response> {
        self.send(&Request::read(property))
    }

    /// Write a property. The response carries the value now in effect.
    pub fn write(&self, property: &str, value: Value) -> Result<Response> {
        self.send(&Request::write(property, value))
    }

    /// Send one request on a new connection.
    pub fn send(&self, request: &Request) -> Result<Response> {
        self.connect()?.send(request)
    }

    /// Open a connection that can carry several requests.
    pub fn connect(&self) -> Result<Session> {
        let stream = UnixStream::connect(&self.socket_path)
            .with_context(|| format!("Cannot connect to daemon at {:?}", self.socket_path))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let reader = BufReader::new(stream.try_clone()?);
        Ok(Session {
            writer: stream,
            reader,
        })
    }

    /// Check whether the daemon accepts connections.
    pub fn is_running(&self) -> bool {
        UnixStream::connect(&self.socket_path).is_ok()
    }
}

/// An open connection to the daemon. Responses arrive in request order.
pub struct Session {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Session {
    pub fn send(&mut self, request: &Request) -> Result<Response> {
        self.writer.write_all(&request.encode())?;
        self.writer.flush()?;
        self.receive()
    }

    pub fn read(&mut self, property: &str) -> Result<Response> {
        self.send(&Request::read(property))
    }

    pub fn write(&mut self, property: &str, value: Value) -> Result<Response> {
        self.send(&Request::write(property, value))
    }

    /// Wait for the next response line.
    pub fn receive(&mut self) -> Result<Response> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .context("Failed to read response")?;
        if n == 0 {
            bail!("Daemon closed the connection");
        }
        Response::decode(line.trim_end().as_bytes()).context("Malformed response")
    }
}
