//! # prontrd
//!
//! Printer control daemon: exposes a small table of named properties (power
//! supply, printer state, LED state and colour) to local clients over a
//! UNIX socket.
//!
//! The daemon is a single-threaded readiness loop. Each client may send any
//! number of requests on one connection; responses come back in request
//! order, each as one JSON line.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use prontrd::device::{PowerSettle, SimulatedDevice};
//! use prontrd::PropertyServer;
//!
//! fn main() -> anyhow::Result<()> {
//!     let table = SimulatedDevice::new().table(PowerSettle::default())?;
//!     let mut server = PropertyServer::new(table, "/tmp/prontrd.sock");
//!     server.shutdown_handle().register_signals()?;
//!     server.serve()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Protocol Overview
//!
//! **Request:**
//! ```json
//! {"command":"write","property":"psu_power","value":true}
//! ```
//!
//! **Response:**
//! ```json
//! {"command":"response","property":"psu_power","value":true}
//! ```
//!
//! Any request that cannot be served is answered with `{"command":"error"}`.

pub mod client;
pub mod config;
pub mod connection;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod lifecycle;
pub mod logging;
pub mod property;
pub mod protocol;
pub mod server;
pub mod value;

pub use client::{PropertyClient, Session};
pub use config::{DaemonConfig, LogConfig, LogFormat};
pub use error::{ConfigError, PropertyError, RequestError, ServerError};
pub use property::{Interlock, PropertyTable, WriteOutcome};
pub use protocol::{Command, Request, Response};
pub use server::{PropertyServer, ServerOptions, ShutdownHandle};
pub use value::{Color, PropertyValue, ValueKind};

/// Default listening socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/prontrd.sock";

/// Largest accepted request, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 2048;
