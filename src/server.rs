//! UNIX socket property server.
//!
//! [`PropertyServer`] runs a single-threaded readiness loop over the
//! listening socket and every client connection. Each cycle waits in
//! `poll(2)` for at most the configured interval, then runs four phases in
//! order: accept, read and dispatch, write, and cleanup of errored
//! connections. The property table is only touched from this loop.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, info, warn};

use crate::config::{expand_path, DaemonConfig};
use crate::connection::{ConnectionId, ConnectionManager, FlushStatus, ReadOutcome};
use crate::dispatch::dispatch_frame;
use crate::error::ServerError;
use crate::lifecycle::remove_stale_socket;
use crate::property::PropertyTable;
use crate::MAX_MESSAGE_SIZE;

/// Signals that request an orderly shutdown.
pub const SHUTDOWN_SIGNALS: [i32; 4] = [
    signal_hook::consts::SIGINT,
    signal_hook::consts::SIGTERM,
    signal_hook::consts::SIGQUIT,
    signal_hook::consts::SIGHUP,
];

/// Event loop tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Permission bits for the socket file.
    pub socket_mode: u32,
    /// Upper bound on one readiness wait; also how quickly shutdown is noticed.
    pub poll_interval: Duration,
    pub max_message_size: usize,
    pub max_pending_responses: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            socket_mode: 0o600,
            poll_interval: Duration::from_millis(100),
            max_message_size: MAX_MESSAGE_SIZE,
            max_pending_responses: None,
        }
    }
}

/// Cloneable flag that stops a running [`PropertyServer`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to exit. It notices within one poll interval.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Route SIGINT, SIGTERM, SIGQUIT and SIGHUP to this handle.
    pub fn register_signals(&self) -> io::Result<()> {
        for signal in SHUTDOWN_SIGNALS {
            signal_hook::flag::register(signal, Arc::clone(&self.0))?;
        }
        Ok(())
    }
}

/// Property daemon server.
///
/// # Example
///
/// ```rust,no_run
/// use prontrd::device::{PowerSettle, SimulatedDevice};
/// use prontrd::PropertyServer;
///
/// let table = SimulatedDevice::new().table(PowerSettle::default())?;
/// let mut server = PropertyServer::new(table, "/tmp/prontrd.sock");
/// server.shutdown_handle().register_signals()?;
/// server.serve()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PropertyServer {
    table: PropertyTable,
    socket_path: PathBuf,
    options: ServerOptions,
    shutdown: ShutdownHandle,
}

impl PropertyServer {
    /// Create a server with default options. `~` in `socket_path` is expanded.
    pub fn new(table: PropertyTable, socket_path: impl AsRef<Path>) -> Self {
        Self::with_options(table, socket_path, ServerOptions::default())
    }

    pub fn with_options(
        table: PropertyTable,
        socket_path: impl AsRef<Path>,
        options: ServerOptions,
    ) -> Self {
        Self {
            table,
            socket_path: expand_path(socket_path.as_ref()),
            options,
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn from_config(table: PropertyTable, config: &DaemonConfig) -> Self {
        Self::with_options(table, config.socket_path(), config.server_options())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn table(&self) -> &PropertyTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut PropertyTable {
        &mut self.table
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stop the server gracefully.
    pub fn stop(&self) {
        self.shutdown.request();
    }

    /// Bind the socket and run the event loop until shutdown is requested.
    ///
    /// Connection faults are handled in the loop and never end it. On return
    /// every connection has been closed and the socket file removed.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        let listener = bind_listener(&self.socket_path, self.options.socket_mode)?;
        listener.set_nonblocking(true)?;

        let started_at = Instant::now();
        info!(
            socket = %self.socket_path.display(),
            properties = ?self.table.names().collect::<Vec<_>>(),
            "prontrd started"
        );

        let mut connections = ConnectionManager::new(
            self.options.max_message_size,
            self.options.max_pending_responses,
        );
        let mut read_buf = vec![0u8; self.options.max_message_size];

        let result = loop {
            if self.shutdown.is_requested() {
                break Ok(());
            }
            if let Err(e) = self.run_cycle(&listener, &mut connections, &mut read_buf) {
                break Err(e);
            }
        };

        connections.close_all();
        drop(listener);
        let _ = fs::remove_file(&self.socket_path);

        info!(
            uptime_secs = started_at.elapsed().as_secs(),
            "prontrd stopped"
        );
        result
    }

    fn run_cycle(
        &mut self,
        listener: &UnixListener,
        connections: &mut ConnectionManager,
        read_buf: &mut [u8],
    ) -> Result<(), ServerError> {
        let mut ids = Vec::with_capacity(connections.len());
        let mut fds = Vec::with_capacity(connections.len() + 1);
        fds.push(pollfd(listener.as_raw_fd(), libc::POLLIN));
        for id in connections.ids() {
            let Some(fd) = connections.raw_fd(id) else {
                continue;
            };
            let mut events = libc::POLLIN;
            if connections.has_pending_output(id) {
                events |= libc::POLLOUT;
            }
            ids.push(id);
            fds.push(pollfd(fd, events));
        }

        match poll(&mut fds, self.options.poll_interval) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(ServerError::Poll(e)),
        }

        if fds[0].revents & libc::POLLIN != 0 {
            accept_pending(listener, connections);
        }

        let ready: Vec<(ConnectionId, Readiness)> = ids
            .iter()
            .copied()
            .zip(fds[1..].iter().map(|fd| Readiness::from_revents(fd.revents)))
            .collect();

        for (id, readiness) in &ready {
            if readiness.readable {
                self.handle_readable(connections, *id, read_buf);
            }
        }

        // includes responses produced in this cycle
        for id in connections.ids() {
            if connections.has_pending_output(id) {
                handle_writable(connections, id);
            }
        }

        for (id, readiness) in &ready {
            if readiness.errored {
                if let Some(peer) = connections.peer(*id) {
                    warn!(connection = %id, peer, "Socket error, dropping connection");
                }
                connections.unregister(*id);
            } else if readiness.hung_up && !readiness.readable {
                connections.unregister(*id);
            }
        }

        Ok(())
    }

    fn handle_readable(
        &mut self,
        connections: &mut ConnectionManager,
        id: ConnectionId,
        read_buf: &mut [u8],
    ) {
        let _span = debug_span!("connection", id = %id).entered();

        match connections.read_from(id, read_buf) {
            ReadOutcome::Frames(frames) => {
                for frame in frames {
                    let response = dispatch_frame(&mut self.table, frame);
                    if let Err(e) = connections.enqueue(id, &response) {
                        warn!(
                            connection = %id,
                            error = %e,
                            "Client not draining responses, dropping connection"
                        );
                        connections.unregister(id);
                        break;
                    }
                }
            }
            ReadOutcome::Closed => {
                connections.unregister(id);
            }
            ReadOutcome::WouldBlock => {}
            ReadOutcome::Failed(e) => {
                warn!(connection = %id, error = %e, "Read failed");
                connections.unregister(id);
            }
        }
    }
}

fn accept_pending(listener: &UnixListener, connections: &mut ConnectionManager) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => match connections.register(stream) {
                Ok(id) => info!(
                    connection = %id,
                    peer = connections.peer(id).unwrap_or("unnamed"),
                    "Connection opened"
                ),
                Err(e) => warn!(error = %e, "Failed to register connection"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Accept error");
                break;
            }
        }
    }
}

/// Send at most one complete response.
fn handle_writable(connections: &mut ConnectionManager, id: ConnectionId) {
    match connections.flush_one(id) {
        Ok(FlushStatus::Sent) => debug!(connection = %id, "Response sent"),
        Ok(FlushStatus::Partial) => debug!(connection = %id, "Partial write"),
        Ok(FlushStatus::Idle | FlushStatus::WouldBlock) => {}
        Err(e) => {
            warn!(connection = %id, error = %e, "Write failed");
            connections.unregister(id);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Readiness {
    readable: bool,
    hung_up: bool,
    errored: bool,
}

impl Readiness {
    fn from_revents(revents: libc::c_short) -> Self {
        Self {
            readable: revents & libc::POLLIN != 0,
            hung_up: revents & libc::POLLHUP != 0,
            errored: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        }
    }
}

fn pollfd(fd: libc::c_int, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn poll(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: `fds` is an exclusively borrowed, initialized slice for the
    // duration of the call and its length is passed alongside.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

fn bind_listener(path: &Path, mode: u32) -> Result<UnixListener, ServerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if remove_stale_socket(path)? {
        debug!(socket = %path.display(), "Removed stale socket");
    }

    let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(listener)
}
