//! Connection bookkeeping for the event loop.
//!
//! [`ConnectionManager`] owns every accepted client stream together with its
//! inbound [`FrameBuffer`] and a FIFO queue of encoded responses waiting to
//! be written. All streams are non-blocking.

use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{DecodeError, QueueFull};
use crate::framing::FrameBuffer;
use crate::protocol::Response;

/// Identity of an accepted connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of one non-blocking read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Complete frames extracted from the bytes read so far (may be empty if
    /// a message is still partial).
    Frames(Vec<Result<Value, DecodeError>>),
    /// Peer closed the connection (zero-length read).
    Closed,
    /// Nothing to read right now.
    WouldBlock,
    Failed(io::Error),
}

/// Result of one non-blocking write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Nothing queued.
    Idle,
    /// A whole response finished transmitting.
    Sent,
    /// Part of a response was written; the rest stays in flight.
    Partial,
    /// The socket cannot accept data right now.
    WouldBlock,
}

struct Connection {
    stream: UnixStream,
    peer: String,
    inbound: FrameBuffer,
    outbound: VecDeque<Vec<u8>>,
    /// Response currently being written and how much of it has gone out.
    in_flight: Option<(Vec<u8>, usize)>,
    opened_at: Instant,
    requests: u64,
}

impl Connection {
    fn pending(&self) -> usize {
        self.outbound.len() + usize::from(self.in_flight.is_some())
    }
}

/// Tracks open client connections and their outbound queues.
pub struct ConnectionManager {
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
    max_message_size: usize,
    max_pending: Option<usize>,
}

impl ConnectionManager {
    /// `max_pending` bounds each outbound queue; `None` leaves it unbounded.
    pub fn new(max_message_size: usize, max_pending: Option<usize>) -> Self {
        Self {
            connections: BTreeMap::new(),
            next_id: 1,
            max_message_size,
            max_pending,
        }
    }

    /// Start tracking an accepted stream. The stream is switched to
    /// non-blocking mode.
    pub fn register(&mut self, stream: UnixStream) -> io::Result<ConnectionId> {
        stream.set_nonblocking(true)?;

        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let peer = describe_peer(&stream);
        debug!(connection = %id, peer = %peer, "Connection registered");

        self.connections.insert(
            id,
            Connection {
                stream,
                peer,
                inbound: FrameBuffer::new(self.max_message_size),
                outbound: VecDeque::new(),
                in_flight: None,
                opened_at: Instant::now(),
                requests: 0,
            },
        );
        Ok(id)
    }

    /// Append an encoded response to a connection's queue.
    ///
    /// Responses for a connection that is no longer tracked are dropped.
    pub fn enqueue(&mut self, id: ConnectionId, response: &Response) -> Result<(), QueueFull> {
        let Some(conn) = self.connections.get_mut(&id) else {
            debug!(connection = %id, "Dropping response for closed connection");
            return Ok(());
        };

        if let Some(limit) = self.max_pending {
            if conn.pending() >= limit {
                return Err(QueueFull {
                    connection: id.as_u64(),
                    limit,
                });
            }
        }

        conn.requests += 1;
        conn.outbound.push_back(response.encode());
        Ok(())
    }

    /// Pop the oldest queued response, if any.
    pub fn drain_one(&mut self, id: ConnectionId) -> Option<Vec<u8>> {
        self.connections.get_mut(&id)?.outbound.pop_front()
    }

    /// Stop tracking a connection and close its stream.
    ///
    /// Returns `false` if the connection was already gone, so calling this
    /// twice in one cycle is harmless.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        let Some(conn) = self.connections.remove(&id) else {
            return false;
        };

        info!(
            connection = %id,
            peer = %conn.peer,
            requests = conn.requests,
            dropped = conn.pending(),
            open_ms = conn.opened_at.elapsed().as_millis() as u64,
            "Connection closed"
        );
        // dropping the stream closes the descriptor
        drop(conn);
        true
    }

    /// Close every tracked connection.
    pub fn close_all(&mut self) {
        for id in self.ids() {
            self.unregister(id);
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Tracked ids in accept order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Responses queued or in flight for `id`.
    pub fn pending(&self, id: ConnectionId) -> usize {
        self.connections.get(&id).map_or(0, Connection::pending)
    }

    pub fn has_pending_output(&self, id: ConnectionId) -> bool {
        self.pending(id) > 0
    }

    pub fn raw_fd(&self, id: ConnectionId) -> Option<RawFd> {
        self.connections.get(&id).map(|c| c.stream.as_raw_fd())
    }

    /// Peer description used in diagnostics.
    pub fn peer(&self, id: ConnectionId) -> Option<&str> {
        self.connections.get(&id).map(|c| c.peer.as_str())
    }

    /// Read once from `id` into `buf` and extract any complete frames.
    pub fn read_from(&mut self, id: ConnectionId, buf: &mut [u8]) -> ReadOutcome {
        let Some(conn) = self.connections.get_mut(&id) else {
            return ReadOutcome::Closed;
        };

        match conn.stream.read(buf) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => {
                conn.inbound.extend(&buf[..n]);
                ReadOutcome::Frames(conn.inbound.drain_frames())
            }
            Err(e) if is_transient(&e) => ReadOutcome::WouldBlock,
            Err(e) => ReadOutcome::Failed(e),
        }
    }

    /// Write as much of the oldest pending response as the socket accepts.
    ///
    /// A partially written response stays in flight and is continued on the
    /// next call before anything else is dequeued.
    pub fn flush_one(&mut self, id: ConnectionId) -> io::Result<FlushStatus> {
        let idle = self
            .connections
            .get(&id)
            .map_or(true, |c| c.in_flight.is_none());
        if idle {
            let next = self.drain_one(id);
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.in_flight = next.map(|payload| (payload, 0));
            }
        }

        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(FlushStatus::Idle);
        };
        let Some((payload, offset)) = conn.in_flight.as_mut() else {
            return Ok(FlushStatus::Idle);
        };

        match conn.stream.write(&payload[*offset..]) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket accepted zero bytes",
            )),
            Ok(n) => {
                *offset += n;
                if *offset < payload.len() {
                    return Ok(FlushStatus::Partial);
                }
                conn.in_flight = None;
                Ok(FlushStatus::Sent)
            }
            Err(e) if is_transient(&e) => Ok(FlushStatus::WouldBlock),
            Err(e) => Err(e),
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Best-effort peer identification: the client's bound path if it has one,
/// otherwise its pid from the kernel's peer credentials.
fn describe_peer(stream: &UnixStream) -> String {
    if let Some(path) = stream
        .peer_addr()
        .ok()
        .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
    {
        return path;
    }

    match peer_pid(stream.as_raw_fd()) {
        Some(pid) => format!("pid {}", pid),
        None => "unnamed".to_string(),
    }
}

#[cfg(target_os = "linux")]
fn peer_pid(fd: RawFd) -> Option<i32> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: `cred` and `len` are valid for writes and sized for SO_PEERCRED.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    (rc == 0 && cred.pid > 0).then_some(cred.pid)
}

#[cfg(not(target_os = "linux"))]
fn peer_pid(_fd: RawFd) -> Option<i32> {
    None
}
