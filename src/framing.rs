//! Inbound message framing.
//!
//! Clients are not required to terminate requests with a newline: a bare
//! JSON object per `send()` is accepted, as are newline-delimited or
//! back-to-back objects. [`FrameBuffer`] accumulates bytes until a complete
//! JSON value is available, so a request split across reads is still
//! decoded as one message.

use serde_json::Value;

use crate::error::DecodeError;

/// Per-connection reassembly buffer.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    limit: usize,
    /// Dropping the rest of a rejected message. Ends at the next newline,
    /// or when a new read starts with `{`.
    discarding: bool,
}

impl FrameBuffer {
    /// Create a buffer that refuses messages longer than `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(limit.min(4096)),
            limit,
            discarding: false,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        if self.discarding && self.buffer.is_empty() && starts_object(data) {
            self.discarding = false;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes waiting to be framed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    /// Take every complete frame currently buffered.
    pub fn drain_frames(&mut self) -> Vec<Result<Value, DecodeError>> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Take the next complete frame, if any.
    ///
    /// A syntax error yields one `Err` and discards input through the first
    /// newline after the offending byte. An incomplete value is left
    /// buffered unless it has already reached the size limit.
    pub fn next_frame(&mut self) -> Option<Result<Value, DecodeError>> {
        if self.discarding && !self.skip_through(0) {
            return None;
        }

        let start = match self.buffer.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => start,
            None => {
                self.buffer.clear();
                return None;
            }
        };
        self.buffer.drain(..start);

        let (parsed, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
            let parsed = stream.next();
            (parsed, stream.byte_offset())
        };

        match parsed {
            Some(Ok(value)) => {
                self.buffer.drain(..consumed);
                if consumed > self.limit {
                    return Some(Err(DecodeError::Oversized { limit: self.limit }));
                }
                Some(Ok(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buffer.len() >= self.limit {
                    self.buffer.clear();
                    self.discarding = true;
                    return Some(Err(DecodeError::Oversized { limit: self.limit }));
                }
                None
            }
            Some(Err(e)) => {
                let offset = error_offset(&self.buffer, &e);
                self.skip_through(offset);
                Some(Err(DecodeError::InvalidJson(e.to_string())))
            }
            None => {
                self.buffer.clear();
                None
            }
        }
    }

    /// Drop bytes through the first newline at or after `offset`. Returns
    /// `true` once a newline has been consumed and normal framing can resume.
    fn skip_through(&mut self, offset: usize) -> bool {
        let newline = self.buffer[offset..].iter().position(|&b| b == b'\n');
        match newline {
            Some(pos) => {
                self.buffer.drain(..=offset + pos);
                self.discarding = false;
                true
            }
            None => {
                self.buffer.clear();
                self.discarding = true;
                false
            }
        }
    }
}

fn starts_object(data: &[u8]) -> bool {
    data.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{')
}

/// Byte offset of the character a syntax error was reported at.
///
/// `serde_json` reports 1-based lines and columns; column 0 points at the
/// newline that ends the previous line.
fn error_offset(buffer: &[u8], err: &serde_json::Error) -> usize {
    let line_start = if err.line() <= 1 {
        0
    } else {
        buffer
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b == b'\n')
            .nth(err.line() - 2)
            .map_or(buffer.len(), |(i, _)| i + 1)
    };
    (line_start + err.column())
        .saturating_sub(1)
        .min(buffer.len())
}
