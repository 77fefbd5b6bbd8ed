//! Connection state management.

use std::io::{self, Read, Write};

use bytes::BytesMut;
use driftchat_types::ReplicaId;
use driftchat_wire::{Envelope, WireError};
use mio::net::TcpStream;
use mio::{Interest, Token};

/// Initial capacity for per-connection buffers; grows as needed up to
/// the envelope bound.
const BUFFER_SIZE: usize = 16 * 1024;

/// Lifecycle of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound connect in progress; becomes `Connected` on the first
    /// write-readiness event.
    Connecting,
    /// Established in either direction.
    Connected,
    /// Closed locally or by the remote; awaiting removal from the pool.
    Closed,
}

/// One socket with framed envelope buffers.
pub struct Connection {
    pub token: Token,
    pub stream: TcpStream,
    pub state: ConnectionState,
    /// The peer replica on this link, once known. Outbound links know
    /// it at connect time; inbound links learn it from the first
    /// verified envelope.
    pub peer: Option<ReplicaId>,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
}

impl Connection {
    /// Wraps an accepted (already-established) socket.
    pub fn accepted(token: Token, stream: TcpStream) -> Self {
        Self {
            token,
            stream,
            state: ConnectionState::Connected,
            peer: None,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Wraps an in-progress outbound connect to a known peer.
    pub fn connecting(token: Token, stream: TcpStream, peer: ReplicaId) -> Self {
        Self {
            token,
            stream,
            state: ConnectionState::Connecting,
            peer: Some(peer),
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Drains the socket into the read buffer.
    ///
    /// Returns `false` when the remote closed the connection.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Flushes the write buffer to the socket.
    ///
    /// Returns `true` once the buffer is empty.
    pub fn write(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Attempts to decode one complete envelope from the read buffer.
    pub fn try_decode_envelope(&mut self) -> Result<Option<Envelope>, WireError> {
        Envelope::decode(&mut self.read_buf)
    }

    /// Queues an envelope for transmission.
    pub fn queue_envelope(&mut self, envelope: &Envelope) {
        envelope.encode_into(&mut self.write_buf);
    }

    /// The readiness interests this connection currently needs.
    pub fn interest(&self) -> Interest {
        match self.state {
            // A connecting socket signals completion via writability.
            ConnectionState::Connecting => Interest::WRITABLE,
            ConnectionState::Connected if !self.write_buf.is_empty() => {
                Interest::READABLE | Interest::WRITABLE
            }
            _ => Interest::READABLE,
        }
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }
}
