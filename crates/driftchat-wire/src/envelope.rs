//! The on-wire envelope: `header | body | signature`.
//!
//! Framing and byte-level encode/decode live here; authentication
//! (checksum and signature) lives in [`crate::Transport`]. Decoding is
//! incremental so the server can feed it partial socket reads.

use bytes::{Buf, Bytes, BytesMut};
use driftchat_types::MAX_ENVELOPE_BODY;

use crate::header::HEADER_SIZE;
use crate::transport::SIGNATURE_SIZE;
use crate::{Header, WireError};

/// A complete envelope as exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: Header,
    pub body: Bytes,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Envelope {
    /// Total encoded size of this envelope on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body.len() + SIGNATURE_SIZE
    }

    /// Appends the encoded envelope to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.body);
        buf.extend_from_slice(&self.signature);
    }

    /// Attempts to decode one envelope from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// envelope; the caller reads more bytes and retries. On success the
    /// consumed bytes are removed from `buf`.
    ///
    /// # Errors
    ///
    /// - [`WireError::InvalidMagicOrVersion`] / [`WireError::UnknownCommand`]
    ///   if the header is not ours (the connection is unrecoverable:
    ///   framing is lost)
    /// - [`WireError::BodyTooLarge`] if the header claims a body over the
    ///   1 MiB bound
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = Header::from_bytes(&buf[..HEADER_SIZE])?;

        let body_len = header.body_len as usize;
        if body_len > MAX_ENVELOPE_BODY {
            return Err(WireError::BodyTooLarge { len: body_len });
        }

        let total = HEADER_SIZE + body_len + SIGNATURE_SIZE;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let body = buf.split_to(body_len).freeze();
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&buf[..SIGNATURE_SIZE]);
        buf.advance(SIGNATURE_SIZE);

        Ok(Some(Envelope {
            header,
            body,
            signature,
        }))
    }
}
