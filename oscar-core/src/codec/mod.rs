//! Frame codec for `tokio_util::codec::Framed`.
//!
//! The encoder stamps outgoing sequence numbers, so exactly one writer may
//! own an encoding `FrameCodec` per connection. The decoder is independent
//! of the outgoing counter and only tracks the inbound sequence for logging.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::OscarError;
use crate::header::{FRAME_HEADER_LEN, FrameHeader};
use crate::packet::{Frame, MAX_BODY_SIZE};

#[derive(Debug)]
pub struct FrameCodec {
    next_outgoing: u16,
    last_incoming: Option<u16>,
    max_body: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_initial_sequence(0)
    }

    /// Start the outgoing sequence at `first`.
    pub fn with_initial_sequence(first: u16) -> Self {
        Self {
            next_outgoing: first,
            last_incoming: None,
            max_body: MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body.min(MAX_BODY_SIZE);
        self
    }

    /// The sequence number the next encoded frame will carry.
    pub fn next_sequence(&self) -> u16 {
        self.next_outgoing
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl tokio_util::codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = OscarError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // Check the marker as soon as one byte is present.
        if src[0] != crate::header::FRAME_MARKER {
            return Err(OscarError::InvalidMarker(src[0]));
        }
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let header = FrameHeader::from_bytes(&src[..FRAME_HEADER_LEN])?;
        let body_len = header.length as usize;
        if body_len > self.max_body {
            return Err(OscarError::FrameTooLarge {
                size: body_len,
                max: self.max_body,
            });
        }
        if src.len() < FRAME_HEADER_LEN + body_len {
            src.reserve(FRAME_HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let body: Bytes = src.split_to(body_len).freeze();

        if let Some(last) = self.last_incoming {
            let expected = last.wrapping_add(1);
            if header.sequence != expected {
                tracing::debug!(
                    "inbound sequence gap: expected {expected}, got {}",
                    header.sequence
                );
            }
        }
        self.last_incoming = Some(header.sequence);

        Ok(Some(Frame {
            channel: header.channel,
            sequence: header.sequence,
            body,
        }))
    }
}

impl tokio_util::codec::Encoder<Frame> for FrameCodec {
    type Error = OscarError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.body.len() > self.max_body {
            return Err(OscarError::FrameTooLarge {
                size: item.body.len(),
                max: self.max_body,
            });
        }
        let header = FrameHeader {
            channel: item.channel,
            sequence: self.next_outgoing,
            length: item.body.len() as u16,
        };
        self.next_outgoing = self.next_outgoing.wrapping_add(1);

        dst.reserve(FRAME_HEADER_LEN + item.body.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&item.body);
        Ok(())
    }
}
