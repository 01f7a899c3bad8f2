//! Incremental message framer for backend byte streams.
//!
//! Bytes arrive from the transport in chunks whose boundaries have nothing to
//! do with message boundaries. The [`Framer`] buffers whatever it cannot
//! resolve yet and turns the rest into an ordered sequence of [`FrameEvent`]s:
//!
//! ```text
//! chunk: [d 00 00 00 09 a b] [c d e] [c 00 00 00 04]
//! events: Message('d', 5), Content("ab"), Content("cde"), Message('c', 0)
//! ```
//!
//! The framer is type-agnostic. It never looks at the type byte beyond
//! reporting it, so callers decide what each message means.
//!
//! Two ways to drive it:
//! - push: [`Framer::read`] feeds a chunk and hands every event to a
//!   [`FrameHandler`].
//! - pull: [`Framer::feed`] then [`Framer::next_event`] until `None`, which
//!   lets the caller stop at a message boundary and leave the rest buffered.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::codec::{HEADER_LEN, LENGTH_FIELD_LEN, read_u8, read_u32};

/// Event produced by the framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A message header was parsed.
    Message {
        /// Message type byte
        type_byte: u8,
        /// Payload length (declared length minus the length field itself)
        len: usize,
    },
    /// Payload bytes of the current message.
    ///
    /// A payload may be split into any number of these.
    Content(Bytes),
}

/// Receiver for framer events in push mode.
pub trait FrameHandler {
    /// Called when a message header has been parsed.
    fn message(&mut self, type_byte: u8, len: usize) -> Result<()>;

    /// Called with the next fragment of the current message payload.
    fn content(&mut self, data: Bytes) -> Result<()>;
}

impl FrameHandler for Vec<FrameEvent> {
    fn message(&mut self, type_byte: u8, len: usize) -> Result<()> {
        self.push(FrameEvent::Message { type_byte, len });
        Ok(())
    }

    fn content(&mut self, data: Bytes) -> Result<()> {
        self.push(FrameEvent::Content(data));
        Ok(())
    }
}

/// Incremental framer for `[type][length][payload]` messages.
#[derive(Debug, Default)]
pub struct Framer {
    /// Received bytes not yet resolved into a header or content span.
    pending: BytesMut,
    /// Payload bytes still owed for the current message.
    unread_content_bytes: usize,
}

impl Framer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk from the transport without parsing it.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Resolve the next event from buffered bytes.
    ///
    /// Returns `Ok(None)` when the buffered bytes are not enough for either a
    /// full header or any content. A header is only parsed once all five of
    /// its bytes are buffered.
    pub fn next_event(&mut self) -> Result<Option<FrameEvent>> {
        if self.unread_content_bytes > 0 {
            if self.pending.is_empty() {
                return Ok(None);
            }
            let take = self.unread_content_bytes.min(self.pending.len());
            self.unread_content_bytes -= take;
            let data = self.pending.split_to(take).freeze();
            tracing::trace!(len = take, owed = self.unread_content_bytes, "framer content");
            return Ok(Some(FrameEvent::Content(data)));
        }

        if self.pending.len() < HEADER_LEN {
            return Ok(None);
        }

        let (type_byte, rest) = read_u8(&self.pending)?;
        let (declared, _) = read_u32(rest)?;
        let declared = declared as usize;
        if declared < LENGTH_FIELD_LEN {
            return Err(Error::Protocol(format!(
                "message '{}' declares length {} (minimum is {})",
                type_byte as char, declared, LENGTH_FIELD_LEN
            )));
        }

        self.pending.advance(HEADER_LEN);
        let len = declared - LENGTH_FIELD_LEN;
        self.unread_content_bytes = len;
        tracing::trace!(type_byte = %(type_byte as char), len, "framer message");
        Ok(Some(FrameEvent::Message { type_byte, len }))
    }

    /// Feed a chunk and deliver every event it completes to `handler`.
    ///
    /// Returns once all available bytes are parsed. An incomplete trailing
    /// header stays buffered for the next call. If the handler fails, the
    /// remaining bytes stay buffered and the error is returned.
    pub fn read<H: FrameHandler>(&mut self, chunk: &[u8], handler: &mut H) -> Result<()> {
        self.feed(chunk);
        while let Some(event) = self.next_event()? {
            match event {
                FrameEvent::Message { type_byte, len } => handler.message(type_byte, len)?,
                FrameEvent::Content(data) => handler.content(data)?,
            }
        }
        Ok(())
    }

    /// Feed a chunk and collect the events it completes.
    pub fn read_events(&mut self, chunk: &[u8]) -> Result<Vec<FrameEvent>> {
        let mut events = Vec::new();
        self.read(chunk, &mut events)?;
        Ok(events)
    }

    /// Payload bytes still owed for the current message.
    pub fn unread_content_bytes(&self) -> usize {
        self.unread_content_bytes
    }

    /// Number of bytes buffered but not yet resolved.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if the framer sits exactly on a message boundary.
    pub fn at_boundary(&self) -> bool {
        self.unread_content_bytes == 0 && self.pending.is_empty()
    }
}
