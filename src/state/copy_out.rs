//! COPY TO STDOUT session state machine.
//!
//! Consumes [`FrameEvent`]s for one session and accumulates CopyData payload
//! bytes. The caller decides when a "cycle" ends (normally after every
//! transport chunk) and takes the accumulated bytes as one push with
//! [`CopyOutStateMachine::take_chunk`].
//!
//! Recognized messages:
//! - CopyOutResponse: session start, accepted once
//! - CopyData: one row, counted once per message however it is fragmented
//! - CopyDone: normal end
//! - ErrorResponse: abnormal end, surfaced with the server fields intact
//! - NoticeResponse, ParameterStatus, NotificationResponse: discarded
//!
//! Anything else is a protocol violation and ends the session.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::backend::{CopyFormat, CopyOutResponse, ErrorResponse, RawMessage, msg_type};
use crate::protocol::framer::FrameEvent;

/// Outcome of one framer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutStep {
    /// Keep feeding events.
    Continue,
    /// CopyDone was seen. Events after it belong to the connection.
    Finished,
}

/// COPY TO session state machine.
#[derive(Debug, Default)]
pub struct CopyOutStateMachine {
    got_start: bool,
    finished: bool,
    awaiting_input: bool,
    row_count: u64,
    /// Type byte of the message whose content is arriving.
    current: Option<u8>,
    /// Content bytes still expected for `current`.
    remaining: usize,
    /// Payload of the current non-CopyData message being assembled.
    payload: BytesMut,
    /// CopyData bytes accumulated during the current cycle.
    chunk: BytesMut,
    format: Option<CopyFormat>,
}

impl CopyOutStateMachine {
    /// Create a new state machine for one session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of CopyData messages seen so far.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Returns true once CopyOutResponse has been seen.
    pub fn got_start(&self) -> bool {
        self.got_start
    }

    /// Returns true if the server answered with CopyInResponse.
    ///
    /// The server then waits for COPY FROM input and only returns to
    /// ReadyForQuery after CopyDone or CopyFail.
    pub fn awaiting_input(&self) -> bool {
        self.awaiting_input
    }

    /// Returns true once the session has ended, normally or not.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Formats announced by CopyOutResponse.
    ///
    /// `None` until the start message arrives, and also when the server sent
    /// an empty CopyOutResponse payload.
    pub fn format(&self) -> Option<&CopyFormat> {
        self.format.as_ref()
    }

    /// Take the CopyData bytes accumulated since the last call.
    pub fn take_chunk(&mut self) -> Option<Bytes> {
        if self.chunk.is_empty() {
            None
        } else {
            Some(self.chunk.split().freeze())
        }
    }

    /// Process one framer event.
    ///
    /// Returns `Err` for framing violations and for ErrorResponse. Either
    /// way the session is over afterwards. Bytes accumulated before the
    /// failing event are kept for `take_chunk`.
    pub fn step(&mut self, event: FrameEvent) -> Result<CopyOutStep> {
        if self.finished {
            return Err(Error::Protocol("COPY session already ended".into()));
        }
        match event {
            FrameEvent::Message { type_byte, len } => self.handle_message(type_byte, len),
            FrameEvent::Content(data) => self.handle_content(data),
        }
    }

    fn handle_message(&mut self, type_byte: u8, len: usize) -> Result<CopyOutStep> {
        self.current = Some(type_byte);
        self.remaining = len;
        self.payload.clear();

        match type_byte {
            msg_type::COPY_OUT_RESPONSE => {
                if self.got_start {
                    return self.fail(Error::Protocol(
                        "Unexpected CopyOutResponse message (H)".into(),
                    ));
                }
                self.got_start = true;
                tracing::debug!("COPY TO session started");
                Ok(CopyOutStep::Continue)
            }
            msg_type::COPY_DATA => {
                self.row_count += 1;
                Ok(CopyOutStep::Continue)
            }
            msg_type::PARAMETER_STATUS
            | msg_type::NOTICE_RESPONSE
            | msg_type::NOTIFICATION_RESPONSE => Ok(CopyOutStep::Continue),
            msg_type::COPY_DONE => {
                self.finished = true;
                tracing::debug!(rows = self.row_count, "COPY TO session done");
                Ok(CopyOutStep::Finished)
            }
            msg_type::COPY_IN_RESPONSE => {
                self.awaiting_input = true;
                self.fail(Error::Protocol(
                    "Unexpected PostgreSQL message G (statement is COPY FROM)".into(),
                ))
            }
            msg_type::ERROR_RESPONSE => {
                if len == 0 {
                    self.server_error()
                } else {
                    Ok(CopyOutStep::Continue)
                }
            }
            other => self.fail(Error::Protocol(format!(
                "Unexpected PostgreSQL message {}",
                other as char
            ))),
        }
    }

    fn handle_content(&mut self, data: Bytes) -> Result<CopyOutStep> {
        self.remaining = self.remaining.saturating_sub(data.len());

        match self.current {
            Some(msg_type::COPY_DATA) => self.chunk.extend_from_slice(&data),
            Some(other) => {
                self.payload.extend_from_slice(&data);
                if self.remaining == 0 {
                    return self.complete_message(other);
                }
            }
            None => {}
        }
        Ok(CopyOutStep::Continue)
    }

    /// Called once the full payload of a non-CopyData message is buffered.
    fn complete_message(&mut self, type_byte: u8) -> Result<CopyOutStep> {
        match type_byte {
            msg_type::COPY_OUT_RESPONSE => match CopyOutResponse::parse(&self.payload) {
                Ok(response) => {
                    self.format = Some(response.0);
                    Ok(CopyOutStep::Continue)
                }
                Err(e) => self.fail(e),
            },
            msg_type::ERROR_RESPONSE => self.server_error(),
            other => {
                RawMessage::new(other, &self.payload).trace_discarded();
                Ok(CopyOutStep::Continue)
            }
        }
    }

    fn server_error(&mut self) -> Result<CopyOutStep> {
        let error = match ErrorResponse::parse(&self.payload) {
            Ok(response) => response.into_error(),
            Err(e) => e,
        };
        tracing::debug!(rows = self.row_count, "COPY TO session failed: {error}");
        self.fail(error)
    }

    fn fail(&mut self, error: Error) -> Result<CopyOutStep> {
        self.finished = true;
        Err(error)
    }
}
