//! COPY FROM STDIN session state machine.
//!
//! The outbound half of COPY FROM needs no framing state: every write is
//! wrapped into a CopyData message as it is made. This state machine only
//! tracks the server side of the session:
//!
//! ```text
//! Query ──> CopyInResponse ──> (CopyData*) ──> CopyDone ──> CommandComplete ──> ReadyForQuery
//!                                          └─> CopyFail ──> ErrorResponse ───> ReadyForQuery
//! ```

use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, CopyFormat, CopyInResponse, ErrorResponse, RawMessage, ReadyForQuery,
    msg_type,
};
use crate::protocol::types::TransactionStatus;

use super::{Action, StateMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingStart,
    Streaming,
    WaitingComplete,
    Finished,
}

/// COPY FROM session state machine.
#[derive(Debug)]
pub struct CopyInStateMachine {
    state: State,
    format: Option<CopyFormat>,
    row_count: Option<u64>,
    error: Option<Error>,
    aborting: bool,
    transaction_status: TransactionStatus,
}

impl Default for CopyInStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyInStateMachine {
    /// Create a state machine waiting for CopyInResponse.
    pub fn new() -> Self {
        Self {
            state: State::WaitingStart,
            format: None,
            row_count: None,
            error: None,
            aborting: false,
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Formats announced by CopyInResponse.
    pub fn format(&self) -> Option<&CopyFormat> {
        self.format.as_ref()
    }

    /// Rows reported by the server's CommandComplete.
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    /// Returns true while the server accepts CopyData.
    pub fn is_streaming(&self) -> bool {
        self.state == State::Streaming
    }

    /// Returns true once ReadyForQuery has been seen.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Record that CopyDone (or CopyFail when `aborting`) has been queued.
    pub fn end_input(&mut self, aborting: bool) -> Result<()> {
        if self.state != State::Streaming {
            return Err(Error::InvalidUsage(
                "COPY FROM input already ended".into(),
            ));
        }
        self.aborting = aborting;
        self.state = State::WaitingComplete;
        Ok(())
    }

    fn handle_start(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        match msg.type_byte {
            msg_type::COPY_IN_RESPONSE => {
                let response = CopyInResponse::parse(msg.payload)?;
                tracing::debug!(binary = response.0.is_binary(), "COPY FROM session started");
                self.format = Some(response.0);
                self.state = State::Streaming;
                Ok(Action::Finished)
            }
            msg_type::ERROR_RESPONSE => {
                // The query failed before COPY started; ReadyForQuery follows.
                let error = ErrorResponse::parse(msg.payload)?;
                self.error = Some(error.into_error());
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                self.finish(msg.payload)?;
                if self.error.is_none() {
                    self.error = Some(Error::Protocol(
                        "ReadyForQuery before CopyInResponse".into(),
                    ));
                }
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message while waiting for CopyInResponse: '{}'",
                other as char
            ))),
        }
    }

    fn handle_complete(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        match msg.type_byte {
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(msg.payload)?;
                self.row_count = complete.rows_affected();
                tracing::debug!(tag = complete.tag, "COPY FROM session done");
                Ok(Action::ReadMessage)
            }
            msg_type::ERROR_RESPONSE => {
                let error = ErrorResponse::parse(msg.payload)?.into_error();
                if self.aborting {
                    tracing::debug!("COPY FROM aborted: {error}");
                } else {
                    self.error = Some(error);
                }
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                self.finish(msg.payload)?;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message after COPY FROM input: '{}'",
                other as char
            ))),
        }
    }

    fn finish(&mut self, payload: &[u8]) -> Result<()> {
        let ready = ReadyForQuery::parse(payload)?;
        self.transaction_status = ready.transaction_status().unwrap_or_default();
        self.state = State::Finished;
        Ok(())
    }
}

impl StateMachine for CopyInStateMachine {
    fn step(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        if msg.is_async() {
            msg.trace_discarded();
            return Ok(Action::ReadMessage);
        }

        match self.state {
            State::WaitingStart => self.handle_start(msg),
            State::WaitingComplete => self.handle_complete(msg),
            State::Streaming | State::Finished => Err(Error::Protocol(format!(
                "Unexpected message in state {:?}: '{}'",
                self.state, msg.type_byte as char
            ))),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}
