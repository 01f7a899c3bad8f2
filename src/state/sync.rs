//! State machine that brings a connection back to ReadyForQuery.
//!
//! Used after a COPY session detaches: whatever the server still has in
//! flight for that session (leftover CopyData, CommandComplete, the error
//! that answers a CopyFail) is skipped. Errors were already reported by the
//! session that caused them, so they are only logged here.

use crate::error::{Error, Result};
use crate::protocol::backend::{CommandComplete, ErrorResponse, RawMessage, ReadyForQuery, msg_type};
use crate::protocol::types::TransactionStatus;

use super::{Action, StateMachine};

/// Skips messages until ReadyForQuery.
#[derive(Debug, Default)]
pub struct SyncStateMachine {
    skipped: usize,
    awaiting_input: bool,
    transaction_status: TransactionStatus,
}

impl SyncStateMachine {
    /// Create a new sync state machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the drain stopped at a CopyInResponse.
    ///
    /// ReadyForQuery only follows once CopyFail has been sent.
    pub fn awaiting_input(&self) -> bool {
        self.awaiting_input
    }

    /// Number of messages skipped before ReadyForQuery.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl StateMachine for SyncStateMachine {
    fn step(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        match msg.type_byte {
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(msg.payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                tracing::debug!(skipped = self.skipped, "connection back at ReadyForQuery");
                return Ok(Action::Finished);
            }
            msg_type::COPY_IN_RESPONSE => {
                tracing::debug!("server waits for COPY FROM input while syncing");
                self.awaiting_input = true;
                return Ok(Action::Finished);
            }
            msg_type::ERROR_RESPONSE => match ErrorResponse::parse(msg.payload) {
                Ok(error) => tracing::debug!("skipping error while syncing: {}", error.fields),
                Err(e) => tracing::debug!("skipping unparsable error while syncing: {e}"),
            },
            msg_type::COMMAND_COMPLETE => {
                if let Ok(complete) = CommandComplete::parse(msg.payload) {
                    tracing::debug!(tag = complete.tag, "skipping command completion");
                }
            }
            other => tracing::trace!("skipping message '{}'", other as char),
        }
        self.skipped += 1;
        Ok(Action::ReadMessage)
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn take_error(&mut self) -> Option<Error> {
        None
    }
}
