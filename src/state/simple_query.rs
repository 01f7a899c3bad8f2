//! Simple query protocol state machine.

use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, ErrorResponse, RawMessage, ReadyForQuery, msg_type,
};
use crate::protocol::types::TransactionStatus;

use super::{Action, StateMachine};

/// Simple query protocol state machine that discards result rows.
#[derive(Debug, Default)]
pub struct SimpleQueryStateMachine {
    rows_affected: Option<u64>,
    error: Option<Error>,
    transaction_status: TransactionStatus,
    finished: bool,
}

impl SimpleQueryStateMachine {
    /// Create a new simple query state machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows affected by the last command in the query string.
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }
}

impl StateMachine for SimpleQueryStateMachine {
    fn step(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        if self.finished {
            return Err(Error::Protocol(format!(
                "Unexpected message after ReadyForQuery: '{}'",
                msg.type_byte as char
            )));
        }

        if msg.is_async() {
            msg.trace_discarded();
            return Ok(Action::ReadMessage);
        }

        match msg.type_byte {
            msg_type::ROW_DESCRIPTION | msg_type::DATA_ROW | msg_type::EMPTY_QUERY_RESPONSE => {
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(msg.payload)?;
                // More commands may follow in a multi-statement query
                self.rows_affected = complete.rows_affected();
                Ok(Action::ReadMessage)
            }
            msg_type::ERROR_RESPONSE => {
                // After error, we still need to wait for ReadyForQuery
                let error = ErrorResponse::parse(msg.payload)?;
                self.error = Some(error.into_error());
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(msg.payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.finished = true;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message in query response: '{}'",
                other as char
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
