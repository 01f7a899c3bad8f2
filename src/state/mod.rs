//! Sans-I/O state machines for PostgreSQL protocol.
//!
//! These state machines handle the protocol logic without performing any I/O.
//! They consume complete messages or framer events and tell the caller what
//! to do next.

pub mod action;
pub mod copy_in;
pub mod copy_out;
pub mod simple_query;
pub mod sync;

pub use action::Action;
pub use copy_in::CopyInStateMachine;
pub use copy_out::{CopyOutStateMachine, CopyOutStep};
pub use simple_query::SimpleQueryStateMachine;
pub use sync::SyncStateMachine;

use crate::error::{Error, Result};
use crate::protocol::backend::RawMessage;
use crate::protocol::types::TransactionStatus;

/// A state machine driven one complete backend message at a time.
pub trait StateMachine {
    /// Process one message from the server.
    ///
    /// An `Err` means the message stream violated the protocol for this
    /// state. Server errors are held until ReadyForQuery so the connection
    /// stays in step with the server, then surfaced through `take_error`.
    fn step(&mut self, msg: RawMessage<'_>) -> Result<Action>;

    /// Transaction status from the last ReadyForQuery.
    fn transaction_status(&self) -> TransactionStatus;

    /// Take the server error collected before finishing, if any.
    fn take_error(&mut self) -> Option<Error>;
}
