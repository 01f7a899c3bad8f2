//! Action types for state machine I/O requests.

/// Action requested by a state machine after processing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Read the next complete message from the server and step again.
    ReadMessage,

    /// The state machine has reached its end state.
    ///
    /// Any server error collected along the way is available through
    /// [`StateMachine::take_error`](super::StateMachine::take_error).
    Finished,
}
