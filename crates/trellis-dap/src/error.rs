//! DAP error types.

use thiserror::Error;

/// Errors from DAP session operations.
///
/// Cloneable so that a single failure can be handed to every caller
/// waiting on a session completion signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DapError {
    /// Adapter process failed to start or could not be reached.
    #[error("adapter failed to start: {0}")]
    AdapterSpawnFailed(String),

    /// Transport-level communication error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The channel to the adapter was closed while a request was pending.
    #[error("connection to adapter closed")]
    ConnectionClosed,

    /// Request timed out waiting for a response.
    #[error("request timed out: {command}")]
    Timeout {
        /// The command that timed out.
        command: String,
    },

    /// Adapter answered the request with an error response.
    #[error("adapter rejected {command}: {message}")]
    Rejected {
        /// The rejected command.
        command: String,
        /// The rejection message from the adapter.
        message: String,
    },

    /// Adapter sent an invalid or unparseable message.
    #[error("adapter sent invalid response: {0}")]
    InvalidResponse(String),

    /// Session has not finished its initialization handshake.
    #[error("session not initialized")]
    NotInitialized,

    /// The operation needs a suspended thread and there is none.
    #[error("session is not suspended")]
    NotSuspended,

    /// Session has already been terminated.
    #[error("session already terminated")]
    Terminated,

    /// The lifecycle does not allow the operation in its current state.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        /// The attempted operation.
        operation: String,
        /// The state the session was in.
        state: String,
    },
}

impl From<std::io::Error> for DapError {
    fn from(err: std::io::Error) -> Self {
        DapError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DapError {
    fn from(err: serde_json::Error) -> Self {
        DapError::InvalidResponse(err.to_string())
    }
}
