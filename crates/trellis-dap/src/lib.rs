//! trellis-dap: Debug Adapter Protocol client sessions.
//!
//! This crate drives one debug adapter per [`DebugSession`]: the
//! initialize/configure handshake, breakpoint synchronization, execution
//! control and the suspended-thread model. Adapter events, local commands
//! and request continuations are serialized on a single worker task per
//! session; callers observe the result through published snapshots and
//! [`SessionEvent`] notifications.

pub mod breakpoint;
pub mod capabilities;
pub mod channel;
pub mod client;
pub mod error;
pub mod events;
pub mod hooks;
pub mod model;
pub mod paths;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod sync;
pub mod transport;
mod worker;

// Re-export key types for convenience.
pub use breakpoint::{
    Breakpoint, BreakpointChange, BreakpointConvertor, BreakpointId, BreakpointManager,
    LineBreakpointConvertor,
};
pub use capabilities::DapCapabilities;
pub use channel::{Connection, Inbound};
pub use client::{DebugSession, LaunchRequest, RequestKind, SessionOptions};
pub use error::DapError;
pub use events::{SessionEvent, SubscriptionId};
pub use hooks::{Collaborators, CurrentLineAnnotator, NoAnnotator, OutputSink, TracingOutput};
pub use model::{DebugThread, Frame, SessionSnapshot, ThreadStatus, Variable};
pub use paths::{FileUrlMapper, PathMapper};
pub use session::SessionState;
