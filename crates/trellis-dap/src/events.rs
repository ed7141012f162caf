//! Typed adapter events and the notifications a session publishes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::DapError;
use crate::protocol::{
    AdapterBreakpoint, BreakpointEventBody, ContinuedEventBody, Event, ExitedEventBody,
    OutputCategory, OutputEventBody, Request, StartDebuggingRequestArguments, StopReason,
    StoppedEventBody, TerminatedEventBody, ThreadEventBody,
};
use crate::session::SessionState;

/// An adapter event with its body decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum DapEvent {
    /// The adapter is ready to accept configuration requests.
    Initialized,
    /// Execution stopped.
    Stopped(StoppedEventBody),
    /// Execution continued.
    Continued(ContinuedEventBody),
    /// A thread started or exited.
    Thread(ThreadEventBody),
    /// Debugging has ended.
    Terminated(TerminatedEventBody),
    /// The debuggee exited.
    Exited(ExitedEventBody),
    /// Output from the debuggee or the adapter.
    Output(OutputEventBody),
    /// The adapter changed a breakpoint on its own.
    Breakpoint(BreakpointEventBody),
    /// An event this client does not handle.
    Unknown {
        /// The event name.
        event: String,
        /// The raw body.
        body: Option<serde_json::Value>,
    },
}

fn body<T: serde::de::DeserializeOwned>(event: &Event) -> Result<T, DapError> {
    let value = event
        .body
        .clone()
        .ok_or_else(|| DapError::InvalidResponse(format!("{} event without body", event.event)))?;
    serde_json::from_value(value)
        .map_err(|e| DapError::InvalidResponse(format!("malformed {} event: {e}", event.event)))
}

impl TryFrom<Event> for DapEvent {
    type Error = DapError;

    fn try_from(event: Event) -> Result<Self, Self::Error> {
        Ok(match event.event.as_str() {
            "initialized" => DapEvent::Initialized,
            "stopped" => DapEvent::Stopped(body(&event)?),
            "continued" => DapEvent::Continued(body(&event)?),
            "thread" => DapEvent::Thread(body(&event)?),
            // `terminated` may come without a body.
            "terminated" => DapEvent::Terminated(match event.body {
                Some(_) => body(&event)?,
                None => TerminatedEventBody::default(),
            }),
            "exited" => DapEvent::Exited(body(&event)?),
            "output" => DapEvent::Output(body(&event)?),
            "breakpoint" => DapEvent::Breakpoint(body(&event)?),
            _ => DapEvent::Unknown {
                event: event.event,
                body: event.body,
            },
        })
    }
}

/// A request the adapter sent to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterRequest {
    /// Start a child session.
    StartDebugging(StartDebuggingRequestArguments),
    /// Anything else; answered with an error.
    Other(Request),
}

impl AdapterRequest {
    /// Classify a reverse request. A `startDebugging` request with
    /// unreadable arguments is treated as unsupported.
    pub fn classify(request: &Request) -> Self {
        if request.command == "startDebugging" {
            if let Some(arguments) = request.arguments.clone() {
                match serde_json::from_value(arguments) {
                    Ok(args) => return AdapterRequest::StartDebugging(args),
                    Err(e) => tracing::warn!("malformed startDebugging arguments: {e}"),
                }
            }
        }
        AdapterRequest::Other(request.clone())
    }
}

/// A change notification published by a session.
///
/// Notifications are signals to re-read state through the session's
/// queries or snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The lifecycle state changed.
    StateChanged(SessionState),
    /// The handshake completed; the debuggee is running.
    Initialized,
    /// A thread stopped. Its stack is not known yet.
    Suspended {
        /// The stopped thread.
        thread_id: i64,
        /// Why it stopped.
        reason: StopReason,
    },
    /// The stack of the suspended thread has been fetched.
    StackMaterialized {
        /// The suspended thread.
        thread_id: i64,
    },
    /// Fetching the stack of the suspended thread failed. The thread stays
    /// suspended with an empty stack.
    StackUnavailable {
        /// The suspended thread.
        thread_id: i64,
        /// Why the fetch failed.
        error: DapError,
    },
    /// Execution resumed.
    Resumed {
        /// The thread that was current, if any.
        thread_id: Option<i64>,
    },
    /// Threads were added, renamed or exited.
    ThreadsChanged,
    /// Output text from the debuggee or the adapter.
    Output {
        /// The output category.
        category: OutputCategory,
        /// The text.
        text: String,
    },
    /// The adapter answered a `setBreakpoints` request or changed a
    /// breakpoint on its own.
    BreakpointsVerified {
        /// The source path, when known.
        path: Option<String>,
        /// The adapter's view of the breakpoints.
        breakpoints: Vec<AdapterBreakpoint>,
    },
    /// The debuggee exited.
    Exited {
        /// The exit code.
        exit_code: i64,
    },
    /// A child session was started.
    ChildSession {
        /// Host the child connected to.
        host: String,
        /// Port the child connected to.
        port: u16,
    },
    /// The session terminated.
    Terminated,
}

/// Callback receiving session notifications.
pub type SessionListener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Session listeners. Callbacks run without the lock held.
#[derive(Default)]
pub struct Subscribers {
    inner: Mutex<(u64, Vec<(SubscriptionId, SessionListener)>)>,
}

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, (u64, Vec<(SubscriptionId, SessionListener)>)> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a listener.
    pub fn subscribe(&self, listener: SessionListener) -> SubscriptionId {
        let mut inner = self.lock();
        inner.0 += 1;
        let id = SubscriptionId(inner.0);
        inner.1.push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.1.len();
        inner.1.retain(|(sid, _)| *sid != id);
        inner.1.len() != before
    }

    /// Deliver `event` to every listener.
    pub fn notify(&self, event: &SessionEvent) {
        let listeners: Vec<SessionListener> =
            self.lock().1.iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.lock().1.len())
            .finish()
    }
}
