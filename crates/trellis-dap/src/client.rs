//! The debug session handle.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::breakpoint::{BreakpointChange, BreakpointManager};
use crate::capabilities::DapCapabilities;
use crate::channel::{Connection, Inbound};
use crate::error::DapError;
use crate::events::{SessionEvent, SessionListener, Subscribers, SubscriptionId};
use crate::hooks::Collaborators;
use crate::model::{DebugThread, Frame, SessionSnapshot, Variable};
use crate::session::SessionState;
use crate::signal::Signal;
use crate::worker::{Command, Outlets, Reply, StepKind, WorkItem, Worker};

/// Whether the debuggee is started by the adapter or already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Start the debuggee.
    Launch,
    /// Attach to a running debuggee.
    Attach,
}

impl RequestKind {
    /// The DAP command name.
    pub fn command(self) -> &'static str {
        match self {
            RequestKind::Launch => "launch",
            RequestKind::Attach => "attach",
        }
    }
}

/// The `launch` or `attach` request sent during the handshake. The
/// arguments are adapter-specific and passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub kind: RequestKind,
    pub arguments: Value,
}

impl LaunchRequest {
    pub fn launch(arguments: Value) -> Self {
        Self {
            kind: RequestKind::Launch,
            arguments,
        }
    }

    pub fn attach(arguments: Value) -> Self {
        Self {
            kind: RequestKind::Attach,
            arguments,
        }
    }
}

/// Tunables of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// `clientID` sent in `initialize`.
    pub client_id: String,
    /// `clientName` sent in `initialize`.
    pub client_name: String,
    /// `adapterID` sent in `initialize`.
    pub adapter_id: String,
    pub locale: Option<String>,
    /// How long a single request may wait for its response.
    pub request_timeout: Duration,
    /// How long the whole handshake may take.
    pub initialize_timeout: Duration,
    /// How long `finish` waits for the `disconnect` response.
    pub disconnect_timeout: Duration,
    /// Send `launch`/`attach` only after `configurationDone`.
    pub delay_launch: bool,
    /// Ask the adapter to kill the debuggee on disconnect.
    pub terminate_debuggee: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_id: "trellis".into(),
            client_name: "Trellis".into(),
            adapter_id: String::new(),
            locale: None,
            request_timeout: Duration::from_secs(10),
            initialize_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
            delay_launch: false,
            terminate_debuggee: true,
        }
    }
}

/// A debug session bound to one adapter connection.
///
/// The handle is cheap to clone. All state changes happen on the session's
/// own worker task; queries read the latest published snapshot and never
/// block on the adapter. Once the session terminates every operation fails
/// with [`DapError::Terminated`].
#[derive(Debug, Clone)]
pub struct DebugSession {
    queue: mpsc::UnboundedSender<WorkItem>,
    snapshot: watch::Receiver<Arc<SessionSnapshot>>,
    subscribers: Arc<Subscribers>,
    initialized: Signal,
    terminated: Signal,
}

impl DebugSession {
    /// Start a session on an open connection. The session stays in
    /// [`SessionState::Connecting`] until [`connect`](Self::connect).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        connection: Arc<Connection>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        breakpoints: Arc<BreakpointManager>,
        collaborators: Collaborators,
        options: SessionOptions,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(SessionSnapshot::initial()));
        let subscribers = Arc::new(Subscribers::default());
        let initialized = Signal::new();
        let terminated = Signal::new();

        let weak = queue_tx.downgrade();
        let listener = breakpoints.add_listener(Arc::new(move |change: &BreakpointChange| {
            if let Some(queue) = weak.upgrade() {
                let _ = queue.send(WorkItem::BreakpointsChanged(change.clone()));
            }
        }));

        let weak = queue_tx.downgrade();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(queue) = weak.upgrade() else { break };
                if queue.send(WorkItem::Inbound(message)).is_err() {
                    break;
                }
            }
        });

        let worker = Worker::new(
            connection,
            queue_tx.downgrade(),
            breakpoints,
            listener,
            collaborators,
            options,
            Outlets {
                snapshot: snapshot_tx,
                subscribers: subscribers.clone(),
                initialized: initialized.clone(),
                terminated: terminated.clone(),
            },
        );
        tokio::spawn(worker.run(queue_rx));

        Self {
            queue: queue_tx,
            snapshot: snapshot_rx,
            subscribers,
            initialized,
            terminated,
        }
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, DapError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(WorkItem::Command(command(tx)))
            .map_err(|_| DapError::Terminated)?;
        rx.await.map_err(|_| DapError::Terminated)?
    }

    /// Run the handshake: `initialize`, then `launch`/`attach`, breakpoint
    /// configuration and `configurationDone`.
    ///
    /// Completes once the adapter accepted `request` and configuration is
    /// done. Any failure terminates the session.
    pub async fn connect(&self, request: LaunchRequest) -> Result<(), DapError> {
        self.call(|reply| Command::Connect { request, reply }).await
    }

    /// Continue the current thread.
    pub async fn resume(&self) -> Result<(), DapError> {
        self.step(StepKind::Continue).await
    }

    pub async fn step_into(&self) -> Result<(), DapError> {
        self.step(StepKind::StepInto).await
    }

    pub async fn step_over(&self) -> Result<(), DapError> {
        self.step(StepKind::StepOver).await
    }

    pub async fn step_out(&self) -> Result<(), DapError> {
        self.step(StepKind::StepOut).await
    }

    // The local model is resumed before the request is even written; the
    // adapter's answer is not awaited.
    async fn step(&self, kind: StepKind) -> Result<(), DapError> {
        self.call(|reply| Command::Resume { kind, reply }).await
    }

    /// Ask every live thread to pause.
    pub async fn pause(&self) -> Result<(), DapError> {
        self.call(|reply| Command::Pause { reply }).await
    }

    /// Evaluate `expression` in the REPL context of `frame`, or globally.
    pub async fn evaluate(
        &self,
        frame: Option<&Frame>,
        expression: &str,
    ) -> Result<Arc<Variable>, DapError> {
        let frame_id = frame.map(|frame| frame.id);
        let expression = expression.to_string();
        self.call(|reply| Command::Evaluate {
            frame_id,
            expression,
            reply,
        })
        .await
    }

    /// The scopes of `frame`, as expandable variables.
    pub async fn frame_variables(&self, frame: &Frame) -> Result<Vec<Arc<Variable>>, DapError> {
        let frame_id = frame.id;
        self.call(|reply| Command::Scopes { frame_id, reply }).await
    }

    /// Children `from..to` of `variable`, fetched from the adapter on first
    /// use and cached afterwards.
    pub async fn variable_children(
        &self,
        variable: &Arc<Variable>,
        from: usize,
        to: usize,
    ) -> Result<Vec<Arc<Variable>>, DapError> {
        variable
            .children_with(from, to, |reference| {
                self.call(move |reply| Command::Variables { reference, reply })
            })
            .await
    }

    /// Make `frame` the current frame of the suspended thread.
    pub async fn select_frame(&self, frame: &Frame) -> Result<Arc<Frame>, DapError> {
        let frame_id = frame.id;
        self.call(|reply| Command::SelectFrame { frame_id, reply })
            .await
    }

    /// Disconnect and terminate. Safe to call repeatedly; returns once the
    /// session has terminated.
    pub async fn finish(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .queue
            .send(WorkItem::Command(Command::Finish { reply: tx }))
            .is_ok()
        {
            let _ = rx.await;
        }
        let _ = self.terminated.wait().await;
    }

    // -- queries ------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn is_suspended(&self) -> bool {
        self.snapshot.borrow().is_suspended()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    pub fn current_thread(&self) -> Option<i64> {
        self.snapshot.borrow().current_thread
    }

    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.snapshot.borrow().current_frame()
    }

    pub fn threads(&self) -> Vec<DebugThread> {
        self.snapshot.borrow().threads.clone()
    }

    pub fn capabilities(&self) -> DapCapabilities {
        self.snapshot.borrow().capabilities.clone()
    }

    /// The latest published state.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// A receiver notified on every published snapshot.
    pub fn watch(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.snapshot.clone()
    }

    // -- notifications ------------------------------------------------------

    /// Register a listener for [`SessionEvent`]s. Listeners run on the
    /// session worker and must not block.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let listener: SessionListener = Arc::new(listener);
        self.subscribers.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Resolves once the handshake finished, or with the error that ended
    /// the session first.
    pub async fn wait_initialized(&self) -> Result<(), DapError> {
        self.initialized.wait().await
    }

    /// Resolves once the session has terminated.
    pub async fn wait_terminated(&self) {
        let _ = self.terminated.wait().await;
    }
}
