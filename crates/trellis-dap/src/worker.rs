//! The session worker.
//!
//! Every adapter event, local command and request continuation of a session
//! is handled here, one at a time, in queue order. The worker queues
//! requests on the connection but never waits for a response itself:
//! responses are awaited in spawned tasks that post a continuation back onto
//! the queue.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::breakpoint::{BreakpointChange, BreakpointManager, ListenerId};
use crate::capabilities::DapCapabilities;
use crate::channel::{Connection, Inbound, PendingRequest};
use crate::client::{DebugSession, LaunchRequest, RequestKind, SessionOptions};
use crate::error::DapError;
use crate::events::{AdapterRequest, DapEvent, SessionEvent, Subscribers};
use crate::hooks::{Collaborators, OutputSink};
use crate::model::{Frame, SessionSnapshot, ThreadModel, Variable};
use crate::protocol::{
    self, AdapterBreakpoint, ContinueArguments, DisconnectArguments, EvaluateArguments,
    EvaluateResponseBody, InitializeRequestArguments, NextArguments, OutputCategory,
    OutputEventBody, PauseArguments, Request, ScopesArguments, ScopesResponseBody,
    SetBreakpointsArguments, SetBreakpointsResponseBody, StackTraceArguments,
    StackTraceResponseBody, StartDebuggingRequestArguments, StepInArguments, StepOutArguments,
    StoppedEventBody, Thread, ThreadReason, ThreadsResponseBody, VariablesArguments,
    VariablesResponseBody,
};
use crate::session::{Lifecycle, SessionState};
use crate::signal::Signal;
use crate::sync::{affected_paths, convert_all, plan, plan_all};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, DapError>>;

/// How a suspended thread is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepKind {
    Continue,
    StepOver,
    StepInto,
    StepOut,
}

/// A request from a [`DebugSession`] handle.
pub(crate) enum Command {
    Connect {
        request: LaunchRequest,
        reply: Reply<()>,
    },
    Resume {
        kind: StepKind,
        reply: Reply<()>,
    },
    Pause {
        reply: Reply<()>,
    },
    Evaluate {
        frame_id: Option<i64>,
        expression: String,
        reply: Reply<Arc<Variable>>,
    },
    Scopes {
        frame_id: i64,
        reply: Reply<Vec<Arc<Variable>>>,
    },
    Variables {
        reference: i64,
        reply: Reply<Vec<protocol::Variable>>,
    },
    SelectFrame {
        frame_id: i64,
        reply: Reply<Arc<Frame>>,
    },
    Finish {
        reply: oneshot::Sender<()>,
    },
}

/// Everything the worker queue carries.
pub(crate) enum WorkItem {
    Command(Command),
    Inbound(Inbound),
    BreakpointsChanged(BreakpointChange),
    InitializeDone(Result<Option<Value>, DapError>),
    LaunchDone(Result<(), DapError>),
    ConfigurationPushed(Vec<(String, Result<Vec<AdapterBreakpoint>, DapError>)>),
    ConfigurationDone(Result<(), DapError>),
    ThreadsListed(Result<Vec<Thread>, DapError>),
    StackTrace {
        thread_id: i64,
        generation: u64,
        result: Result<StackTraceResponseBody, DapError>,
    },
    BreakpointsSet {
        path: String,
        result: Result<Vec<AdapterBreakpoint>, DapError>,
    },
    ChildStarted {
        session: DebugSession,
        host: String,
        port: u16,
    },
    InitializeTimeout,
    DisconnectDone,
}

/// Shared pieces a worker publishes through.
pub(crate) struct Outlets {
    pub(crate) snapshot: watch::Sender<Arc<SessionSnapshot>>,
    pub(crate) subscribers: Arc<Subscribers>,
    pub(crate) initialized: Signal,
    pub(crate) terminated: Signal,
}

pub(crate) struct Worker {
    connection: Arc<Connection>,
    queue: mpsc::WeakUnboundedSender<WorkItem>,
    lifecycle: Lifecycle,
    model: ThreadModel,
    capabilities: DapCapabilities,
    capabilities_known: bool,
    early_initialized: bool,
    launch: Option<LaunchRequest>,
    pending_launch: Option<LaunchRequest>,
    launch_result: Option<Result<(), DapError>>,
    connect_reply: Option<Reply<()>>,
    finish_replies: Vec<oneshot::Sender<()>>,
    finishing: bool,
    init_timer: Option<JoinHandle<()>>,
    breakpoints: Arc<BreakpointManager>,
    listener: Option<ListenerId>,
    collaborators: Collaborators,
    output: Option<Arc<dyn OutputSink>>,
    options: SessionOptions,
    outlets: Outlets,
    last_state: SessionState,
    children: Vec<DebugSession>,
}

impl Worker {
    pub(crate) fn new(
        connection: Arc<Connection>,
        queue: mpsc::WeakUnboundedSender<WorkItem>,
        breakpoints: Arc<BreakpointManager>,
        listener: ListenerId,
        collaborators: Collaborators,
        options: SessionOptions,
        outlets: Outlets,
    ) -> Self {
        let output = Some(collaborators.output.clone());
        Self {
            connection,
            queue,
            lifecycle: Lifecycle::new(),
            model: ThreadModel::new(),
            capabilities: DapCapabilities::default(),
            capabilities_known: false,
            early_initialized: false,
            launch: None,
            pending_launch: None,
            launch_result: None,
            connect_reply: None,
            finish_replies: Vec::new(),
            finishing: false,
            init_timer: None,
            breakpoints,
            listener: Some(listener),
            collaborators,
            output,
            options,
            outlets,
            last_state: SessionState::Connecting,
            children: Vec::new(),
        }
    }

    /// Drain the queue until every handle is gone.
    pub(crate) async fn run(mut self, mut queue: mpsc::UnboundedReceiver<WorkItem>) {
        while let Some(item) = queue.recv().await {
            self.handle(item);
        }
        self.terminate(DapError::Terminated);
        debug!("session worker stopped");
    }

    fn handle(&mut self, item: WorkItem) {
        match item {
            WorkItem::Command(command) => self.on_command(command),
            WorkItem::Inbound(inbound) => self.on_inbound(inbound),
            WorkItem::BreakpointsChanged(change) => self.on_breakpoints_changed(change),
            WorkItem::InitializeDone(result) => self.on_initialize_done(result),
            WorkItem::LaunchDone(result) => self.on_launch_done(result),
            WorkItem::ConfigurationPushed(results) => self.on_configuration_pushed(results),
            WorkItem::ConfigurationDone(result) => self.on_configuration_done(result),
            WorkItem::ThreadsListed(result) => self.on_threads_listed(result),
            WorkItem::StackTrace {
                thread_id,
                generation,
                result,
            } => self.on_stack_trace(thread_id, generation, result),
            WorkItem::BreakpointsSet { path, result } => self.on_breakpoints_set(path, result),
            WorkItem::ChildStarted {
                session,
                host,
                port,
            } => self.on_child_started(session, host, port),
            WorkItem::InitializeTimeout => {
                if !self.outlets.initialized.is_resolved() {
                    warn!("adapter did not finish initialization in time");
                    self.terminate(DapError::Timeout {
                        command: "initialize".into(),
                    });
                }
            }
            WorkItem::DisconnectDone => self.terminate(DapError::Terminated),
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn spawn_continuation<F>(&self, continuation: F)
    where
        F: Future<Output = WorkItem> + Send + 'static,
    {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let item = continuation.await;
            if let Some(queue) = queue.upgrade() {
                let _ = queue.send(item);
            }
        });
    }

    /// Await a response nobody waits for; failures are only logged.
    fn fire_and_forget(command: &'static str, pending: PendingRequest) {
        tokio::spawn(async move {
            if let Err(e) = pending.response().await {
                warn!("{command} failed: {e}");
            }
        });
    }

    fn publish(&mut self) {
        let snapshot =
            SessionSnapshot::capture(self.lifecycle.state(), &self.model, &self.capabilities);
        self.outlets.snapshot.send_replace(Arc::new(snapshot));
        let state = self.lifecycle.state();
        if state != self.last_state {
            self.last_state = state;
            info!("session state: {state}");
            self.outlets
                .subscribers
                .notify(&SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.outlets.subscribers.notify(&event);
    }

    fn require_started(&self) -> Result<(), DapError> {
        match self.lifecycle.state() {
            SessionState::Terminated => Err(DapError::Terminated),
            SessionState::Connecting => Err(DapError::NotInitialized),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { request, reply } => self.connect(request, reply),
            Command::Resume { kind, reply } => {
                let _ = reply.send(self.resume(kind));
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            Command::Evaluate {
                frame_id,
                expression,
                reply,
            } => {
                let args = EvaluateArguments {
                    expression: expression.clone(),
                    frame_id,
                    context: Some("repl".into()),
                };
                match self.start_request("evaluate", &args) {
                    Ok(pending) => {
                        tokio::spawn(async move {
                            let _ = reply.send(evaluation(pending, &expression).await);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Scopes { frame_id, reply } => {
                match self.start_request("scopes", &ScopesArguments { frame_id }) {
                    Ok(pending) => {
                        tokio::spawn(async move {
                            let _ = reply.send(scopes(pending).await);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Variables { reference, reply } => {
                let args = VariablesArguments {
                    variables_reference: reference,
                    start: None,
                    count: None,
                };
                match self.start_request("variables", &args) {
                    Ok(pending) => {
                        tokio::spawn(async move {
                            let _ = reply.send(variables(pending).await);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::SelectFrame { frame_id, reply } => {
                let _ = reply.send(self.select_frame(frame_id));
            }
            Command::Finish { reply } => self.finish(reply),
        }
    }

    fn start_request<T: serde::Serialize>(
        &self,
        command: &str,
        args: &T,
    ) -> Result<PendingRequest, DapError> {
        self.require_started()?;
        self.connection.send_with(command, args)
    }

    fn connect(&mut self, request: LaunchRequest, reply: Reply<()>) {
        if let Err(e) = self.lifecycle.begin_initialize() {
            let _ = reply.send(Err(e));
            return;
        }
        self.connect_reply = Some(reply);
        self.publish();

        let args = InitializeRequestArguments {
            client_id: Some(self.options.client_id.clone()),
            client_name: Some(self.options.client_name.clone()),
            adapter_id: self.options.adapter_id.clone(),
            locale: self.options.locale.clone(),
            lines_start_at1: Some(true),
            columns_start_at1: Some(true),
            path_format: Some("path".into()),
            supports_variable_type: Some(true),
            supports_variable_paging: Some(false),
            supports_run_in_terminal_request: Some(false),
            supports_start_debugging_request: Some(true),
        };
        let pending = match self.connection.send_with("initialize", &args) {
            Ok(pending) => pending,
            Err(e) => {
                self.terminate(e);
                return;
            }
        };
        info!("initializing adapter {}", self.options.adapter_id);
        self.spawn_continuation(async move { WorkItem::InitializeDone(pending.response().await) });

        if self.options.delay_launch {
            self.pending_launch = Some(request);
        } else {
            self.launch = Some(request);
        }

        let timeout = self.options.initialize_timeout;
        let queue = self.queue.clone();
        self.init_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(queue) = queue.upgrade() {
                let _ = queue.send(WorkItem::InitializeTimeout);
            }
        }));
    }

    fn resume(&mut self, kind: StepKind) -> Result<(), DapError> {
        self.lifecycle.require_suspended()?;
        let Some(thread_id) = self.model.resume_local() else {
            return Err(DapError::NotSuspended);
        };
        self.lifecycle.resume()?;
        self.collaborators.annotator.clear();
        self.publish();
        self.emit(SessionEvent::Resumed {
            thread_id: Some(thread_id),
        });

        let (command, pending) = match kind {
            StepKind::Continue => (
                "continue",
                self.connection.send_with(
                    "continue",
                    &ContinueArguments {
                        thread_id,
                        single_thread: None,
                    },
                ),
            ),
            StepKind::StepOver => (
                "next",
                self.connection.send_with(
                    "next",
                    &NextArguments {
                        thread_id,
                        granularity: None,
                    },
                ),
            ),
            StepKind::StepInto => (
                "stepIn",
                self.connection.send_with(
                    "stepIn",
                    &StepInArguments {
                        thread_id,
                        target_id: None,
                        granularity: None,
                    },
                ),
            ),
            StepKind::StepOut => (
                "stepOut",
                self.connection.send_with(
                    "stepOut",
                    &StepOutArguments {
                        thread_id,
                        granularity: None,
                    },
                ),
            ),
        };
        Self::fire_and_forget(command, pending?);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DapError> {
        self.require_started()?;
        for thread_id in self.model.live_threads() {
            let pending = self
                .connection
                .send_with("pause", &PauseArguments { thread_id })?;
            Self::fire_and_forget("pause", pending);
        }
        Ok(())
    }

    fn select_frame(&mut self, frame_id: i64) -> Result<Arc<Frame>, DapError> {
        self.lifecycle.require_suspended()?;
        let frame = self
            .model
            .select_frame(frame_id)
            .ok_or_else(|| DapError::InvalidState {
                operation: format!("select frame {frame_id}"),
                state: "not on the current stack".into(),
            })?;
        self.collaborators.annotator.show(&frame);
        self.publish();
        Ok(frame)
    }

    fn finish(&mut self, reply: oneshot::Sender<()>) {
        if self.lifecycle.is_terminated() {
            let _ = reply.send(());
            return;
        }
        self.finish_replies.push(reply);
        if self.finishing {
            return;
        }
        self.finishing = true;

        if self.lifecycle.state() == SessionState::Connecting {
            self.terminate(DapError::Terminated);
            return;
        }
        let args = DisconnectArguments {
            restart: None,
            terminate_debuggee: Some(self.options.terminate_debuggee),
            suspend_debuggee: None,
        };
        match self.connection.send_with("disconnect", &args) {
            Ok(pending) => {
                let timeout = self.options.disconnect_timeout;
                self.spawn_continuation(async move {
                    match tokio::time::timeout(timeout, pending.response()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => debug!("disconnect: {e}"),
                        Err(_) => warn!("adapter did not answer disconnect"),
                    }
                    WorkItem::DisconnectDone
                });
            }
            Err(_) => self.terminate(DapError::Terminated),
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    fn on_initialize_done(&mut self, result: Result<Option<Value>, DapError>) {
        if self.lifecycle.is_terminated() {
            return;
        }
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                error!("initialize failed: {e}");
                self.terminate(e);
                return;
            }
        };
        self.capabilities = DapCapabilities::from_response_body(body);
        self.capabilities_known = true;
        debug!("adapter capabilities: {:?}", self.capabilities);
        self.publish();

        if let Some(request) = self.launch.take() {
            self.send_launch(request);
        }
        if self.early_initialized {
            self.early_initialized = false;
            self.begin_configuration();
        }
    }

    fn send_launch(&mut self, request: LaunchRequest) {
        let command = request.kind.command();
        info!("sending {command}");
        match self.connection.send(command, Some(request.arguments)) {
            Ok(pending) => self.spawn_continuation(async move {
                WorkItem::LaunchDone(pending.response().await.map(|_| ()))
            }),
            Err(e) => self.terminate(e),
        }
    }

    fn on_launch_done(&mut self, result: Result<(), DapError>) {
        if self.lifecycle.is_terminated() {
            return;
        }
        match result {
            Ok(()) => {
                self.launch_result = Some(Ok(()));
                self.complete_connect();
            }
            Err(e) => {
                error!("launch failed: {e}");
                self.terminate(e);
            }
        }
    }

    fn complete_connect(&mut self) {
        let initialized = self.outlets.initialized.outcome();
        if let (Some(Ok(())), Some(Ok(()))) = (initialized, self.launch_result.as_ref()) {
            if let Some(reply) = self.connect_reply.take() {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn begin_configuration(&mut self) {
        if let Err(e) = self.lifecycle.begin_configuration() {
            warn!("ignoring initialized event: {e}");
            return;
        }
        self.publish();

        let map = convert_all(
            &self.breakpoints.all(),
            &self.collaborators.convertors,
            self.collaborators.path_mapper.as_ref(),
        );
        let mut pending = Vec::new();
        for args in plan_all(&map) {
            let path = args.source.path.clone().unwrap_or_default();
            match self.connection.send_with("setBreakpoints", &args) {
                Ok(request) => pending.push((path, request)),
                Err(e) => warn!("cannot send breakpoints for {path}: {e}"),
            }
        }
        debug!("pushing breakpoints for {} sources", pending.len());
        self.spawn_continuation(async move {
            let mut results = Vec::with_capacity(pending.len());
            for (path, request) in pending {
                results.push((path, breakpoint_result(request).await));
            }
            WorkItem::ConfigurationPushed(results)
        });
    }

    fn on_configuration_pushed(
        &mut self,
        results: Vec<(String, Result<Vec<AdapterBreakpoint>, DapError>)>,
    ) {
        for (path, result) in results {
            self.on_breakpoints_set(path, result);
        }
        if self.lifecycle.is_terminated() {
            return;
        }
        if !self.capabilities.supports_configuration_done_request {
            self.on_configuration_done(Ok(()));
            return;
        }
        match self.connection.send("configurationDone", None) {
            Ok(pending) => self.spawn_continuation(async move {
                WorkItem::ConfigurationDone(pending.response().await.map(|_| ()))
            }),
            Err(e) => self.terminate(e),
        }
    }

    fn on_configuration_done(&mut self, result: Result<(), DapError>) {
        if self.lifecycle.is_terminated() {
            return;
        }
        if let Err(e) = result {
            warn!("configurationDone failed: {e}");
        }
        if let Err(e) = self.lifecycle.configuration_done() {
            warn!("{e}");
            return;
        }
        if let Some(timer) = self.init_timer.take() {
            timer.abort();
        }
        self.publish();

        if let Some(request) = self.pending_launch.take() {
            self.send_launch(request);
        }
        self.outlets.initialized.resolve(Ok(()));
        info!("session initialized");
        self.emit(SessionEvent::Initialized);
        self.request_threads();
        self.complete_connect();
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Event(event) => {
                if self.lifecycle.is_terminated() {
                    trace!("event {} after termination", event.event);
                    return;
                }
                match DapEvent::try_from(event) {
                    Ok(event) => self.on_event(event),
                    Err(e) => warn!("{e}"),
                }
            }
            Inbound::Request(request) => self.on_adapter_request(request),
            Inbound::Closed(failure) => {
                if !self.lifecycle.is_terminated() {
                    info!("adapter connection closed");
                }
                self.terminate(failure.unwrap_or(DapError::ConnectionClosed));
            }
        }
    }

    fn on_event(&mut self, event: DapEvent) {
        match event {
            DapEvent::Initialized => {
                if self.capabilities_known {
                    self.begin_configuration();
                } else {
                    debug!("initialized before initialize response; deferring");
                    self.early_initialized = true;
                }
            }
            DapEvent::Stopped(body) => self.on_stopped(body),
            DapEvent::Continued(body) => {
                let resumed = self
                    .model
                    .on_continued(body.thread_id, body.all_threads_continued.unwrap_or(false));
                if resumed {
                    self.on_resumed_remotely(Some(body.thread_id));
                } else {
                    self.publish();
                    self.emit(SessionEvent::ThreadsChanged);
                }
            }
            DapEvent::Thread(body) => {
                match body.reason {
                    ThreadReason::Started => {
                        self.model.on_thread_started(body.thread_id);
                        self.request_threads();
                    }
                    ThreadReason::Exited => {
                        if self.model.on_thread_exited(body.thread_id) {
                            self.on_resumed_remotely(None);
                        }
                    }
                    ThreadReason::Other(reason) => {
                        debug!("thread {} event: {reason}", body.thread_id);
                        self.model.thread_mut(body.thread_id);
                    }
                }
                self.publish();
                self.emit(SessionEvent::ThreadsChanged);
            }
            DapEvent::Terminated(_) => {
                info!("adapter terminated the session");
                self.terminate(DapError::Terminated);
            }
            DapEvent::Exited(body) => {
                info!("debuggee exited with code {}", body.exit_code);
                self.emit(SessionEvent::Exited {
                    exit_code: body.exit_code,
                });
            }
            DapEvent::Output(body) => self.on_output(body),
            DapEvent::Breakpoint(body) => {
                let path = body.breakpoint.source.as_ref().and_then(|s| s.path.clone());
                self.emit(SessionEvent::BreakpointsVerified {
                    path,
                    breakpoints: vec![body.breakpoint],
                });
            }
            DapEvent::Unknown { event, .. } => debug!("ignoring event {event}"),
        }
    }

    fn on_stopped(&mut self, body: StoppedEventBody) {
        let Some(thread_id) = body.thread_id.or(self.model.current_thread()) else {
            warn!("stopped event without thread and no current thread; ignoring");
            return;
        };
        if let Err(e) = self.lifecycle.suspend() {
            warn!("ignoring stopped event: {e}");
            return;
        }
        let generation = self.model.on_stopped(thread_id);
        info!("thread {thread_id} stopped: {}", String::from(body.reason.clone()));
        self.publish();
        self.emit(SessionEvent::Suspended {
            thread_id,
            reason: body.reason,
        });

        let args = StackTraceArguments {
            thread_id,
            start_frame: None,
            levels: None,
        };
        match self.connection.send_with("stackTrace", &args) {
            Ok(pending) => self.spawn_continuation(async move {
                WorkItem::StackTrace {
                    thread_id,
                    generation,
                    result: decoded(pending).await,
                }
            }),
            Err(e) => warn!("cannot request stack of thread {thread_id}: {e}"),
        }
        if self.model.thread(thread_id).is_some_and(|t| t.name.is_none()) {
            self.request_threads();
        }
    }

    fn on_resumed_remotely(&mut self, thread_id: Option<i64>) {
        if let Err(e) = self.lifecycle.resume() {
            warn!("{e}");
        }
        self.collaborators.annotator.clear();
        self.publish();
        self.emit(SessionEvent::Resumed { thread_id });
    }

    fn on_output(&mut self, body: OutputEventBody) {
        let category = body.category.unwrap_or(OutputCategory::Console);
        if category == OutputCategory::Telemetry {
            trace!("telemetry: {}", body.output);
            return;
        }
        if let Some(output) = &self.output {
            output.write(&category, &body.output);
        }
        self.emit(SessionEvent::Output {
            category,
            text: body.output,
        });
    }

    fn request_threads(&self) {
        match self.connection.send("threads", None) {
            Ok(pending) => self.spawn_continuation(async move {
                let result = decoded::<ThreadsResponseBody>(pending)
                    .await
                    .map(|body| body.threads);
                WorkItem::ThreadsListed(result)
            }),
            Err(e) => debug!("cannot list threads: {e}"),
        }
    }

    fn on_threads_listed(&mut self, result: Result<Vec<Thread>, DapError>) {
        if self.lifecycle.is_terminated() {
            return;
        }
        match result {
            Ok(threads) => {
                if self.model.update_names(threads) {
                    self.publish();
                    self.emit(SessionEvent::ThreadsChanged);
                }
            }
            Err(e) => warn!("threads failed: {e}"),
        }
    }

    fn on_stack_trace(
        &mut self,
        thread_id: i64,
        generation: u64,
        result: Result<StackTraceResponseBody, DapError>,
    ) {
        if self.lifecycle.is_terminated() {
            return;
        }
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                warn!("stackTrace for thread {thread_id} failed: {e}");
                if self.model.is_current_stop(thread_id, generation) {
                    self.emit(SessionEvent::StackUnavailable { thread_id, error: e });
                }
                return;
            }
        };
        let paths = self.collaborators.path_mapper.as_ref();
        let frames: Vec<Frame> = body
            .stack_frames
            .into_iter()
            .map(|frame| Frame::from_stack_frame(thread_id, frame, paths))
            .collect();
        if !self.model.set_frames(thread_id, generation, frames) {
            debug!("discarding stale stack of thread {thread_id}");
            return;
        }
        if let Some(frame) = self.model.current_frame() {
            self.collaborators.annotator.show(&frame);
        }
        self.publish();
        self.emit(SessionEvent::StackMaterialized { thread_id });
    }

    // -----------------------------------------------------------------------
    // Breakpoints
    // -----------------------------------------------------------------------

    fn on_breakpoints_changed(&mut self, change: BreakpointChange) {
        if !matches!(
            self.lifecycle.state(),
            SessionState::Configuring | SessionState::Running | SessionState::Suspended
        ) {
            trace!("breakpoint change before configuration");
            return;
        }
        let paths = self.collaborators.path_mapper.as_ref();
        let sources = affected_paths(&change, &self.collaborators.convertors, paths);
        if sources.is_empty() {
            return;
        }
        let map = convert_all(&self.breakpoints.all(), &self.collaborators.convertors, paths);
        for args in plan(sources, &map) {
            self.send_breakpoints(args);
        }
    }

    fn send_breakpoints(&self, args: SetBreakpointsArguments) {
        let path = args.source.path.clone().unwrap_or_default();
        match self.connection.send_with("setBreakpoints", &args) {
            Ok(pending) => self.spawn_continuation(async move {
                WorkItem::BreakpointsSet {
                    result: breakpoint_result(pending).await,
                    path,
                }
            }),
            Err(e) => warn!("cannot send breakpoints for {path}: {e}"),
        }
    }

    fn on_breakpoints_set(&mut self, path: String, result: Result<Vec<AdapterBreakpoint>, DapError>) {
        match result {
            Ok(breakpoints) => {
                let verified = breakpoints.iter().filter(|bp| bp.verified).count();
                debug!("{path}: {verified}/{} breakpoints verified", breakpoints.len());
                self.emit(SessionEvent::BreakpointsVerified {
                    path: Some(path),
                    breakpoints,
                });
            }
            Err(e) => warn!("setBreakpoints for {path} failed: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Reverse requests and child sessions
    // -----------------------------------------------------------------------

    fn on_adapter_request(&mut self, request: Request) {
        if self.lifecycle.is_terminated() {
            return;
        }
        match AdapterRequest::classify(&request) {
            AdapterRequest::StartDebugging(args) => self.start_child(&request, args),
            AdapterRequest::Other(other) => {
                debug!("rejecting reverse request {}", other.command);
                if let Err(e) = self.connection.respond(&other, Err("unsupported".into())) {
                    warn!("cannot answer {}: {e}", other.command);
                }
            }
        }
    }

    fn start_child(&mut self, request: &Request, args: StartDebuggingRequestArguments) {
        let host = args
            .configuration
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or("127.0.0.1")
            .to_string();
        let port = args
            .configuration
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok());
        let Some(port) = port else {
            warn!("startDebugging without a usable port");
            let _ = self
                .connection
                .respond(request, Err("configuration has no port".into()));
            return;
        };
        if let Err(e) = self.connection.respond(request, Ok(None)) {
            warn!("cannot answer startDebugging: {e}");
            return;
        }

        let kind = match args.request.as_str() {
            "launch" => RequestKind::Launch,
            _ => RequestKind::Attach,
        };
        let launch = LaunchRequest {
            kind,
            arguments: args.configuration,
        };
        let breakpoints = self.breakpoints.clone();
        let collaborators = self.collaborators.clone();
        let options = self.options.clone();
        let queue = self.queue.clone();
        info!("starting child session at {host}:{port}");
        tokio::spawn(async move {
            let (connection, inbound) =
                match Connection::connect_tcp(&host, port, options.request_timeout).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!("child session at {host}:{port} failed: {e}");
                        return;
                    }
                };
            let child = DebugSession::start(connection, inbound, breakpoints, collaborators, options);
            let posted = queue.upgrade().is_some_and(|queue| {
                queue
                    .send(WorkItem::ChildStarted {
                        session: child.clone(),
                        host: host.clone(),
                        port,
                    })
                    .is_ok()
            });
            if !posted {
                child.finish().await;
                return;
            }
            if let Err(e) = child.connect(launch).await {
                warn!("child session at {host}:{port} failed: {e}");
            }
        });
    }

    fn on_child_started(&mut self, session: DebugSession, host: String, port: u16) {
        if self.lifecycle.is_terminated() {
            tokio::spawn(async move { session.finish().await });
            return;
        }
        self.children.push(session);
        self.emit(SessionEvent::ChildSession { host, port });
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Enter Terminated and release everything. Only the first call acts.
    fn terminate(&mut self, cause: DapError) {
        if !self.lifecycle.terminate() {
            return;
        }
        info!("session terminated: {cause}");

        match self.listener.take() {
            Some(id) => {
                if !self.breakpoints.remove_listener(id) {
                    warn!("breakpoint listener was already removed");
                }
            }
            None => warn!("breakpoint listener missing at termination"),
        }
        self.connection.close();
        self.output = None;
        self.collaborators.annotator.clear();
        if let Some(timer) = self.init_timer.take() {
            timer.abort();
        }
        for child in self.children.drain(..) {
            tokio::spawn(async move { child.finish().await });
        }

        self.outlets.initialized.resolve(Err(cause.clone()));
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(cause));
        }
        self.launch = None;
        self.pending_launch = None;

        self.publish();
        self.emit(SessionEvent::Terminated);
        self.outlets.terminated.resolve(Ok(()));
        for reply in self.finish_replies.drain(..) {
            let _ = reply.send(());
        }
    }
}

fn decode<T: DeserializeOwned>(command: &str, body: Option<Value>) -> Result<T, DapError> {
    let body = body.ok_or_else(|| DapError::InvalidResponse(format!("{command}: missing body")))?;
    serde_json::from_value(body)
        .map_err(|e| DapError::InvalidResponse(format!("{command}: {e}")))
}

async fn decoded<T: DeserializeOwned>(pending: PendingRequest) -> Result<T, DapError> {
    let command = pending.command().to_string();
    let body = pending.response().await?;
    decode(&command, body)
}

async fn breakpoint_result(pending: PendingRequest) -> Result<Vec<AdapterBreakpoint>, DapError> {
    let body: SetBreakpointsResponseBody = decoded(pending).await?;
    Ok(body.breakpoints)
}

async fn evaluation(pending: PendingRequest, expression: &str) -> Result<Arc<Variable>, DapError> {
    let body: EvaluateResponseBody = decoded(pending).await?;
    Ok(Variable::from_evaluation(expression, body))
}

async fn scopes(pending: PendingRequest) -> Result<Vec<Arc<Variable>>, DapError> {
    let body: ScopesResponseBody = decoded(pending).await?;
    Ok(body.scopes.into_iter().map(Variable::from_scope).collect())
}

async fn variables(pending: PendingRequest) -> Result<Vec<protocol::Variable>, DapError> {
    let body: VariablesResponseBody = decoded(pending).await?;
    Ok(body.variables)
}
