//! Scripted in-memory debug adapter for driving real sessions.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{duplex, split, AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use trellis_dap::protocol::{Event, ProtocolMessage, Request, Response};
use trellis_dap::transport::{read_message, write_message};
use trellis_dap::{
    BreakpointManager, Collaborators, Connection, CurrentLineAnnotator, DebugSession, Frame,
    LaunchRequest, OutputSink, SessionEvent, SessionOptions, SessionSnapshot,
};

pub const STEP: Duration = Duration::from_secs(5);

/// The adapter side of a session.
///
/// `threads` requests are answered automatically with [`FakeAdapter::threads`]
/// so tests only see the requests they care about.
pub struct FakeAdapter {
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    seq: i64,
    pub threads: Value,
}

impl FakeAdapter {
    fn new(
        reader: Box<dyn AsyncBufRead + Unpin + Send>,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
    ) -> Self {
        Self {
            reader,
            writer,
            seq: 1000,
            threads: json!([{"id": 1, "name": "main"}]),
        }
    }

    pub fn over_tcp(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::new(Box::new(BufReader::new(read_half)), Box::new(write_half))
    }

    async fn next_message(&mut self) -> Option<ProtocolMessage> {
        tokio::time::timeout(STEP, read_message(&mut self.reader))
            .await
            .expect("client went quiet")
            .expect("malformed client message")
    }

    /// The next request other than `threads`.
    pub async fn next_request(&mut self) -> Request {
        loop {
            match self.next_message().await {
                Some(ProtocolMessage::Request(request)) if request.command == "threads" => {
                    let body = json!({"threads": self.threads});
                    self.respond(&request, Some(body)).await;
                }
                Some(ProtocolMessage::Request(request)) => return request,
                other => panic!("expected a request, got {other:?}"),
            }
        }
    }

    /// The next request, which must be `command`.
    pub async fn expect(&mut self, command: &str) -> Request {
        let request = self.next_request().await;
        assert_eq!(request.command, command, "unexpected request {request:?}");
        request
    }

    /// The client's answer to a reverse request.
    pub async fn next_response(&mut self) -> Response {
        loop {
            match self.next_message().await {
                Some(ProtocolMessage::Request(request)) if request.command == "threads" => {
                    let body = json!({"threads": self.threads});
                    self.respond(&request, Some(body)).await;
                }
                Some(ProtocolMessage::Response(response)) => return response,
                other => panic!("expected a response, got {other:?}"),
            }
        }
    }

    /// Asserts that nothing but `threads` arrives within `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let message =
                match tokio::time::timeout_at(deadline, read_message(&mut self.reader)).await {
                    Err(_) => return,
                    Ok(message) => message.expect("malformed client message"),
                };
            match message {
                Some(ProtocolMessage::Request(request)) if request.command == "threads" => {
                    let body = json!({"threads": self.threads});
                    self.respond(&request, Some(body)).await;
                }
                None => return,
                other => panic!("expected silence, got {other:?}"),
            }
        }
    }

    async fn write(&mut self, message: ProtocolMessage) {
        write_message(&mut self.writer, &message)
            .await
            .expect("client hung up");
    }

    /// Write bytes that bypass message framing.
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("client hung up");
        self.writer.flush().await.expect("client hung up");
    }

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    pub async fn respond(&mut self, request: &Request, body: Option<Value>) {
        let seq = self.next_seq();
        self.write(ProtocolMessage::Response(Response {
            seq,
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        }))
        .await;
    }

    pub async fn respond_error(&mut self, request: &Request, message: &str) {
        let seq = self.next_seq();
        self.write(ProtocolMessage::Response(Response {
            seq,
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(message.into()),
            body: None,
        }))
        .await;
    }

    pub async fn event(&mut self, event: &str, body: Option<Value>) {
        let seq = self.next_seq();
        self.write(ProtocolMessage::Event(Event {
            seq,
            event: event.into(),
            body,
        }))
        .await;
    }

    /// Send a reverse request; returns its sequence number.
    pub async fn reverse_request(&mut self, command: &str, arguments: Option<Value>) -> i64 {
        let seq = self.next_seq();
        self.write(ProtocolMessage::Request(Request {
            seq,
            command: command.into(),
            arguments,
        }))
        .await;
        seq
    }

    /// Answer the whole handshake. Returns the `setBreakpoints` requests
    /// pushed during configuration.
    pub async fn handshake(&mut self, capabilities: Value, kind: &str) -> Vec<Request> {
        let initialize = self.expect("initialize").await;
        self.respond(&initialize, Some(capabilities)).await;
        let launch = self.expect(kind).await;
        self.respond(&launch, None).await;
        self.event("initialized", None).await;
        self.configure().await
    }

    /// Serve configuration until `configurationDone`.
    pub async fn configure(&mut self) -> Vec<Request> {
        let mut pushed = Vec::new();
        loop {
            let request = self.next_request().await;
            match request.command.as_str() {
                "setBreakpoints" => {
                    self.verify(&request).await;
                    pushed.push(request);
                }
                "configurationDone" => {
                    self.respond(&request, None).await;
                    return pushed;
                }
                other => panic!("unexpected {other} during configuration"),
            }
        }
    }

    /// Answer a `setBreakpoints` request, verifying every breakpoint.
    pub async fn verify(&mut self, request: &Request) {
        let arguments = request.arguments.clone().unwrap_or_default();
        let verified: Vec<Value> = arguments["breakpoints"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|bp| json!({"verified": true, "line": bp["line"]}))
            .collect();
        self.respond(request, Some(json!({"breakpoints": verified})))
            .await;
    }

    /// Stop `thread_id` and answer the resulting `stackTrace` with `frames`.
    pub async fn stop(&mut self, thread_id: i64, frames: Value) {
        self.event(
            "stopped",
            Some(json!({"reason": "breakpoint", "threadId": thread_id})),
        )
        .await;
        let request = self.expect("stackTrace").await;
        assert_eq!(arguments(&request)["threadId"], thread_id);
        self.respond(&request, Some(json!({"stackFrames": frames})))
            .await;
    }
}

pub fn arguments(request: &Request) -> Value {
    request.arguments.clone().unwrap_or_default()
}

pub fn capabilities() -> Value {
    json!({"supportsConfigurationDoneRequest": true, "supportTerminateDebuggee": true})
}

/// Two frames of a stack, topmost first.
pub fn two_frames() -> Value {
    json!([
        {"id": 100, "name": "inner", "line": 10, "column": 1, "source": {"path": "/src/a.js"}},
        {"id": 101, "name": "outer", "line": 20, "column": 5, "source": {"path": "/src/a.js"}}
    ])
}

/// A session wired to a fake adapter, not yet connected.
pub fn session_with(
    options: SessionOptions,
    breakpoints: Arc<BreakpointManager>,
    collaborators: Collaborators,
) -> (DebugSession, FakeAdapter) {
    let (ours, theirs) = duplex(256 * 1024);
    let (reader, writer) = split(ours);
    let (connection, inbound) = Connection::spawn(reader, writer, options.request_timeout);
    let session = DebugSession::start(connection, inbound, breakpoints, collaborators, options);
    let (adapter_read, adapter_write) = split(theirs);
    let adapter = FakeAdapter::new(
        Box::new(BufReader::new(adapter_read)),
        Box::new(adapter_write),
    );
    (session, adapter)
}

pub fn session() -> (DebugSession, FakeAdapter) {
    session_with(
        SessionOptions::default(),
        Arc::new(BreakpointManager::new()),
        Collaborators::default(),
    )
}

/// Run `connect` against the scripted handshake.
pub async fn connect(session: &DebugSession, adapter: &mut FakeAdapter) -> Vec<Request> {
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .connect(LaunchRequest::launch(json!({"program": "app.js"})))
                .await
        })
    };
    let pushed = adapter.handshake(capabilities(), "launch").await;
    tokio::time::timeout(STEP, connecting)
        .await
        .expect("connect hung")
        .expect("connect task panicked")
        .expect("connect failed");
    pushed
}

/// The first snapshot satisfying `predicate`.
pub async fn wait_for(
    session: &DebugSession,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) -> Arc<SessionSnapshot> {
    let mut watch = session.watch();
    let snapshot = tokio::time::timeout(STEP, watch.wait_for(|s| predicate(s)))
        .await
        .expect("state never reached")
        .expect("session dropped");
    snapshot.clone()
}

/// Records session events.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Recorder {
    pub fn attach(session: &DebugSession) -> Self {
        let recorder = Self::default();
        let sink = recorder.events.clone();
        session.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        recorder
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, predicate: impl Fn(&SessionEvent) -> bool) {
        tokio::time::timeout(STEP, async {
            while !self.events().iter().any(&predicate) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event never arrived");
    }
}

/// Annotator that records what it was asked to show.
#[derive(Default)]
pub struct RecordingAnnotator {
    pub calls: Mutex<Vec<Option<i64>>>,
}

impl CurrentLineAnnotator for RecordingAnnotator {
    fn show(&self, frame: &Frame) {
        self.calls.lock().unwrap().push(Some(frame.id));
    }

    fn clear(&self) {
        self.calls.lock().unwrap().push(None);
    }
}

/// Output sink that keeps everything written to it.
#[derive(Default)]
pub struct RecordingOutput {
    pub lines: Mutex<Vec<(String, String)>>,
}

impl OutputSink for RecordingOutput {
    fn write(&self, category: &trellis_dap::protocol::OutputCategory, text: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((String::from(category.clone()), text.to_string()));
    }
}
