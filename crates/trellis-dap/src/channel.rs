//! Duplex channel to a debug adapter.
//!
//! Correlates outgoing requests with their responses by sequence number,
//! routes unsolicited events and reverse requests to an inbound queue, and
//! owns the reader/writer tasks that drive the framed stream.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, trace, warn};

use crate::error::DapError;
use crate::protocol::{Event, ProtocolMessage, Request, Response};
use crate::transport::{read_message, write_message};

/// Something the adapter sent without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A protocol event.
    Event(Event),
    /// A reverse request the client has to answer.
    Request(Request),
    /// The stream ended; carries the failure when it was not a clean close.
    Closed(Option<DapError>),
}

/// Pending requests awaiting a response, keyed by request sequence number.
#[derive(Debug, Default)]
struct Dispatcher {
    pending: HashMap<i64, oneshot::Sender<Response>>,
}

impl Dispatcher {
    fn register(&mut self, seq: i64) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        rx
    }

    fn dispatch(&mut self, response: Response) {
        match self.pending.remove(&response.request_seq) {
            // The waiter may have timed out already; that is fine.
            Some(sender) => {
                let _ = sender.send(response);
            }
            None => warn!(
                "received response for unknown request seq {} ({})",
                response.request_seq, response.command
            ),
        }
    }

    fn cancel(&mut self, seq: i64) -> bool {
        self.pending.remove(&seq).is_some()
    }

    fn cancel_all(&mut self) {
        self.pending.clear();
    }
}

fn lock(dispatcher: &Mutex<Dispatcher>) -> MutexGuard<'_, Dispatcher> {
    dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request that has been queued for the adapter.
///
/// Dropping it abandons interest in the answer; the response is discarded
/// when it arrives.
#[derive(Debug)]
pub struct PendingRequest {
    command: String,
    seq: i64,
    rx: oneshot::Receiver<Response>,
    timeout: Duration,
    dispatcher: Arc<Mutex<Dispatcher>>,
}

impl PendingRequest {
    /// Sequence number of the request.
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// The request's command.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the response body.
    ///
    /// Error responses become [`DapError::Rejected`]; a closed channel
    /// becomes [`DapError::ConnectionClosed`].
    pub async fn response(self) -> Result<Option<serde_json::Value>, DapError> {
        let PendingRequest {
            command,
            seq,
            rx,
            timeout,
            dispatcher,
        } = self;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                lock(&dispatcher).cancel(seq);
                Err(DapError::Timeout { command })
            }
            Ok(Err(_)) => Err(DapError::ConnectionClosed),
            Ok(Ok(response)) if response.success => Ok(response.body),
            Ok(Ok(response)) => Err(DapError::Rejected {
                command,
                message: response
                    .message
                    .unwrap_or_else(|| "request failed".to_string()),
            }),
        }
    }
}

/// An open channel to a debug adapter.
pub struct Connection {
    next_seq: AtomicI64,
    dispatcher: Arc<Mutex<Dispatcher>>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<ProtocolMessage>>>,
    reader: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
    request_timeout: Duration,
    _child: Option<Child>,
}

impl Connection {
    /// Start driving a framed stream.
    ///
    /// Returns the connection and the queue of inbound events and reverse
    /// requests. Must be called from within a tokio runtime.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        request_timeout: Duration,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_with_child(reader, writer, request_timeout, None)
    }

    fn spawn_with_child<R, W>(
        reader: R,
        writer: W,
        request_timeout: Duration,
        child: Option<Child>,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let dispatcher = Arc::new(Mutex::new(Dispatcher::default()));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<ProtocolMessage>();

        // Writer task: drains the queue until every sender is gone.
        let writer_dispatcher = dispatcher.clone();
        let writer_inbound = inbound_tx.clone();
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = writer_rx.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    error!("failed to write to adapter: {e}");
                    lock(&writer_dispatcher).cancel_all();
                    let _ = writer_inbound.send(Inbound::Closed(Some(e)));
                    return;
                }
            }
            trace!("adapter writer finished");
        });

        // Reader task: routes responses to waiters, everything else inbound.
        let reader_inbound = inbound_tx.clone();
        let reader_dispatcher = dispatcher.clone();
        let supervisor_dispatcher = dispatcher.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(ProtocolMessage::Response(response))) => {
                        debug!(
                            "<- response {} seq={} success={}",
                            response.command, response.request_seq, response.success
                        );
                        lock(&reader_dispatcher).dispatch(response);
                    }
                    Ok(Some(ProtocolMessage::Event(event))) => {
                        debug!("<- event {}", event.event);
                        let _ = reader_inbound.send(Inbound::Event(event));
                    }
                    Ok(Some(ProtocolMessage::Request(request))) => {
                        debug!("<- reverse request {}", request.command);
                        let _ = reader_inbound.send(Inbound::Request(request));
                    }
                    Ok(None) => return None,
                    Err(DapError::InvalidResponse(msg)) => {
                        warn!("skipping unreadable adapter message: {msg}");
                    }
                    Err(e) => {
                        error!("adapter stream failed: {e}");
                        return Some(e);
                    }
                }
            }
        });
        let reader_abort = reader_task.abort_handle();

        // Supervisor: reports the end of the stream however the reader ended.
        // An aborted reader means the connection was closed locally.
        tokio::spawn(async move {
            let failure = match reader_task.await {
                Ok(failure) => failure,
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    error!("adapter reader crashed: {e}");
                    Some(DapError::Transport(format!("reader crashed: {e}")))
                }
            };
            lock(&supervisor_dispatcher).cancel_all();
            let _ = inbound_tx.send(Inbound::Closed(failure));
        });

        let connection = Arc::new(Connection {
            next_seq: AtomicI64::new(1),
            dispatcher,
            writer_tx: Mutex::new(Some(writer_tx)),
            reader: Mutex::new(Some(reader_abort)),
            closed: AtomicBool::new(false),
            request_timeout,
            _child: child,
        });
        (connection, inbound_rx)
    }

    /// Spawn an adapter process and talk to it over its stdio.
    ///
    /// The adapter's stderr is forwarded to the log.
    pub fn spawn_process(
        command: &str,
        args: &[String],
        request_timeout: Duration,
    ) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<Inbound>), DapError> {
        let mut child = TokioCommand::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DapError::AdapterSpawnFailed(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DapError::AdapterSpawnFailed("could not capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DapError::AdapterSpawnFailed("could not capture stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let name = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{name} stderr] {line}");
                }
            });
        }

        Ok(Self::spawn_with_child(
            stdout,
            stdin,
            request_timeout,
            Some(child),
        ))
    }

    /// Connect to an adapter listening on a TCP port.
    pub async fn connect_tcp(
        host: &str,
        port: u16,
        request_timeout: Duration,
    ) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<Inbound>), DapError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| DapError::AdapterSpawnFailed(format!("{host}:{port}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::spawn(read_half, write_half, request_timeout))
    }

    fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, message: ProtocolMessage) -> Result<(), DapError> {
        let writer = self
            .writer_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match writer.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| DapError::ConnectionClosed),
            None => Err(DapError::ConnectionClosed),
        }
    }

    /// Queue a request. Requests reach the adapter in the order they are
    /// queued; the response is awaited through the returned handle.
    pub fn send(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<PendingRequest, DapError> {
        if self.is_closed() {
            return Err(DapError::ConnectionClosed);
        }
        let seq = self.next_seq();
        let rx = lock(&self.dispatcher).register(seq);
        debug!("-> request {command} seq={seq}");

        let request = Request {
            seq,
            command: command.to_string(),
            arguments,
        };
        if let Err(e) = self.enqueue(ProtocolMessage::Request(request)) {
            lock(&self.dispatcher).cancel(seq);
            return Err(e);
        }

        Ok(PendingRequest {
            command: command.to_string(),
            seq,
            rx,
            timeout: self.request_timeout,
            dispatcher: self.dispatcher.clone(),
        })
    }

    /// Queue a request whose arguments are a serializable struct.
    pub fn send_with<T: Serialize>(
        &self,
        command: &str,
        arguments: &T,
    ) -> Result<PendingRequest, DapError> {
        let arguments = serde_json::to_value(arguments)
            .map_err(|e| DapError::Transport(format!("cannot encode {command}: {e}")))?;
        self.send(command, Some(arguments))
    }

    /// Queue a request and wait for its response body.
    pub async fn request(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, DapError> {
        self.send(command, arguments)?.response().await
    }

    /// Answer a reverse request.
    pub fn respond(
        &self,
        request: &Request,
        result: Result<Option<serde_json::Value>, String>,
    ) -> Result<(), DapError> {
        let (success, message, body) = match result {
            Ok(body) => (true, None, body),
            Err(message) => (false, Some(message), None),
        };
        let response = Response {
            seq: self.next_seq(),
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        };
        self.enqueue(ProtocolMessage::Response(response))
    }

    /// Close the channel.
    ///
    /// Already-queued messages are still flushed; the reader stops
    /// immediately and every pending request fails. Returns `true` only for
    /// the call that actually closed the channel.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.writer_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
        lock(&self.dispatcher).cancel_all();
        debug!("adapter connection closed");
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// How many requests are waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.dispatcher).pending.len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}
