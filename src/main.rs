mod console;

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trellis_config::{load_config, load_file, BreakpointEntry, Config, LogConfig, RequestSetting};
use trellis_dap::{
    Breakpoint, BreakpointManager, Collaborators, Connection, DebugSession, FileUrlMapper,
    LaunchRequest, PathMapper, SessionEvent, SessionOptions,
};

use crate::console::{render_stack, ConsoleOutput, PrintingAnnotator};

/// Variables shown per scope when a thread stops.
const SHOWN_VARIABLES: usize = 20;

/// Directory holding the global `debug.toml`.
fn config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("TRELLIS_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("trellis"));
    }
    let home = env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".config").join("trellis"))
}

fn init_logging(log: &LogConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level.as_str()));
    match &log.file {
        // Keep the log out of the debuggee's console output when a file is set
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn session_options(config: &Config) -> SessionOptions {
    let session = &config.session;
    SessionOptions {
        client_id: session.client_id.clone(),
        client_name: session.client_name.clone(),
        adapter_id: config.adapter.adapter_id.clone(),
        locale: session.locale.clone(),
        request_timeout: Duration::from_secs(session.request_timeout_secs),
        initialize_timeout: Duration::from_secs(session.initialize_timeout_secs),
        disconnect_timeout: Duration::from_secs(session.disconnect_timeout_secs),
        delay_launch: session.delay_launch,
        terminate_debuggee: session.terminate_debuggee,
    }
}

/// Turn a configured entry into a breakpoint, resolving relative paths
/// against `project_dir`.
fn breakpoint_from_entry(entry: &BreakpointEntry, project_dir: &Path) -> Result<Breakpoint> {
    let url = match (&entry.url, &entry.path) {
        (Some(url), _) => url.clone(),
        (None, Some(path)) => {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                project_dir.join(path)
            };
            FileUrlMapper
                .to_url(&absolute.to_string_lossy())
                .with_context(|| format!("cannot express {} as a URL", absolute.display()))?
        }
        (None, None) => bail!("breakpoint at line {} has no location", entry.line),
    };

    let mut bp = Breakpoint::new(url, entry.line);
    if let Some(condition) = &entry.condition {
        bp = bp.with_condition(condition.clone());
    }
    if let Some(hit_condition) = &entry.hit_condition {
        bp = bp.with_hit_condition(hit_condition.clone());
    }
    if let Some(message) = &entry.log_message {
        bp = bp.with_log_message(message.clone());
    }
    if !entry.enabled {
        bp = bp.disabled();
    }
    Ok(bp)
}

async fn open_connection(
    config: &Config,
    options: &SessionOptions,
) -> Result<(
    Arc<Connection>,
    mpsc::UnboundedReceiver<trellis_dap::Inbound>,
)> {
    let adapter = &config.adapter;
    match (&adapter.command, adapter.port) {
        (Some(command), _) => {
            info!("Spawning adapter: {} {:?}", command, adapter.args);
            Connection::spawn_process(command, &adapter.args, options.request_timeout)
                .with_context(|| format!("failed to start adapter {command}"))
        }
        (None, Some(port)) => {
            info!("Connecting to adapter at {}:{}", adapter.host, port);
            Connection::connect_tcp(&adapter.host, port, options.request_timeout)
                .await
                .with_context(|| format!("failed to reach adapter at {}:{port}", adapter.host))
        }
        (None, None) => bail!("no adapter command or port configured"),
    }
}

/// Print the stopped thread's stack and the variables of its top frame.
async fn report_stop(session: &DebugSession, thread_id: i64) -> Result<()> {
    let snapshot = session.snapshot();
    let Some(thread) = snapshot.thread(thread_id) else {
        return Ok(());
    };
    print!("{}", render_stack(thread));

    let Some(frame) = thread.current_frame.clone() else {
        return Ok(());
    };
    for scope in session.frame_variables(&frame).await? {
        println!("  [{}]", scope.name());
        for variable in session
            .variable_children(&scope, 0, SHOWN_VARIABLES)
            .await?
        {
            println!("    {} = {}", variable.name(), variable.value());
        }
    }
    Ok(())
}

async fn resume(session: &DebugSession) {
    if let Err(e) = session.resume().await {
        warn!("resume failed: {}", e);
    }
}

async fn run(config_arg: Option<PathBuf>, project_dir: PathBuf) -> Result<()> {
    let config = match config_arg {
        Some(path) => load_file(&path, Some(&project_dir))
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let dir = config_dir()?;
            load_config(&dir, Some(&project_dir))
                .with_context(|| format!("failed to load config from {}", dir.display()))?
        }
    };
    init_logging(&config.log)?;

    let breakpoints = Arc::new(BreakpointManager::new());
    for entry in &config.breakpoints {
        breakpoints.add(breakpoint_from_entry(entry, &project_dir)?);
    }

    let options = session_options(&config);
    let (connection, inbound) = open_connection(&config, &options).await?;
    let collaborators = Collaborators {
        annotator: Arc::new(PrintingAnnotator),
        output: Arc::new(ConsoleOutput),
        ..Collaborators::default()
    };
    let session = DebugSession::start(connection, inbound, breakpoints, collaborators, options);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    session.subscribe(move |event| {
        let _ = event_tx.send(event.clone());
    });

    let arguments = config
        .launch
        .arguments_json()
        .context("invalid launch arguments")?;
    let request = match config.launch.request {
        RequestSetting::Launch => LaunchRequest::launch(arguments),
        RequestSetting::Attach => LaunchRequest::attach(arguments),
    };
    session.connect(request).await.context("handshake failed")?;
    info!("Debuggee running");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(SessionEvent::StackMaterialized { thread_id }) => {
                    if let Err(e) = report_stop(&session, thread_id).await {
                        warn!("could not inspect thread {}: {:#}", thread_id, e);
                    }
                    resume(&session).await;
                }
                Some(SessionEvent::StackUnavailable { thread_id, error }) => {
                    println!("thread {thread_id} stopped; stack unavailable: {error}");
                    resume(&session).await;
                }
                Some(SessionEvent::Exited { exit_code }) => {
                    println!("debuggee exited with code {exit_code}");
                }
                Some(SessionEvent::Terminated) | None => break,
                Some(_) => {}
            },
            _ = &mut ctrl_c => {
                info!("Interrupted, disconnecting");
                session.finish().await;
                break;
            }
        }
    }

    session.wait_terminated().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let config_arg = args.next().map(PathBuf::from);
    let project_dir = match args.next() {
        Some(dir) => PathBuf::from(dir),
        None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    if let Err(e) = run(config_arg, project_dir).await {
        eprintln!("trellis: {:#}", e);
        std::process::exit(1);
    }
}
