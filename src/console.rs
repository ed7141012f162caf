//! Terminal front end for a debug session.

use std::io::Write;

use trellis_dap::protocol::OutputCategory;
use trellis_dap::{CurrentLineAnnotator, DebugThread, Frame, OutputSink};

/// Prints the current line whenever a thread suspends.
#[derive(Debug, Default)]
pub struct PrintingAnnotator;

impl CurrentLineAnnotator for PrintingAnnotator {
    fn show(&self, frame: &Frame) {
        println!("=> {}", describe_frame(frame));
    }

    fn clear(&self) {}
}

/// Writes debuggee output to stdout and stderr.
#[derive(Debug, Default)]
pub struct ConsoleOutput;

impl OutputSink for ConsoleOutput {
    fn write(&self, category: &OutputCategory, text: &str) {
        // Console writes are best effort; a closed pipe must not kill the session
        match category {
            OutputCategory::Stderr | OutputCategory::Important => {
                let _ = std::io::stderr().write_all(text.as_bytes());
            }
            _ => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
        }
    }
}

/// `name (location:line:column)`.
pub fn describe_frame(frame: &Frame) -> String {
    let location = frame
        .source_path
        .as_deref()
        .or(frame.url.as_deref())
        .unwrap_or("<unknown>");
    format!(
        "{} ({}:{}:{})",
        frame.name, location, frame.line, frame.column
    )
}

/// Multi-line rendering of a suspended thread's stack.
pub fn render_stack(thread: &DebugThread) -> String {
    let name = thread.name.as_deref().unwrap_or("<unnamed>");
    let mut out = format!("thread {} \"{}\" stopped\n", thread.id, name);
    for (depth, frame) in thread.frames.iter().enumerate() {
        out.push_str(&format!("  #{depth} {}\n", describe_frame(frame)));
    }
    out
}
