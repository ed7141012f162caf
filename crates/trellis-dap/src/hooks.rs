//! Collaborator interfaces a session calls out to.

use std::fmt;
use std::sync::Arc;

use crate::breakpoint::{BreakpointConvertor, LineBreakpointConvertor};
use crate::model::Frame;
use crate::paths::{FileUrlMapper, PathMapper};
use crate::protocol::OutputCategory;

/// Marks the line a suspended thread is at.
pub trait CurrentLineAnnotator: Send + Sync {
    /// Show the marker at `frame`.
    fn show(&self, frame: &Frame);
    /// Remove the marker.
    fn clear(&self);
}

/// Receives debuggee and adapter output.
pub trait OutputSink: Send + Sync {
    /// Write `text` of the given category.
    fn write(&self, category: &OutputCategory, text: &str);
}

/// Annotator that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAnnotator;

impl CurrentLineAnnotator for NoAnnotator {
    fn show(&self, _frame: &Frame) {}
    fn clear(&self) {}
}

/// Sink that forwards output to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOutput;

impl OutputSink for TracingOutput {
    fn write(&self, category: &OutputCategory, text: &str) {
        tracing::info!(category = %String::from(category.clone()), "{}", text.trim_end());
    }
}

/// Everything a session needs from its surroundings.
#[derive(Clone)]
pub struct Collaborators {
    /// IDE URL ↔ adapter path mapping.
    pub path_mapper: Arc<dyn PathMapper>,
    /// Breakpoint convertors, applied in order.
    pub convertors: Vec<Arc<dyn BreakpointConvertor>>,
    /// Current-line marker.
    pub annotator: Arc<dyn CurrentLineAnnotator>,
    /// Output destination.
    pub output: Arc<dyn OutputSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            path_mapper: Arc::new(FileUrlMapper),
            convertors: vec![Arc::new(LineBreakpointConvertor)],
            annotator: Arc::new(NoAnnotator),
            output: Arc::new(TracingOutput),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("convertors", &self.convertors.len())
            .finish_non_exhaustive()
    }
}
