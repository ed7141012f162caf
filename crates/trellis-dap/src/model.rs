//! Thread, frame and variable model of the debuggee.
//!
//! Owned and mutated by the session worker only. Readers see it through
//! [`SessionSnapshot`]s.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use tokio::sync::OnceCell;

use crate::capabilities::DapCapabilities;
use crate::error::DapError;
use crate::paths::PathMapper;
use crate::protocol::{self, EvaluateResponseBody, Scope, StackFrame, Thread};
use crate::session::SessionState;

/// Execution status of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Known but not yet observed running or stopped.
    Created,
    /// Running.
    Running,
    /// Stopped; its stack may be inspected.
    Suspended,
    /// Gone. Exited threads stay in the model.
    Exited,
}

/// A stack frame. Its id is only meaningful until the thread resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Adapter frame id.
    pub id: i64,
    /// Owning thread.
    pub thread_id: i64,
    /// Display name (usually the function).
    pub name: String,
    /// Source path as the adapter reports it.
    pub source_path: Option<String>,
    /// IDE URL for the source, when mappable.
    pub url: Option<String>,
    /// Reference for sources without a path.
    pub source_reference: Option<i64>,
    /// Line (1-based).
    pub line: i64,
    /// Column (1-based).
    pub column: i64,
}

impl Frame {
    /// Build a frame from a `stackTrace` entry.
    pub fn from_stack_frame(thread_id: i64, frame: StackFrame, paths: &dyn PathMapper) -> Self {
        let source = frame.source.unwrap_or_default();
        let url = source.path.as_deref().and_then(|path| paths.to_url(path));
        Self {
            id: frame.id,
            thread_id,
            name: frame.name,
            source_path: source.path,
            url,
            source_reference: source.source_reference.filter(|r| *r > 0),
            line: frame.line,
            column: frame.column,
        }
    }
}

/// A debuggee thread.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugThread {
    /// Adapter thread id.
    pub id: i64,
    /// Display name; may arrive after the thread is first seen.
    pub name: Option<String>,
    /// Execution status.
    pub status: ThreadStatus,
    /// Call stack, topmost first. Empty unless suspended and fetched.
    pub frames: Vec<Arc<Frame>>,
    /// The selected frame of the stack.
    pub current_frame: Option<Arc<Frame>>,
}

impl DebugThread {
    fn new(id: i64) -> Self {
        Self {
            id,
            name: None,
            status: ThreadStatus::Created,
            frames: Vec::new(),
            current_frame: None,
        }
    }

    fn drop_stack(&mut self) {
        self.frames.clear();
        self.current_frame = None;
    }
}

/// A node of a variable tree.
///
/// Children are fetched at most once per instance and then served from the
/// cache. Instances go stale when the debuggee resumes.
#[derive(Debug)]
pub struct Variable {
    reference: i64,
    name: String,
    type_name: Option<String>,
    value: String,
    parent: Weak<Variable>,
    children: OnceCell<Vec<Arc<Variable>>>,
}

impl Variable {
    /// Create a root variable.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        type_name: Option<String>,
        reference: i64,
    ) -> Self {
        Self {
            reference,
            name: name.into(),
            type_name,
            value: value.into(),
            parent: Weak::new(),
            children: OnceCell::new(),
        }
    }

    /// Wrap a scope as a root variable.
    pub fn from_scope(scope: Scope) -> Arc<Self> {
        Arc::new(Self::new(scope.name, "", None, scope.variables_reference))
    }

    /// Wrap an evaluation result; the expression becomes the name.
    pub fn from_evaluation(expression: &str, result: EvaluateResponseBody) -> Arc<Self> {
        Arc::new(Self::new(
            expression,
            result.result,
            result.result_type,
            result.variables_reference,
        ))
    }

    fn child_of(parent: &Arc<Variable>, var: protocol::Variable) -> Arc<Self> {
        Arc::new(Self {
            reference: var.variables_reference,
            name: var.name,
            type_name: var.variable_type,
            value: var.value,
            parent: Arc::downgrade(parent),
            children: OnceCell::new(),
        })
    }

    /// Adapter reference; 0 means no children.
    pub fn reference(&self) -> i64 {
        self.reference
    }

    /// Variable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type, when the adapter reports one.
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// Display value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The containing variable, if it is still alive.
    pub fn parent(&self) -> Option<Arc<Variable>> {
        self.parent.upgrade()
    }

    /// Whether the variable can have children.
    pub fn has_children(&self) -> bool {
        self.reference > 0
    }

    /// Cached children, if they have been fetched.
    pub fn cached_children(&self) -> Option<&[Arc<Variable>]> {
        self.children.get().map(Vec::as_slice)
    }

    /// Children in `from..to`, fetching them with `fetch` on first use.
    ///
    /// The range is clamped to the number of children. A failed fetch
    /// leaves the cache empty.
    pub async fn children_with<F, Fut>(
        self: &Arc<Self>,
        from: usize,
        to: usize,
        fetch: F,
    ) -> Result<Vec<Arc<Variable>>, DapError>
    where
        F: FnOnce(i64) -> Fut,
        Fut: Future<Output = Result<Vec<protocol::Variable>, DapError>>,
    {
        if !self.has_children() {
            return Ok(Vec::new());
        }
        let all = self
            .children
            .get_or_try_init(|| async move {
                let raw = fetch(self.reference).await?;
                let children: Vec<Arc<Variable>> = raw
                    .into_iter()
                    .map(|v| Variable::child_of(self, v))
                    .collect();
                Ok::<_, DapError>(children)
            })
            .await?;
        Ok(clamped_slice(all, from, to))
    }
}

/// `items[from..to]` with both bounds clamped to the slice.
pub fn clamped_slice<T: Clone>(items: &[T], from: usize, to: usize) -> Vec<T> {
    let to = to.min(items.len());
    let from = from.min(to);
    items[from..to].to_vec()
}

/// All threads of the session plus which one is current.
#[derive(Debug, Default)]
pub struct ThreadModel {
    threads: BTreeMap<i64, DebugThread>,
    current_thread: Option<i64>,
    generation: u64,
}

impl ThreadModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// The thread with `id`, created on first reference.
    pub fn thread_mut(&mut self, id: i64) -> &mut DebugThread {
        self.threads.entry(id).or_insert_with(|| DebugThread::new(id))
    }

    /// Look up a thread.
    pub fn thread(&self, id: i64) -> Option<&DebugThread> {
        self.threads.get(&id)
    }

    /// The current thread id.
    pub fn current_thread(&self) -> Option<i64> {
        self.current_thread
    }

    /// Bumped on every stop and every resume.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the current thread is suspended.
    pub fn is_suspended(&self) -> bool {
        self.current_thread
            .and_then(|id| self.threads.get(&id))
            .is_some_and(|t| t.status == ThreadStatus::Suspended)
    }

    /// Selected frame of the current thread.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.current_thread
            .and_then(|id| self.threads.get(&id))
            .and_then(|t| t.current_frame.clone())
    }

    /// Ids of threads that have not exited.
    pub fn live_threads(&self) -> Vec<i64> {
        self.threads
            .values()
            .filter(|t| t.status != ThreadStatus::Exited)
            .map(|t| t.id)
            .collect()
    }

    /// A thread stopped. The previously current thread is released before
    /// `thread_id` is suspended and made current. Returns the new
    /// generation.
    pub fn on_stopped(&mut self, thread_id: i64) -> u64 {
        if let Some(previous) = self.current_thread.take() {
            if let Some(thread) = self.threads.get_mut(&previous) {
                thread.drop_stack();
                if thread.status == ThreadStatus::Suspended {
                    thread.status = ThreadStatus::Running;
                }
            }
        }
        let thread = self.thread_mut(thread_id);
        thread.drop_stack();
        thread.status = ThreadStatus::Suspended;
        self.current_thread = Some(thread_id);
        self.generation += 1;
        self.generation
    }

    /// Resume the current thread locally: its stack is dropped before the
    /// adapter hears about it. Returns the thread, if one was suspended.
    pub fn resume_local(&mut self) -> Option<i64> {
        let id = self.current_thread?;
        let thread = self.threads.get_mut(&id)?;
        if thread.status != ThreadStatus::Suspended {
            return None;
        }
        thread.drop_stack();
        thread.status = ThreadStatus::Running;
        self.generation += 1;
        Some(id)
    }

    /// A `continued` event. Returns whether the suspended current thread
    /// resumed.
    pub fn on_continued(&mut self, thread_id: i64, all_threads: bool) -> bool {
        let was_suspended = self.is_suspended();
        let covers_current = all_threads || self.current_thread == Some(thread_id);
        self.thread_mut(thread_id);
        for thread in self.threads.values_mut() {
            let affected = all_threads || thread.id == thread_id;
            if affected && thread.status != ThreadStatus::Exited {
                thread.status = ThreadStatus::Running;
                thread.drop_stack();
            }
        }
        if covers_current && was_suspended {
            self.generation += 1;
            return true;
        }
        false
    }

    /// A thread started.
    pub fn on_thread_started(&mut self, thread_id: i64) {
        self.thread_mut(thread_id);
    }

    /// A thread exited. Returns whether it was the suspended current thread.
    pub fn on_thread_exited(&mut self, thread_id: i64) -> bool {
        let thread = self.thread_mut(thread_id);
        let was_suspended = thread.status == ThreadStatus::Suspended;
        thread.status = ThreadStatus::Exited;
        thread.drop_stack();
        if self.current_thread == Some(thread_id) {
            self.current_thread = None;
            if was_suspended {
                self.generation += 1;
            }
            return was_suspended;
        }
        false
    }

    /// Apply a `threads` listing: names are updated and unknown threads are
    /// created. Returns whether anything changed.
    pub fn update_names(&mut self, threads: Vec<Thread>) -> bool {
        let mut changed = false;
        for listed in threads {
            let thread = self.thread_mut(listed.id);
            if thread.name.as_deref() != Some(listed.name.as_str()) {
                thread.name = Some(listed.name);
                changed = true;
            }
        }
        changed
    }

    /// Whether `thread_id` is still the suspended current thread of the stop
    /// that produced `generation`.
    pub fn is_current_stop(&self, thread_id: i64, generation: u64) -> bool {
        generation == self.generation
            && self.current_thread == Some(thread_id)
            && self
                .threads
                .get(&thread_id)
                .is_some_and(|t| t.status == ThreadStatus::Suspended)
    }

    /// Install a fetched stack. Discarded unless `thread_id` is still the
    /// suspended current thread of the same `generation`.
    pub fn set_frames(&mut self, thread_id: i64, generation: u64, frames: Vec<Frame>) -> bool {
        if !self.is_current_stop(thread_id, generation) {
            return false;
        }
        let Some(thread) = self.threads.get_mut(&thread_id) else {
            return false;
        };
        thread.frames = frames.into_iter().map(Arc::new).collect();
        thread.current_frame = thread.frames.first().cloned();
        true
    }

    /// Make `frame_id` the selected frame of the current thread.
    pub fn select_frame(&mut self, frame_id: i64) -> Option<Arc<Frame>> {
        let id = self.current_thread?;
        let thread = self.threads.get_mut(&id)?;
        let frame = thread.frames.iter().find(|f| f.id == frame_id).cloned()?;
        thread.current_frame = Some(frame.clone());
        Some(frame)
    }

    /// Copies of every thread, ordered by id.
    pub fn threads(&self) -> Vec<DebugThread> {
        self.threads.values().cloned().collect()
    }
}

/// Immutable view of a session, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Lifecycle state.
    pub state: SessionState,
    /// Current thread id.
    pub current_thread: Option<i64>,
    /// Every known thread, ordered by id.
    pub threads: Vec<DebugThread>,
    /// Adapter capabilities (default until negotiated).
    pub capabilities: DapCapabilities,
    /// Stop/resume generation the snapshot was taken at.
    pub generation: u64,
}

impl SessionSnapshot {
    /// Snapshot of a session that has not started.
    pub fn initial() -> Self {
        Self {
            state: SessionState::Connecting,
            current_thread: None,
            threads: Vec::new(),
            capabilities: DapCapabilities::default(),
            generation: 0,
        }
    }

    pub(crate) fn capture(
        state: SessionState,
        model: &ThreadModel,
        capabilities: &DapCapabilities,
    ) -> Self {
        Self {
            state,
            current_thread: model.current_thread(),
            threads: model.threads(),
            capabilities: capabilities.clone(),
            generation: model.generation(),
        }
    }

    /// Look up a thread.
    pub fn thread(&self, id: i64) -> Option<&DebugThread> {
        self.threads.iter().find(|t| t.id == id)
    }

    /// Whether the current thread is suspended.
    pub fn is_suspended(&self) -> bool {
        self.current_thread
            .and_then(|id| self.thread(id))
            .is_some_and(|t| t.status == ThreadStatus::Suspended)
    }

    /// Selected frame of the current thread.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.current_thread
            .and_then(|id| self.thread(id))
            .and_then(|t| t.current_frame.clone())
    }
}
