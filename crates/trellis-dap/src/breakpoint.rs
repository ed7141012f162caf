//! IDE-side breakpoint registry and conversion to protocol breakpoints.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::paths::PathMapper;
use crate::protocol::SourceBreakpoint;

/// Registry-assigned breakpoint identifier.
pub type BreakpointId = u64;

/// A breakpoint as the IDE knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Assigned by [`BreakpointManager::add`]; 0 until registered.
    pub id: BreakpointId,
    /// Location URL (e.g. `file:///src/main.js`).
    pub url: String,
    /// Line number (1-based).
    pub line: i64,
    /// Optional condition expression.
    pub condition: Option<String>,
    /// Optional hit condition expression.
    pub hit_condition: Option<String>,
    /// Optional log message (logpoint).
    pub log_message: Option<String>,
    /// Disabled breakpoints stay registered but are not sent.
    pub enabled: bool,
}

impl Breakpoint {
    /// Create an enabled breakpoint at the given URL and line.
    pub fn new(url: impl Into<String>, line: i64) -> Self {
        Self {
            id: 0,
            url: url.into(),
            line,
            condition: None,
            hit_condition: None,
            log_message: None,
            enabled: true,
        }
    }

    /// Create a conditional breakpoint.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Create a breakpoint with a hit condition.
    pub fn with_hit_condition(mut self, hit_condition: impl Into<String>) -> Self {
        self.hit_condition = Some(hit_condition.into());
        self
    }

    /// Create a logpoint.
    pub fn with_log_message(mut self, msg: impl Into<String>) -> Self {
        self.log_message = Some(msg.into());
        self
    }

    /// Create the breakpoint disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A change to the registry, delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointChange {
    /// A breakpoint was registered.
    Added(Breakpoint),
    /// A breakpoint was removed.
    Removed(Breakpoint),
    /// A breakpoint's properties changed.
    Changed {
        /// The breakpoint before the change.
        before: Breakpoint,
        /// The breakpoint after the change.
        after: Breakpoint,
    },
}

impl BreakpointChange {
    /// Every breakpoint state this change touches.
    pub fn breakpoints(&self) -> Vec<&Breakpoint> {
        match self {
            BreakpointChange::Added(bp) | BreakpointChange::Removed(bp) => vec![bp],
            BreakpointChange::Changed { before, after } => vec![before, after],
        }
    }
}

/// Callback invoked on every registry change.
pub type BreakpointListener = Arc<dyn Fn(&BreakpointChange) + Send + Sync>;

/// Handle returned by [`BreakpointManager::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: BreakpointId,
    next_listener: u64,
    breakpoints: Vec<Breakpoint>,
    listeners: Vec<(ListenerId, BreakpointListener)>,
}

/// Global breakpoint registry shared by every session.
///
/// Listeners are invoked after the registry lock is released, so they may
/// read the registry.
#[derive(Default)]
pub struct BreakpointManager {
    inner: Mutex<Registry>,
}

impl BreakpointManager {
    /// Create a new empty breakpoint manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: BreakpointChange) {
        let listeners: Vec<BreakpointListener> = self
            .registry()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&change);
        }
    }

    /// Register a breakpoint. Returns its assigned id.
    pub fn add(&self, mut bp: Breakpoint) -> BreakpointId {
        let added = {
            let mut registry = self.registry();
            registry.next_id += 1;
            bp.id = registry.next_id;
            registry.breakpoints.push(bp.clone());
            bp
        };
        let id = added.id;
        self.notify(BreakpointChange::Added(added));
        id
    }

    /// Remove a breakpoint by id.
    ///
    /// Returns `true` if a breakpoint was removed.
    pub fn remove(&self, id: BreakpointId) -> bool {
        let removed = {
            let mut registry = self.registry();
            let index = registry.breakpoints.iter().position(|bp| bp.id == id);
            index.map(|i| registry.breakpoints.remove(i))
        };
        match removed {
            Some(bp) => {
                self.notify(BreakpointChange::Removed(bp));
                true
            }
            None => false,
        }
    }

    /// Remove every breakpoint at the given URL and line.
    ///
    /// Returns `true` if anything was removed.
    pub fn remove_at(&self, url: &str, line: i64) -> bool {
        let removed: Vec<Breakpoint> = {
            let mut registry = self.registry();
            let (removed, kept): (Vec<Breakpoint>, Vec<Breakpoint>) =
                std::mem::take(&mut registry.breakpoints)
                    .into_iter()
                    .partition(|bp| bp.url == url && bp.line == line);
            registry.breakpoints = kept;
            removed
        };
        let any = !removed.is_empty();
        for bp in removed {
            self.notify(BreakpointChange::Removed(bp));
        }
        any
    }

    /// Enable or disable a breakpoint.
    ///
    /// Returns `false` if no such breakpoint exists. Listeners are only
    /// notified when the flag actually changes.
    pub fn set_enabled(&self, id: BreakpointId, enabled: bool) -> bool {
        let change = {
            let mut registry = self.registry();
            let Some(bp) = registry.breakpoints.iter_mut().find(|bp| bp.id == id) else {
                return false;
            };
            if bp.enabled == enabled {
                None
            } else {
                let before = bp.clone();
                bp.enabled = enabled;
                Some(BreakpointChange::Changed {
                    before,
                    after: bp.clone(),
                })
            }
        };
        if let Some(change) = change {
            self.notify(change);
        }
        true
    }

    /// Look up a breakpoint by id.
    pub fn get(&self, id: BreakpointId) -> Option<Breakpoint> {
        self.registry()
            .breakpoints
            .iter()
            .find(|bp| bp.id == id)
            .cloned()
    }

    /// Every registered breakpoint, in registration order.
    pub fn all(&self) -> Vec<Breakpoint> {
        self.registry().breakpoints.clone()
    }

    /// Subscribe to registry changes.
    pub fn add_listener(&self, listener: BreakpointListener) -> ListenerId {
        let mut registry = self.registry();
        registry.next_listener += 1;
        let id = ListenerId(registry.next_listener);
        registry.listeners.push((id, listener));
        id
    }

    /// Unsubscribe. Returns `false` if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registry = self.registry();
        let before = registry.listeners.len();
        registry.listeners.retain(|(lid, _)| *lid != id);
        registry.listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.registry().listeners.len()
    }
}

impl std::fmt::Debug for BreakpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("BreakpointManager")
            .field("breakpoints", &registry.breakpoints)
            .field("listeners", &registry.listeners.len())
            .finish()
    }
}

/// A protocol breakpoint together with the source it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedBreakpoint {
    /// Adapter source path.
    pub path: String,
    /// The protocol breakpoint.
    pub breakpoint: SourceBreakpoint,
}

/// Turns IDE breakpoints into protocol breakpoints.
pub trait BreakpointConvertor: Send + Sync {
    /// Convert one breakpoint into zero or more protocol breakpoints.
    fn convert(&self, bp: &Breakpoint, paths: &dyn PathMapper) -> Vec<ConvertedBreakpoint>;

    /// Sources this breakpoint belongs to, whether or not it currently
    /// converts to anything. Used to decide which sources to resend.
    fn source_paths(&self, bp: &Breakpoint, paths: &dyn PathMapper) -> Vec<String> {
        paths.to_path(&bp.url).into_iter().collect()
    }
}

/// Converts enabled line breakpoints with a mappable URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineBreakpointConvertor;

impl BreakpointConvertor for LineBreakpointConvertor {
    fn convert(&self, bp: &Breakpoint, paths: &dyn PathMapper) -> Vec<ConvertedBreakpoint> {
        if !bp.enabled {
            return Vec::new();
        }
        let Some(path) = paths.to_path(&bp.url) else {
            debug!("dropping breakpoint {} at {}: no source path", bp.id, bp.url);
            return Vec::new();
        };
        vec![ConvertedBreakpoint {
            path,
            breakpoint: SourceBreakpoint {
                line: bp.line,
                column: None,
                condition: bp.condition.clone(),
                hit_condition: bp.hit_condition.clone(),
                log_message: bp.log_message.clone(),
            },
        }]
    }
}
