//! DAP session lifecycle state machine.

use std::fmt;

use crate::error::DapError;

/// The current state of a debug session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// The channel is open; `initialize` has not been sent.
    Connecting,
    /// `initialize` is in flight or the adapter has not yet asked for
    /// configuration.
    Initializing,
    /// Breakpoints are being pushed; `configurationDone` is pending.
    Configuring,
    /// The debuggee is running.
    Running,
    /// A thread is stopped.
    Suspended,
    /// The session has ended. Final.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Initializing => "initializing",
            SessionState::Configuring => "configuring",
            SessionState::Running => "running",
            SessionState::Suspended => "suspended",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Validated lifecycle transitions of a single debug session.
#[derive(Debug)]
pub struct Lifecycle {
    state: SessionState,
    configured: bool,
    // Where a resume lands while configuration is still incomplete.
    resume_to: SessionState,
}

impl Lifecycle {
    /// Create a lifecycle in the [`Connecting`](SessionState::Connecting) state.
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            configured: false,
            resume_to: SessionState::Running,
        }
    }

    /// Return the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session has terminated.
    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Whether `configurationDone` has been acknowledged.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Transition: Connecting → Initializing.
    pub fn begin_initialize(&mut self) -> Result<(), DapError> {
        self.require_not_terminated()?;
        self.require(SessionState::Connecting, "initialize")?;
        self.state = SessionState::Initializing;
        Ok(())
    }

    /// Transition: Initializing → Configuring.
    pub fn begin_configuration(&mut self) -> Result<(), DapError> {
        self.require_not_terminated()?;
        match self.state {
            SessionState::Initializing => {
                self.state = SessionState::Configuring;
                Ok(())
            }
            // Stop-on-entry may suspend a thread before configuration.
            SessionState::Suspended if !self.configured => {
                self.resume_to = SessionState::Configuring;
                Ok(())
            }
            _ => Err(self.invalid("configure")),
        }
    }

    /// Transition: Configuring → Running.
    ///
    /// A session that already stopped during configuration stays Suspended.
    pub fn configuration_done(&mut self) -> Result<(), DapError> {
        self.require_not_terminated()?;
        match self.state {
            SessionState::Configuring => self.state = SessionState::Running,
            SessionState::Suspended if self.resume_to == SessionState::Configuring => {}
            _ => return Err(self.invalid("finish configuration")),
        }
        self.configured = true;
        self.resume_to = SessionState::Running;
        Ok(())
    }

    /// Transition: any live state past Connecting → Suspended.
    pub fn suspend(&mut self) -> Result<(), DapError> {
        match self.state {
            SessionState::Terminated => Err(DapError::Terminated),
            SessionState::Connecting => Err(DapError::NotInitialized),
            SessionState::Suspended => Ok(()),
            state => {
                if !self.configured {
                    self.resume_to = state;
                }
                self.state = SessionState::Suspended;
                Ok(())
            }
        }
    }

    /// Transition: Suspended → Running, or back to the configuration phase
    /// the session stopped in.
    ///
    /// A resume observed in any other live state leaves it unchanged.
    /// Returns whether the state changed.
    pub fn resume(&mut self) -> Result<bool, DapError> {
        self.require_not_terminated()?;
        if self.state != SessionState::Suspended {
            return Ok(false);
        }
        self.state = if self.configured {
            SessionState::Running
        } else {
            self.resume_to
        };
        Ok(true)
    }

    /// Transition: any → Terminated.
    ///
    /// Returns `true` only on the first call.
    pub fn terminate(&mut self) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.state = SessionState::Terminated;
        true
    }

    /// Check that the session is not terminated.
    pub fn require_not_terminated(&self) -> Result<(), DapError> {
        if self.state == SessionState::Terminated {
            return Err(DapError::Terminated);
        }
        Ok(())
    }

    /// Check that a thread is suspended.
    pub fn require_suspended(&self) -> Result<(), DapError> {
        match self.state {
            SessionState::Suspended => Ok(()),
            SessionState::Terminated => Err(DapError::Terminated),
            _ => Err(DapError::NotSuspended),
        }
    }

    fn require(&self, expected: SessionState, operation: &str) -> Result<(), DapError> {
        if self.state != expected {
            return Err(self.invalid(operation));
        }
        Ok(())
    }

    fn invalid(&self, operation: &str) -> DapError {
        DapError::InvalidState {
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Lifecycle {
        let mut lifecycle = Lifecycle::new();
        lifecycle.begin_initialize().unwrap();
        lifecycle.begin_configuration().unwrap();
        lifecycle.configuration_done().unwrap();
        lifecycle
    }

    #[test]
    fn session_lifecycle_happy_path() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), SessionState::Connecting);

        lifecycle.begin_initialize().unwrap();
        assert_eq!(lifecycle.state(), SessionState::Initializing);

        lifecycle.begin_configuration().unwrap();
        assert_eq!(lifecycle.state(), SessionState::Configuring);
        assert!(!lifecycle.is_configured());

        lifecycle.configuration_done().unwrap();
        assert_eq!(lifecycle.state(), SessionState::Running);
        assert!(lifecycle.is_configured());

        lifecycle.suspend().unwrap();
        assert_eq!(lifecycle.state(), SessionState::Suspended);

        assert!(lifecycle.resume().unwrap());
        assert_eq!(lifecycle.state(), SessionState::Running);

        assert!(lifecycle.terminate());
        assert_eq!(lifecycle.state(), SessionState::Terminated);
    }

    #[test]
    fn session_out_of_order_transitions() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle.begin_configuration().unwrap_err();
        assert!(matches!(err, DapError::InvalidState { .. }));
        assert!(matches!(lifecycle.suspend(), Err(DapError::NotInitialized)));

        lifecycle.begin_initialize().unwrap();
        assert!(matches!(
            lifecycle.begin_initialize(),
            Err(DapError::InvalidState { .. })
        ));
        assert!(matches!(
            lifecycle.configuration_done(),
            Err(DapError::InvalidState { .. })
        ));
    }

    #[test]
    fn session_stop_during_configuration_stays_suspended() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.begin_initialize().unwrap();
        lifecycle.begin_configuration().unwrap();
        lifecycle.suspend().unwrap();
        lifecycle.configuration_done().unwrap();
        assert_eq!(lifecycle.state(), SessionState::Suspended);
        assert!(lifecycle.is_configured());
    }

    #[test]
    fn session_resume_before_configuration_returns_to_phase() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.begin_initialize().unwrap();
        lifecycle.suspend().unwrap();
        assert!(lifecycle.resume().unwrap());
        assert_eq!(lifecycle.state(), SessionState::Initializing);

        lifecycle.begin_configuration().unwrap();
        lifecycle.suspend().unwrap();
        lifecycle.resume().unwrap();
        assert_eq!(lifecycle.state(), SessionState::Configuring);
        lifecycle.configuration_done().unwrap();
        assert_eq!(lifecycle.state(), SessionState::Running);
    }

    #[test]
    fn session_resume_when_running_is_noop() {
        let mut lifecycle = configured();
        assert!(!lifecycle.resume().unwrap());
        assert_eq!(lifecycle.state(), SessionState::Running);
    }

    #[test]
    fn session_require_suspended() {
        let mut lifecycle = configured();
        assert!(matches!(
            lifecycle.require_suspended(),
            Err(DapError::NotSuspended)
        ));
        lifecycle.suspend().unwrap();
        assert!(lifecycle.require_suspended().is_ok());
    }

    #[test]
    fn session_operations_after_terminate() {
        let mut lifecycle = configured();
        assert!(lifecycle.terminate());
        assert!(!lifecycle.terminate());

        assert!(matches!(lifecycle.begin_initialize(), Err(DapError::Terminated)));
        assert!(matches!(lifecycle.suspend(), Err(DapError::Terminated)));
        assert!(matches!(lifecycle.resume(), Err(DapError::Terminated)));
        assert!(matches!(
            lifecycle.require_suspended(),
            Err(DapError::Terminated)
        ));
        assert_eq!(lifecycle.state(), SessionState::Terminated);
    }

    #[test]
    fn session_state_display() {
        assert_eq!(SessionState::Configuring.to_string(), "configuring");
        assert_eq!(SessionState::Suspended.to_string(), "suspended");
    }

    #[test]
    fn session_default_trait() {
        let lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.state(), SessionState::Connecting);
    }
}
