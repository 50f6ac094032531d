//! Session lifecycle state machine.
//!
//! A codec session moves strictly forward through its states; the only
//! backward edge is Running → Reconfiguring → Running. Any failure drops
//! the session into Failed, from which the sole valid operation is
//! teardown. Teardown releases resources in reverse acquisition order
//! (component, then pools, then device) and is idempotent.

use crate::error::{Error, Result};

/// Lifecycle states of a codec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device bound yet.
    Unbound,
    /// Device bound, no component created.
    DeviceBound,
    /// Vendor component created but not configured.
    ComponentReady,
    /// Parameters negotiated with the component.
    Configured,
    /// Device resources (pools, rings) allocated.
    Initialized,
    /// Accepting frames.
    Running,
    /// Mid-stream parameter change in progress.
    Reconfiguring,
    /// Torn down; terminal.
    Closed,
    /// Unrecoverable error; only teardown is valid.
    Failed,
}

impl SessionState {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Unbound => "unbound",
            SessionState::DeviceBound => "device-bound",
            SessionState::ComponentReady => "component-ready",
            SessionState::Configured => "configured",
            SessionState::Initialized => "initialized",
            SessionState::Running => "running",
            SessionState::Reconfiguring => "reconfiguring",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    fn forward_of(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unbound, DeviceBound)
                | (DeviceBound, ComponentReady)
                | (ComponentReady, Configured)
                | (Configured, Initialized)
                | (Initialized, Running)
                | (Running, Reconfiguring)
                | (Reconfiguring, Running)
        )
    }
}

/// State holder enforcing legal transitions, with transition logging.
#[derive(Debug)]
pub struct SessionLifecycle {
    state: SessionState,
    label: &'static str,
}

impl SessionLifecycle {
    /// Start a lifecycle in [`SessionState::Unbound`].
    pub fn new(label: &'static str) -> Self {
        Self {
            state: SessionState::Unbound,
            label,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Advance along a legal edge; illegal edges are a session failure.
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.forward_of(next) {
            return Err(Error::SessionFailed(format!(
                "illegal transition {} -> {}",
                self.state.name(),
                next.name()
            )));
        }
        crate::observability::trace_state_change(self.label, self.state.name(), next.name());
        self.state = next;
        Ok(())
    }

    /// Drop into Failed from any live state. Idempotent; a closed session
    /// stays closed.
    pub fn fail(&mut self) {
        if self.state != SessionState::Closed && self.state != SessionState::Failed {
            crate::observability::trace_state_change(self.label, self.state.name(), "failed");
            self.state = SessionState::Failed;
        }
    }

    /// Move to Closed from any state. Returns whether this call performed
    /// the transition (false when already closed, so teardown runs once).
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        crate::observability::trace_state_change(self.label, self.state.name(), "closed");
        self.state = SessionState::Closed;
        true
    }

    /// Guard for frame submission: only Running accepts frames.
    pub fn ensure_running(&self) -> Result<()> {
        match self.state {
            SessionState::Running => Ok(()),
            SessionState::Failed => Err(Error::SessionFailed(
                "session is in the failed state".into(),
            )),
            SessionState::Closed => Err(Error::SessionFailed("session is closed".into())),
            other => Err(Error::SessionFailed(format!(
                "session not running (state: {})",
                other.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    fn running_lifecycle() -> SessionLifecycle {
        let mut lc = SessionLifecycle::new("test");
        for s in [DeviceBound, ComponentReady, Configured, Initialized, Running] {
            lc.advance(s).unwrap();
        }
        lc
    }

    #[test]
    fn forward_path() {
        let lc = running_lifecycle();
        assert_eq!(lc.state(), Running);
        assert!(lc.ensure_running().is_ok());
    }

    #[test]
    fn reconfigure_is_the_only_backward_edge() {
        let mut lc = running_lifecycle();
        lc.advance(Reconfiguring).unwrap();
        lc.advance(Running).unwrap();
        assert_eq!(lc.state(), Running);
    }

    #[test]
    fn skipping_states_is_illegal() {
        let mut lc = SessionLifecycle::new("test");
        assert!(lc.advance(Running).is_err());
        lc.advance(DeviceBound).unwrap();
        assert!(lc.advance(Initialized).is_err());
    }

    #[test]
    fn backward_transitions_rejected() {
        let mut lc = running_lifecycle();
        assert!(lc.advance(Configured).is_err());
    }

    #[test]
    fn failed_rejects_frames_and_allows_close() {
        let mut lc = running_lifecycle();
        lc.fail();
        assert_eq!(lc.state(), Failed);
        assert!(matches!(
            lc.ensure_running(),
            Err(Error::SessionFailed(_))
        ));
        assert!(lc.close());
        assert_eq!(lc.state(), Closed);
    }

    #[test]
    fn close_is_idempotent() {
        let mut lc = running_lifecycle();
        assert!(lc.close());
        assert!(!lc.close());
        assert!(!lc.close());
        // A closed session can no longer fail.
        lc.fail();
        assert_eq!(lc.state(), Closed);
    }

    #[test]
    fn close_from_any_state() {
        let mut lc = SessionLifecycle::new("test");
        assert!(lc.close());
        let mut lc = SessionLifecycle::new("test");
        lc.advance(DeviceBound).unwrap();
        assert!(lc.close());
    }
}
