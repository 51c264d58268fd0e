use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Lifecycle state of a single subsystem.
///
/// States only move forward, one step at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubsystemState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl SubsystemState {
    pub fn next(self) -> Option<SubsystemState> {
        match self {
            SubsystemState::NotStarted => Some(SubsystemState::Starting),
            SubsystemState::Starting => Some(SubsystemState::Running),
            SubsystemState::Running => Some(SubsystemState::Stopping),
            SubsystemState::Stopping => Some(SubsystemState::Stopped),
            SubsystemState::Stopped => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubsystemState::NotStarted => "not-started",
            SubsystemState::Starting => "starting",
            SubsystemState::Running => "running",
            SubsystemState::Stopping => "stopping",
            SubsystemState::Stopped => "stopped",
        }
    }
}

impl Display for SubsystemState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{ident}: illegal state transition {from} -> {to}")]
    IllegalTransition { ident: &'static str, from: SubsystemState, to: SubsystemState },
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// Tracks the [`SubsystemState`] of one named subsystem
#[derive(Debug)]
pub struct Lifecycle {
    ident: &'static str,
    state: Mutex<SubsystemState>,
}

impl Lifecycle {
    pub fn new(ident: &'static str) -> Self {
        Self { ident, state: Mutex::new(SubsystemState::NotStarted) }
    }

    pub fn ident(&self) -> &'static str {
        self.ident
    }

    pub fn state(&self) -> SubsystemState {
        *self.state.lock()
    }

    pub fn is(&self, state: SubsystemState) -> bool {
        self.state() == state
    }

    /// Moves to `to`, which must be the immediate successor of the current state
    pub fn advance(&self, to: SubsystemState) -> LifecycleResult<()> {
        let mut state = self.state.lock();
        if state.next() != Some(to) {
            return Err(LifecycleError::IllegalTransition { ident: self.ident, from: *state, to });
        }
        *state = to;
        Ok(())
    }
}
