//! Lifecycle observation
//!
//! State machine watching one context's navigation progress:
//! `Created -> Loading -> Ready -> Finished`. Only a stop event for the
//! top-level window counts toward `Ready`; sub-frame and non-state
//! notifications are noise. The observer detaches after the first
//! top-level stop, so the bridge is installed exactly once, and
//! `Finished` is reachable only through the result bridge firing.

use loggest_common::{Error, NavEvent, Result, RunState};
use tracing::{debug, trace};

/// Navigation-progress state machine for one run.
#[derive(Debug)]
pub struct LifecycleObserver {
    state: RunState,
}

impl LifecycleObserver {
    pub fn new() -> Self {
        Self {
            state: RunState::Created,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Navigation has started loading the runner page.
    pub fn navigation_started(&mut self) -> Result<()> {
        match self.state {
            RunState::Created => {
                self.state = RunState::Loading;
                Ok(())
            }
            other => Err(Error::Internal(format!(
                "navigation started in state {other}"
            ))),
        }
    }

    /// Feed one navigation event. Returns `true` exactly once, when the
    /// top-level load reaches its stopped state and the run enters
    /// `Ready`; after that the observer is detached and every further
    /// event is ignored.
    pub fn observe(&mut self, event: NavEvent) -> bool {
        if self.state != RunState::Loading {
            trace!(?event, state = %self.state, "navigation event after detach, ignored");
            return false;
        }
        match event {
            NavEvent::StateChange {
                stopped: true,
                top_level: true,
            } => {
                debug!("top-level load stopped, run is ready");
                self.state = RunState::Ready;
                true
            }
            other => {
                trace!(?other, "non-terminal navigation event ignored");
                false
            }
        }
    }

    /// The result bridge fired; the run is terminal.
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            RunState::Ready => {
                self.state = RunState::Finished;
                Ok(())
            }
            other => Err(Error::Internal(format!("bridge fired in state {other}"))),
        }
    }
}

impl Default for LifecycleObserver {
    fn default() -> Self {
        Self::new()
    }
}
