//! Lifecycle control for an import session.
//!
//! ```text
//! idle -> executing -> { paused <-> executing } -> completed | failed | cancelled
//! ```
//!
//! The state lives in a `tokio::sync::watch` channel so hosts can observe it
//! and the orchestrator can wait on a pause without polling.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{DumpImportError, Result};
use crate::session::{ImportProgress, ImportStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Idle,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ControlState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControlState::Completed | ControlState::Failed | ControlState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlState::Idle => "idle",
            ControlState::Executing => "executing",
            ControlState::Paused => "paused",
            ControlState::Completed => "completed",
            ControlState::Failed => "failed",
            ControlState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared handle for driving and observing an import.
///
/// Cloning is cheap; every clone controls the same session.
#[derive(Debug, Clone)]
pub struct ImportController {
    state: Arc<watch::Sender<ControlState>>,
    progress: Arc<watch::Sender<ImportProgress>>,
}

impl Default for ImportController {
    fn default() -> Self {
        Self::new()
    }
}

impl ImportController {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ControlState::Idle);
        let (progress, _) = watch::channel(ImportProgress::default());
        Self {
            state: Arc::new(state),
            progress: Arc::new(progress),
        }
    }

    pub fn state(&self) -> ControlState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.state.subscribe()
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> ImportProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ImportProgress> {
        self.progress.subscribe()
    }

    pub fn can_start(&self) -> bool {
        self.state() == ControlState::Idle
    }

    pub fn can_pause(&self) -> bool {
        self.state() == ControlState::Executing
    }

    pub fn can_resume(&self) -> bool {
        self.state() == ControlState::Paused
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self.state(), ControlState::Executing | ControlState::Paused)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ControlState::Cancelled
    }

    pub(crate) fn start(&self) -> Result<()> {
        self.transition("start", ControlState::Executing, |s| s == ControlState::Idle)
    }

    /// Pause before the next batch. The batch in flight finishes first.
    pub fn pause(&self) -> Result<()> {
        self.transition("pause", ControlState::Paused, |s| s == ControlState::Executing)?;
        info!("Pause requested");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.transition("resume", ControlState::Executing, |s| s == ControlState::Paused)?;
        info!("Resume requested");
        Ok(())
    }

    /// Stop dispatching further statements. Cooperative: an in-flight batch
    /// is allowed to complete.
    pub fn cancel(&self) -> Result<()> {
        self.transition("cancel", ControlState::Cancelled, |s| {
            matches!(s, ControlState::Executing | ControlState::Paused)
        })?;
        info!("Cancel requested");
        Ok(())
    }

    /// Return a finished session to idle so a new one can start.
    pub fn reset(&self) -> Result<()> {
        self.transition("reset", ControlState::Idle, |s| s.is_terminal() || s == ControlState::Idle)?;
        self.progress.send_replace(ImportProgress::default());
        Ok(())
    }

    /// Move to the terminal state for `status`. A cancellation that already
    /// happened is kept.
    pub(crate) fn finish(&self, status: ImportStatus) -> ControlState {
        let target = match status {
            ImportStatus::Success | ImportStatus::Partial => ControlState::Completed,
            ImportStatus::Failed => ControlState::Failed,
            ImportStatus::Cancelled => ControlState::Cancelled,
        };
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == ControlState::Idle {
                return false;
            }
            *current = target;
            true
        });
        self.state()
    }

    pub(crate) fn publish_progress(&self, progress: &ImportProgress) {
        self.progress.send_replace(progress.clone());
    }

    /// Wait until the session is no longer paused and return the state that
    /// ended the wait.
    pub async fn wait_while_paused(&self) -> ControlState {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != ControlState::Paused {
                return current;
            }
            if rx.changed().await.is_err() {
                return current;
            }
        }
    }

    fn transition<F>(&self, operation: &'static str, to: ControlState, allowed: F) -> Result<()>
    where
        F: FnOnce(ControlState) -> bool,
    {
        let mut rejected = None;
        self.state.send_if_modified(|current| {
            if allowed(*current) {
                let changed = *current != to;
                *current = to;
                changed
            } else {
                rejected = Some(*current);
                false
            }
        });
        match rejected {
            Some(state) => Err(DumpImportError::invalid_state(operation, state)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_initial_predicates() {
        let c = ImportController::new();
        assert_eq!(c.state(), ControlState::Idle);
        assert!(c.can_start());
        assert!(!c.can_pause());
        assert!(!c.can_resume());
        assert!(!c.can_cancel());
    }

    #[test]
    fn test_legal_transitions() {
        let c = ImportController::new();
        c.start().unwrap();
        assert!(c.can_pause() && c.can_cancel());
        c.pause().unwrap();
        assert!(c.can_resume() && c.can_cancel());
        c.resume().unwrap();
        assert_eq!(c.state(), ControlState::Executing);
        c.cancel().unwrap();
        assert!(c.is_cancelled());
        assert!(!c.can_cancel());
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let c = ImportController::new();
        assert!(matches!(
            c.pause(),
            Err(DumpImportError::InvalidState { operation: "pause", .. })
        ));
        assert!(c.resume().is_err());
        assert!(c.cancel().is_err());
        c.start().unwrap();
        assert!(c.start().is_err());
        assert!(c.resume().is_err());
        assert!(c.reset().is_err());
    }

    #[test]
    fn test_finish_and_reset() {
        let c = ImportController::new();
        c.start().unwrap();
        assert_eq!(c.finish(ImportStatus::Partial), ControlState::Completed);
        assert!(c.start().is_err());
        c.reset().unwrap();
        assert!(c.can_start());
    }

    #[test]
    fn test_finish_keeps_cancellation() {
        let c = ImportController::new();
        c.start().unwrap();
        c.cancel().unwrap();
        assert_eq!(c.finish(ImportStatus::Success), ControlState::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_while_paused_returns_on_resume() {
        let c = ImportController::new();
        c.start().unwrap();
        c.pause().unwrap();

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        c.resume().unwrap();
        let state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, ControlState::Executing);
    }

    #[tokio::test]
    async fn test_wait_while_paused_returns_on_cancel() {
        let c = ImportController::new();
        c.start().unwrap();
        c.pause().unwrap();
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_while_paused().await })
        };
        c.cancel().unwrap();
        assert_eq!(waiter.await.unwrap(), ControlState::Cancelled);
    }

    #[test]
    fn test_progress_snapshots() {
        let c = ImportController::new();
        let rx = c.subscribe_progress();
        let progress = ImportProgress {
            statements_executed: 3,
            total_statements: 5,
            ..ImportProgress::default()
        };
        c.publish_progress(&progress);
        assert_eq!(rx.borrow().statements_executed, 3);
        c.start().unwrap();
        c.finish(ImportStatus::Success);
        c.reset().unwrap();
        assert_eq!(c.progress(), ImportProgress::default());
    }
}
