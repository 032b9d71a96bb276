use std::sync::Arc;

use thetaflow_error::FlowError;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Canceled by the user.
    Cancelled,
    /// Stopped because a participant failed.
    Aborted,
}

/// Signals every participant of a join to stop.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<RunState>>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(RunState::Running);
        (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.transition(RunState::Cancelled);
    }

    pub fn abort(&self) {
        self.transition(RunState::Aborted);
    }

    pub fn state(&self) -> RunState {
        *self.tx.borrow()
    }

    /// Only the first transition out of running sticks.
    fn transition(&self, to: RunState) {
        self.tx.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = to;
                true
            } else {
                false
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<RunState>,
}

impl CancelToken {
    pub fn state(&self) -> RunState {
        *self.rx.borrow()
    }

    /// Resolves once the join stops running.
    ///
    /// Never resolves if every handle was dropped without stopping.
    pub async fn stopped(&mut self) -> RunState {
        let state = self
            .rx
            .wait_for(|state| *state != RunState::Running)
            .await
            .map(|state| *state);
        match state {
            Ok(state) => state,
            Err(_) => futures::future::pending().await,
        }
    }

    /// Error to return from a participant that observed the stop.
    pub fn stop_error(state: RunState) -> FlowError {
        match state {
            RunState::Aborted => FlowError::canceled("Join aborted after a participant failed"),
            _ => FlowError::canceled("Join canceled"),
        }
    }
}
