//! Logical clock of a join.
//!
//! The epoch counter is only ever advanced here. Closing an epoch sends the
//! close signal to the reshuffler, which forwards it in-band to every
//! joiner. Once every participant acked, the next epoch opens with the next
//! mapping.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thetaflow_error::{FlowError, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::cancel::{CancelHandle, CancelToken, RunState};
use crate::clock::{delayed_interval, tick};
use crate::matrix::{Epoch, MappingVersion, MatrixAssignment};
use crate::message::{
    CloseReason, EpochCloseAck, EpochCloseSignal, MappingUpdate, Participant, ReshufflerMessage,
    SynchronizerMessage,
};
use crate::topology::Topology;

#[derive(Debug)]
enum SyncState {
    Open,
    Closing {
        reason: CloseReason,
        pending: BTreeSet<Participant>,
        proposal: Option<MatrixAssignment>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SynchronizerSummary {
    /// Last epoch opened.
    pub epoch: Epoch,
}

#[derive(Debug)]
pub struct EpochSynchronizer {
    epoch: Epoch,
    state: SyncState,
    assignment: Arc<MatrixAssignment>,
    /// Assignment requested explicitly for the next epoch.
    requested: Option<MatrixAssignment>,
    shutdown_deferred: bool,
    interval: Option<Duration>,
    topology: Topology,
    inbound: mpsc::UnboundedReceiver<SynchronizerMessage>,
    cancel: CancelToken,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl EpochSynchronizer {
    pub fn new(
        initial: MappingVersion,
        interval: Option<Duration>,
        topology: Topology,
        inbound: mpsc::UnboundedReceiver<SynchronizerMessage>,
        cancel: CancelToken,
    ) -> Self {
        EpochSynchronizer {
            epoch: initial.epoch,
            state: SyncState::Open,
            assignment: initial.assignment,
            requested: None,
            shutdown_deferred: false,
            interval,
            topology,
            inbound,
            cancel,
        }
    }

    /// Run until shutdown, aborting the join on error.
    pub async fn run(self, abort: CancelHandle) -> Result<SynchronizerSummary> {
        let result = self.start().await;
        if let Err(e) = &result {
            if e.kind() != thetaflow_error::ErrorKind::Canceled {
                abort.abort();
            }
        }
        result
    }

    async fn start(mut self) -> Result<SynchronizerSummary> {
        info!(epoch = self.epoch, dims = %self.assignment.dimensions_string(), "starting synchronizer");

        let mut ticker = delayed_interval(self.interval);
        let mut cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;

                state = cancel.stopped() => {
                    debug!(?state, "synchronizer stopping");
                    return match state {
                        RunState::Aborted => Err(CancelToken::stop_error(state)),
                        _ => Ok(self.summary()),
                    };
                }
                msg = self.inbound.recv() => {
                    let msg = match msg {
                        Some(msg) => msg,
                        None => return Err(FlowError::protocol("Synchronizer inbox closed")),
                    };
                    if self.handle_msg(msg).await? == Flow::Stop {
                        break;
                    }
                }
                _ = tick(&mut ticker) => {
                    if matches!(self.state, SyncState::Open) {
                        trace!(epoch = self.epoch, "epoch interval elapsed");
                        self.begin_close(CloseReason::Budget).await?;
                    }
                }
            }
        }

        info!(epoch = self.epoch, "synchronizer shut down");
        Ok(self.summary())
    }

    fn summary(&self) -> SynchronizerSummary {
        SynchronizerSummary { epoch: self.epoch }
    }

    async fn handle_msg(&mut self, msg: SynchronizerMessage) -> Result<Flow> {
        trace!(?msg, "synchronizer received message");

        match msg {
            SynchronizerMessage::RemapRequest { assignment } => {
                self.requested = Some(assignment);
                if matches!(self.state, SyncState::Open) {
                    self.begin_close(CloseReason::Remap).await?;
                }
            }
            SynchronizerMessage::BudgetExhausted { epoch } => {
                if epoch == self.epoch && matches!(self.state, SyncState::Open) {
                    self.begin_close(CloseReason::Budget).await?;
                }
            }
            SynchronizerMessage::CloseAck(ack) => return self.receive_ack(ack).await,
            SynchronizerMessage::Shutdown => {
                if matches!(self.state, SyncState::Open) {
                    self.topology.deliver_reshuffler(ReshufflerMessage::Stop).await?;
                    return Ok(Flow::Stop);
                }
                debug!(epoch = self.epoch, "deferring shutdown until epoch is open");
                self.shutdown_deferred = true;
            }
        }

        Ok(Flow::Continue)
    }

    async fn begin_close(&mut self, reason: CloseReason) -> Result<()> {
        info!(epoch = self.epoch, ?reason, "closing epoch");

        self.state = SyncState::Closing {
            reason,
            pending: self.topology.close_participants().collect(),
            proposal: None,
        };

        let signal = EpochCloseSignal {
            epoch: self.epoch,
            reason,
        };
        self.topology
            .deliver_reshuffler(ReshufflerMessage::CloseSignal(signal))
            .await
    }

    async fn receive_ack(&mut self, ack: EpochCloseAck) -> Result<Flow> {
        let SyncState::Closing {
            pending, proposal, ..
        } = &mut self.state
        else {
            return Err(FlowError::protocol("Received close ack while epoch is open")
                .with_field("participant", ack.participant)
                .with_field("epoch", ack.epoch));
        };

        if ack.epoch != self.epoch || !pending.remove(&ack.participant) {
            return Err(FlowError::protocol("Unexpected close ack")
                .with_field("participant", ack.participant)
                .with_field("ack_epoch", ack.epoch)
                .with_field("epoch", self.epoch));
        }
        if ack.proposal.is_some() {
            *proposal = ack.proposal;
        }

        if !pending.is_empty() {
            return Ok(Flow::Continue);
        }

        self.open_next().await?;

        if self.shutdown_deferred {
            self.topology.deliver_reshuffler(ReshufflerMessage::Stop).await?;
            return Ok(Flow::Stop);
        }

        Ok(Flow::Continue)
    }

    async fn open_next(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, SyncState::Open);
        let (reason, proposal) = match state {
            SyncState::Closing {
                reason, proposal, ..
            } => (reason, proposal),
            SyncState::Open => (CloseReason::Budget, None),
        };

        let consumed_remap = self.requested.is_some();
        let next = match (self.requested.take(), reason) {
            (Some(requested), _) => Some(requested),
            (None, CloseReason::Budget) => proposal,
            (None, CloseReason::Remap) => None,
        };

        self.epoch += 1;
        if let Some(next) = next {
            if next != *self.assignment {
                info!(
                    epoch = self.epoch,
                    from = %self.assignment.dimensions_string(),
                    to = %next.dimensions_string(),
                    "installing new assignment",
                );
                self.assignment = Arc::new(next);
            }
        }
        info!(epoch = self.epoch, "opened epoch");

        let update = MappingUpdate {
            version: MappingVersion::new(self.epoch, self.assignment.clone()),
            consumed_remap,
        };
        self.topology
            .deliver_reshuffler(ReshufflerMessage::MappingUpdate(update))
            .await
    }
}
