//! Routes source tuples to joiners and drives assignment changes.
//!
//! The reshuffler is the only participant that talks to every joiner on the
//! data path, so epoch close signals and mapping updates are forwarded
//! in-band behind the data they follow.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use thetaflow_error::{ErrorKind, FlowError, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::cancel::{CancelHandle, CancelToken, RunState};
use crate::matrix::{Cell, Epoch, MappingVersion, MatrixAssignment, WorkerId};
use crate::message::{
    CloseReason, DataTuple, EpochCloseAck, EpochCloseSignal, JoinerMessage, MappingUpdate,
    MigrationAck, MigrationRequest, MigrationRetire, Participant, ReshufflerMessage, SourceTuple,
    SynchronizerMessage,
};
use crate::migration::MigrationPlan;
use crate::row::Side;
use crate::topology::Topology;

/// Minimum relative improvement in per-cell input for the advisor to propose
/// a new shape.
const ADVISOR_MIN_IMPROVEMENT: f64 = 0.10;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReshufflerSummary {
    pub left_routed: u64,
    pub right_routed: u64,
    /// Assignment changes applied.
    pub remaps: u64,
}

/// Outstanding migration, tracked per target cell.
#[derive(Debug)]
struct MigrationTracker {
    epoch: Epoch,
    /// Target cells that haven't acked yet, with the sources feeding them.
    pending_targets: BTreeMap<Cell, Vec<Cell>>,
    /// Number of unacked targets per source cell.
    source_remaining: BTreeMap<Cell, usize>,
    source_owner: BTreeMap<Cell, WorkerId>,
}

impl MigrationTracker {
    fn new(epoch: Epoch, plan: &MigrationPlan) -> Self {
        let mut pending_targets: BTreeMap<Cell, Vec<Cell>> = BTreeMap::new();
        for target in plan.receiving_cells() {
            let sources: BTreeSet<_> = plan.sources_of(target).collect();
            pending_targets.insert(target, sources.into_iter().collect());
        }

        let mut source_remaining = BTreeMap::new();
        for sources in pending_targets.values() {
            for source in sources {
                *source_remaining.entry(*source).or_insert(0) += 1;
            }
        }

        MigrationTracker {
            epoch,
            pending_targets,
            source_remaining,
            source_owner: plan.sources().collect(),
        }
    }

    /// Record an ack, returning source cells that may be retired.
    fn ack(&mut self, ack: &MigrationAck) -> Result<Vec<(Cell, WorkerId)>> {
        let sources = self.pending_targets.remove(&ack.cell).ok_or_else(|| {
            FlowError::protocol("Ack for a cell that isn't migrating")
                .with_field("cell", ack.cell)
                .with_field("worker", ack.worker)
        })?;

        let mut retire = Vec::new();
        for source in sources {
            if let Some(remaining) = self.source_remaining.get_mut(&source) {
                *remaining -= 1;
                if *remaining == 0 {
                    self.source_remaining.remove(&source);
                    if let Some(owner) = self.source_owner.get(&source) {
                        retire.push((source, *owner));
                    }
                }
            }
        }

        Ok(retire)
    }

    fn is_settled(&self) -> bool {
        self.pending_targets.is_empty()
    }
}

#[derive(Debug)]
pub struct Reshuffler {
    epoch: Epoch,
    assignment: Arc<MatrixAssignment>,
    /// Next sequence number per side, also the number of tuples seen.
    left_seq: u64,
    right_seq: u64,
    routed_in_epoch: u64,
    epoch_budget: Option<u64>,
    budget_requested: bool,
    /// Set while an epoch is closing, source input isn't read.
    paused: bool,
    input_done: bool,
    migration: Option<MigrationTracker>,
    remap_in_flight: bool,
    deferred_remaps: VecDeque<MatrixAssignment>,
    shutdown_sent: bool,
    stop_received: bool,
    remaps: u64,
    topology: Topology,
    inbound: mpsc::UnboundedReceiver<ReshufflerMessage>,
    input: mpsc::Receiver<SourceTuple>,
    cancel: CancelToken,
}

impl Reshuffler {
    pub fn new(
        initial: MappingVersion,
        epoch_budget: Option<u64>,
        topology: Topology,
        inbound: mpsc::UnboundedReceiver<ReshufflerMessage>,
        input: mpsc::Receiver<SourceTuple>,
        cancel: CancelToken,
    ) -> Self {
        Reshuffler {
            epoch: initial.epoch,
            assignment: initial.assignment,
            left_seq: 0,
            right_seq: 0,
            routed_in_epoch: 0,
            epoch_budget,
            budget_requested: false,
            paused: false,
            input_done: false,
            migration: None,
            remap_in_flight: false,
            deferred_remaps: VecDeque::new(),
            shutdown_sent: false,
            stop_received: false,
            remaps: 0,
            topology,
            inbound,
            input,
            cancel,
        }
    }

    /// Run until every joiner was told to finish, aborting the join on
    /// error.
    pub async fn run(self, abort: CancelHandle) -> Result<ReshufflerSummary> {
        let result = self.start().await;
        if let Err(e) = &result {
            if e.kind() != ErrorKind::Canceled {
                error!(%e, "aborting join");
                abort.abort();
            }
        }
        result
    }

    async fn start(mut self) -> Result<ReshufflerSummary> {
        info!(
            epoch = self.epoch,
            dims = %self.assignment.dimensions_string(),
            joiners = self.topology.num_joiners(),
            "starting reshuffler",
        );

        let mut cancel = self.cancel.clone();

        loop {
            if self.stop_received && self.migration.is_none() {
                break;
            }

            tokio::select! {
                biased;

                state = cancel.stopped() => {
                    debug!(?state, "reshuffler stopping");
                    return match state {
                        RunState::Aborted => Err(CancelToken::stop_error(state)),
                        _ => Ok(self.summary()),
                    };
                }
                msg = self.inbound.recv() => {
                    let msg = match msg {
                        Some(msg) => msg,
                        None => return Err(FlowError::protocol("Reshuffler inbox closed")),
                    };
                    self.handle_msg(msg).await?;
                }
                tuple = self.input.recv(), if !self.paused && !self.input_done => {
                    match tuple {
                        Some(tuple) => self.route(tuple).await?,
                        None => {
                            debug!(left = self.left_seq, right = self.right_seq, "input finished");
                            self.input_done = true;
                            self.maybe_shutdown().await?;
                        }
                    }
                }
            }
        }

        for worker in 0..self.topology.num_joiners() {
            self.topology
                .deliver_joiner(worker, JoinerMessage::Finish)
                .await?;
        }

        let summary = self.summary();
        info!(
            left = summary.left_routed,
            right = summary.right_routed,
            remaps = summary.remaps,
            "reshuffler finished",
        );
        Ok(summary)
    }

    fn summary(&self) -> ReshufflerSummary {
        ReshufflerSummary {
            left_routed: self.left_seq,
            right_routed: self.right_seq,
            remaps: self.remaps,
        }
    }

    async fn handle_msg(&mut self, msg: ReshufflerMessage) -> Result<()> {
        match msg {
            ReshufflerMessage::Remap { assignment } => self.request_remap(assignment).await,
            ReshufflerMessage::CloseSignal(sig) => self.on_close(sig).await,
            ReshufflerMessage::MappingUpdate(update) => self.on_mapping_update(update).await,
            ReshufflerMessage::MigrationAck(ack) => self.on_migration_ack(ack).await,
            ReshufflerMessage::Stop => {
                debug!("synchronizer stopped");
                self.stop_received = true;
                Ok(())
            }
            ReshufflerMessage::WorkerFailed { worker, error } => {
                Err(FlowError::protocol("Joiner failed")
                    .with_field("worker", worker)
                    .with_field("error", error))
            }
        }
    }

    async fn route(&mut self, tuple: SourceTuple) -> Result<()> {
        let seq = match tuple.side {
            Side::Left => &mut self.left_seq,
            Side::Right => &mut self.right_seq,
        };
        let tuple_seq = *seq;
        *seq += 1;

        let bucket = self.assignment.bucket_of(tuple.side, tuple_seq);
        let workers = self.assignment.workers_of(tuple.side, bucket);
        trace!(side = %tuple.side, seq = tuple_seq, bucket, ?workers, "routing tuple");

        for &worker in workers {
            let data = DataTuple {
                epoch: self.epoch,
                side: tuple.side,
                seq: tuple_seq,
                ingest_ms: tuple.ingest_ms,
                row: tuple.row.clone(),
            };
            self.topology.send_joiner(worker, JoinerMessage::Data(data))?;
        }

        self.routed_in_epoch += 1;
        if let Some(budget) = self.epoch_budget {
            if self.routed_in_epoch >= budget && !self.budget_requested {
                self.budget_requested = true;
                trace!(epoch = self.epoch, routed = self.routed_in_epoch, "epoch budget exhausted");
                self.topology
                    .deliver_synchronizer(SynchronizerMessage::BudgetExhausted { epoch: self.epoch })
                    .await?;
            }
        }

        Ok(())
    }

    async fn request_remap(&mut self, assignment: MatrixAssignment) -> Result<()> {
        if self.input_done || self.shutdown_sent {
            debug!("ignoring remap, input already finished");
            return Ok(());
        }
        // A closing epoch may already carry an advisor proposal, so the remap
        // waits until that mapping is installed and settled.
        if self.paused || self.migration.is_some() || self.remap_in_flight {
            debug!(dims = %assignment.dimensions_string(), "deferring remap until mapping settles");
            self.deferred_remaps.push_back(assignment);
            return Ok(());
        }

        info!(dims = %assignment.dimensions_string(), "requesting remap");
        self.remap_in_flight = true;
        self.topology
            .deliver_synchronizer(SynchronizerMessage::RemapRequest { assignment })
            .await
    }

    async fn on_close(&mut self, sig: EpochCloseSignal) -> Result<()> {
        if sig.epoch != self.epoch {
            return Err(FlowError::protocol("Close signal for unexpected epoch")
                .with_field("signal_epoch", sig.epoch)
                .with_field("epoch", self.epoch));
        }

        self.paused = true;
        for worker in 0..self.topology.num_joiners() {
            self.topology
                .deliver_joiner(worker, JoinerMessage::CloseSignal(sig))
                .await?;
        }

        let proposal = match sig.reason {
            CloseReason::Budget => self.advise(),
            CloseReason::Remap => None,
        };

        let ack = EpochCloseAck {
            epoch: sig.epoch,
            participant: Participant::Reshuffler,
            proposal,
        };
        self.topology
            .deliver_synchronizer(SynchronizerMessage::CloseAck(ack))
            .await
    }

    /// Suggest a better shape from the tuples seen so far.
    fn advise(&self) -> Option<MatrixAssignment> {
        if self.migration.is_some() || self.remap_in_flight || self.shutdown_sent {
            return None;
        }
        if self.left_seq == 0 || self.right_seq == 0 {
            return None;
        }

        let (left, right) = (self.left_seq as f64, self.right_seq as f64);
        let candidate = MatrixAssignment::compute(
            self.left_seq as i64,
            self.right_seq as i64,
            self.assignment.num_workers(),
        )
        .ok()?;

        if candidate.same_shape(&self.assignment) {
            return None;
        }

        let current_cost = self.assignment.input_cost(left, right);
        let candidate_cost = candidate.input_cost(left, right);
        if candidate_cost > current_cost * (1.0 - ADVISOR_MIN_IMPROVEMENT) {
            return None;
        }

        info!(
            from = %self.assignment.dimensions_string(),
            to = %candidate.dimensions_string(),
            current_cost,
            candidate_cost,
            "proposing new shape",
        );
        Some(candidate)
    }

    async fn on_mapping_update(&mut self, update: MappingUpdate) -> Result<()> {
        let version = update.version.clone();
        if version.epoch != self.epoch + 1 {
            return Err(FlowError::protocol("Mapping update skips an epoch")
                .with_field("update_epoch", version.epoch)
                .with_field("epoch", self.epoch));
        }

        for worker in 0..self.topology.num_joiners() {
            let update = MappingUpdate {
                version: version.clone(),
                consumed_remap: update.consumed_remap,
            };
            self.topology
                .deliver_joiner(worker, JoinerMessage::MappingUpdate(update))
                .await?;
        }

        let old = std::mem::replace(&mut self.assignment, version.assignment.clone());
        self.epoch = version.epoch;
        self.routed_in_epoch = 0;
        self.budget_requested = false;
        if update.consumed_remap {
            self.remap_in_flight = false;
        }

        if *old != *self.assignment {
            if self.migration.is_some() {
                return Err(FlowError::protocol(
                    "Assignment changed while a migration is outstanding",
                ));
            }
            self.start_migration(&old).await?;
        }

        self.paused = false;
        self.after_settle().await
    }

    async fn start_migration(&mut self, old: &MatrixAssignment) -> Result<()> {
        let plan = MigrationPlan::between(old, &self.assignment);
        self.remaps += 1;
        info!(
            epoch = self.epoch,
            kind = ?plan.kind(),
            from = %old.dimensions_string(),
            to = %self.assignment.dimensions_string(),
            "starting migration",
        );

        if plan.is_empty() {
            return Ok(());
        }

        let tracker = MigrationTracker::new(self.epoch, &plan);
        self.migration = Some(tracker);

        for (cell, from, to) in plan.requests() {
            debug!(epoch = self.epoch, %cell, from, to, "requesting migration");
            let req = MigrationRequest {
                epoch: self.epoch,
                cell,
                from,
                to,
            };
            self.topology
                .deliver_joiner(from, JoinerMessage::MigrationRequest(req))
                .await?;
        }

        Ok(())
    }

    async fn on_migration_ack(&mut self, ack: MigrationAck) -> Result<()> {
        let tracker = self.migration.as_mut().ok_or_else(|| {
            FlowError::protocol("Migration ack without an outstanding migration")
                .with_field("cell", ack.cell)
        })?;
        if ack.epoch != tracker.epoch {
            return Err(FlowError::protocol("Migration ack for unexpected epoch")
                .with_field("ack_epoch", ack.epoch)
                .with_field("epoch", tracker.epoch));
        }

        let epoch = tracker.epoch;
        let retire = tracker.ack(&ack)?;
        let settled = tracker.is_settled();

        for (cell, owner) in retire {
            trace!(%cell, owner, "retiring source cell");
            self.topology
                .deliver_joiner(owner, JoinerMessage::MigrationRetire(MigrationRetire { epoch, cell }))
                .await?;
        }

        if settled {
            info!(epoch, "mapping settled");
            self.migration = None;
            self.after_settle().await?;
        }

        Ok(())
    }

    /// Run work that waits for the mapping to settle.
    async fn after_settle(&mut self) -> Result<()> {
        if self.migration.is_some() || self.remap_in_flight {
            return Ok(());
        }
        if !self.input_done {
            if let Some(assignment) = self.deferred_remaps.pop_front() {
                return self.request_remap(assignment).await;
            }
        }
        self.maybe_shutdown().await
    }

    async fn maybe_shutdown(&mut self) -> Result<()> {
        if !self.input_done || self.shutdown_sent {
            return Ok(());
        }
        if self.migration.is_some() || self.remap_in_flight {
            return Ok(());
        }
        if !self.deferred_remaps.is_empty() {
            debug!(count = self.deferred_remaps.len(), "discarding deferred remaps");
            self.deferred_remaps.clear();
        }

        self.shutdown_sent = true;
        self.topology
            .deliver_synchronizer(SynchronizerMessage::Shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::matrix::MappingVersion;
    use crate::migration::MigrationPlan;
    use crate::row;
    use crate::topology::{Link, RetryPolicy};

    struct Harness {
        resh_tx: mpsc::UnboundedSender<ReshufflerMessage>,
        sync_rx: mpsc::UnboundedReceiver<SynchronizerMessage>,
        joiner_rxs: Vec<mpsc::UnboundedReceiver<JoinerMessage>>,
        input_tx: mpsc::Sender<SourceTuple>,
        abort: CancelHandle,
        handle: tokio::task::JoinHandle<Result<ReshufflerSummary>>,
    }

    fn start(initial: MatrixAssignment, epoch_budget: Option<u64>) -> Harness {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel::<SynchronizerMessage>();
        let (resh_tx, resh_rx) = mpsc::unbounded_channel::<ReshufflerMessage>();
        let (input_tx, input_rx) = mpsc::channel(1024);

        let mut joiners: Vec<Arc<dyn Link<JoinerMessage>>> = Vec::new();
        let mut joiner_rxs = Vec::new();
        for _ in 0..initial.num_workers() {
            let (tx, rx) = mpsc::unbounded_channel::<JoinerMessage>();
            joiners.push(Arc::new(tx));
            joiner_rxs.push(rx);
        }

        let retry = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        };
        let topology = Topology::new(Arc::new(sync_tx), Arc::new(resh_tx.clone()), joiners, retry);

        let (abort, token) = CancelHandle::new();
        let reshuffler = Reshuffler::new(
            MappingVersion::new(0, Arc::new(initial)),
            epoch_budget,
            topology,
            resh_rx,
            input_rx,
            token,
        );

        Harness {
            resh_tx,
            sync_rx,
            joiner_rxs,
            input_tx,
            abort: abort.clone(),
            handle: tokio::spawn(reshuffler.run(abort)),
        }
    }

    impl Harness {
        async fn send_input(&self, side: Side, count: usize) {
            for i in 0..count {
                let tuple = SourceTuple {
                    side,
                    ingest_ms: 0,
                    row: row![i as i64],
                };
                self.input_tx.send(tuple).await.unwrap();
            }
        }

        fn send(&self, msg: ReshufflerMessage) {
            self.resh_tx.send(msg).unwrap();
        }

        async fn next_sync(&mut self) -> SynchronizerMessage {
            self.sync_rx.recv().await.unwrap()
        }

        async fn close(&mut self, epoch: Epoch, reason: CloseReason) -> Option<MatrixAssignment> {
            self.send(ReshufflerMessage::CloseSignal(EpochCloseSignal { epoch, reason }));
            match self.next_sync().await {
                SynchronizerMessage::CloseAck(ack) => {
                    assert_eq!(epoch, ack.epoch);
                    assert_eq!(Participant::Reshuffler, ack.participant);
                    ack.proposal
                }
                other => panic!("expected close ack, got {other:?}"),
            }
        }

        fn install(&self, epoch: Epoch, assignment: &MatrixAssignment, consumed_remap: bool) {
            self.send(ReshufflerMessage::MappingUpdate(MappingUpdate {
                version: MappingVersion::new(epoch, Arc::new(assignment.clone())),
                consumed_remap,
            }));
        }

        fn ack_all(&self, epoch: Epoch, assignment: &MatrixAssignment) {
            for cell in assignment.cells() {
                self.send(ReshufflerMessage::MigrationAck(MigrationAck {
                    epoch,
                    cell,
                    worker: assignment.owner(cell),
                }));
            }
        }

        /// Wait until joiner 0 has seen the mapping for `epoch`.
        async fn wait_forwarded(&mut self, epoch: Epoch) {
            loop {
                match self.joiner_rxs[0].recv().await.unwrap() {
                    JoinerMessage::MappingUpdate(update) if update.version.epoch == epoch => return,
                    _ => (),
                }
            }
        }
    }

    #[tokio::test]
    async fn remap_during_closing_epoch_waits_for_proposal() {
        let initial = MatrixAssignment::compute(1, 1000, 4).unwrap();
        assert_eq!((1, 4), (initial.rows(), initial.cols()));
        let mut h = start(initial, Some(400));

        h.send_input(Side::Left, 390).await;
        h.send_input(Side::Right, 10).await;
        match h.next_sync().await {
            SynchronizerMessage::BudgetExhausted { epoch } => assert_eq!(0, epoch),
            other => panic!("expected budget exhausted, got {other:?}"),
        }

        let proposal = h.close(0, CloseReason::Budget).await.unwrap();
        assert_eq!((4, 1), (proposal.rows(), proposal.cols()));

        // Arrives while the epoch is still closing.
        let requested = MatrixAssignment::try_from_owners(1, 4, 4, vec![3, 2, 1, 0]).unwrap();
        h.send(ReshufflerMessage::Remap {
            assignment: requested.clone(),
        });
        h.install(1, &proposal, false);
        h.wait_forwarded(1).await;

        // Held back while the proposal's migration is outstanding.
        assert!(h.sync_rx.try_recv().is_err());

        h.ack_all(1, &proposal);
        match h.next_sync().await {
            SynchronizerMessage::RemapRequest { assignment } => assert_eq!(requested, assignment),
            other => panic!("expected remap request, got {other:?}"),
        }

        assert!(h.close(1, CloseReason::Remap).await.is_none());
        h.install(2, &requested, true);
        h.wait_forwarded(2).await;
        h.ack_all(2, &requested);

        drop(h.input_tx);
        match h.sync_rx.recv().await.unwrap() {
            SynchronizerMessage::Shutdown => (),
            other => panic!("expected shutdown, got {other:?}"),
        }
        h.resh_tx.send(ReshufflerMessage::Stop).unwrap();

        let summary = h.handle.await.unwrap().unwrap();
        assert_eq!(2, summary.remaps);
        assert_eq!(390, summary.left_routed);
        assert_eq!(10, summary.right_routed);
    }

    #[tokio::test]
    async fn unreachable_joiner_aborts() {
        let initial = MatrixAssignment::compute(100, 100, 4).unwrap();
        let mut h = start(initial, None);
        h.joiner_rxs.pop();

        h.send(ReshufflerMessage::CloseSignal(EpochCloseSignal {
            epoch: 0,
            reason: CloseReason::Remap,
        }));

        let err = h.handle.await.unwrap().unwrap_err();
        assert_eq!(ErrorKind::Delivery, err.kind());
        assert_eq!(Some("2"), err.get_field("attempts"));
        assert_eq!(RunState::Aborted, h.abort.state());
    }

    #[test]
    fn tracker_retires_sources_when_all_targets_acked() {
        let old = MatrixAssignment::compute(100, 100, 4).unwrap(); // 2x2
        let new = MatrixAssignment::compute(400, 1, 4).unwrap(); // 4x1
        let plan = MigrationPlan::between(&old, &new);
        let mut tracker = MigrationTracker::new(1, &plan);

        let cells: Vec<_> = new.cells().collect();
        for (idx, cell) in cells.iter().enumerate() {
            let ack = MigrationAck {
                epoch: 1,
                cell: *cell,
                worker: new.owner(*cell),
            };
            let retired = tracker.ack(&ack).unwrap();
            if idx + 1 < cells.len() {
                assert!(retired.is_empty());
                assert!(!tracker.is_settled());
            } else {
                assert_eq!(3, retired.len());
                assert!(tracker.is_settled());
            }
        }

        let again = MigrationAck {
            epoch: 1,
            cell: cells[0],
            worker: 0,
        };
        tracker.ack(&again).unwrap_err();
    }

    #[test]
    fn tracker_reassign() {
        let old = MatrixAssignment::try_from_owners(2, 2, 4, vec![0, 1, 2, 3]).unwrap();
        let new = MatrixAssignment::try_from_owners(2, 2, 4, vec![1, 0, 2, 3]).unwrap();
        let plan = MigrationPlan::between(&old, &new);
        let mut tracker = MigrationTracker::new(1, &plan);

        let retired = tracker
            .ack(&MigrationAck {
                epoch: 1,
                cell: Cell::new(0, 0),
                worker: 1,
            })
            .unwrap();
        assert_eq!(vec![(Cell::new(0, 0), 0)], retired);
        assert!(!tracker.is_settled());
    }
}
