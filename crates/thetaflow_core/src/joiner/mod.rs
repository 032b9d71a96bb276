//! Stateful join workers.
//!
//! A joiner owns a set of matrix cells. For every tuple it receives it scans
//! the opposite side of each matching cell, emits the matches, then buffers
//! the tuple. Buffers live as long as the cell so no pairing is missed
//! regardless of how the two sides interleave.

pub mod cell;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thetaflow_error::{ErrorKind, FlowError, OptionExt, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use self::cell::{CellPhase, CellState, SpillContext};
use crate::cancel::{CancelHandle, CancelToken, RunState};
use crate::clock::{delayed_interval, tick};
use crate::fault::{FaultSink, PredicateFault};
use crate::matrix::{Cell, Epoch, MappingVersion, MatrixAssignment, WorkerId};
use crate::message::{
    BufferedState, BufferedTuple, DataTuple, EpochCloseAck, EpochCloseSignal, JoinerMessage,
    MappingUpdate, MatchOutput, MigrationAck, MigrationPayload, MigrationRequest, MigrationRetire,
    Participant, ReshufflerMessage, SynchronizerMessage,
};
use crate::migration::{MigrationKind, MigrationPlan, payload_for};
use crate::operator::OperatorChain;
use crate::predicate::{FULL_SCAN, JoinPredicate};
use crate::row::{Row, Side};
use crate::topology::Topology;
use crate::window::JoinWindow;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinerSummary {
    pub worker: WorkerId,
    pub matches: u64,
    pub faults: u64,
    pub spilled: u64,
    pub imported: u64,
    pub exported: u64,
}

/// Everything a cell needs to evaluate and emit pairs.
#[derive(Debug)]
pub struct JoinContext {
    pub worker: WorkerId,
    pub predicate: Arc<dyn JoinPredicate>,
    pub operators: OperatorChain,
    pub window: JoinWindow,
    pub spill: SpillContext,
    pub faults: Arc<dyn FaultSink>,
    output: mpsc::UnboundedSender<MatchOutput>,
    output_closed: bool,
    batched: Vec<MatchOutput>,
    batch_interval: Option<Duration>,
    summary: JoinerSummary,
}

impl JoinContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker: WorkerId,
        predicate: Arc<dyn JoinPredicate>,
        operators: OperatorChain,
        window: JoinWindow,
        spill: SpillContext,
        faults: Arc<dyn FaultSink>,
        output: mpsc::UnboundedSender<MatchOutput>,
        batch_interval: Option<Duration>,
    ) -> Self {
        JoinContext {
            worker,
            predicate,
            operators,
            window,
            spill,
            faults,
            output,
            output_closed: false,
            batched: Vec::new(),
            batch_interval,
            summary: JoinerSummary {
                worker,
                ..Default::default()
            },
        }
    }

    /// Match a tuple against the opposite side of a cell, then buffer it.
    fn match_and_insert(&mut self, state: &mut CellState, side: Side, tuple: BufferedTuple) -> Result<()> {
        let cell = state.cell;
        let bounds = self
            .predicate
            .key_range(side, &tuple.row)
            .unwrap_or(FULL_SCAN);

        state
            .buffer_mut(side.opposite())
            .for_each_candidate(&bounds, |stored| self.evaluate(cell, side, &tuple, stored))?;

        self.insert(state, side, tuple)
    }

    /// Buffer a tuple without probing.
    fn insert(&mut self, state: &mut CellState, side: Side, tuple: BufferedTuple) -> Result<()> {
        let key = if self.spill.enabled() {
            // Tuples we can't key stay in memory, the predicate reports the
            // problem when probing.
            self.predicate.index_key(side, &tuple.row).ok().flatten()
        } else {
            None
        };

        let cell = state.cell;
        let spilled = state.buffer_mut(side).push(cell, tuple, key, &self.spill)?;
        self.summary.spilled += spilled as u64;
        Ok(())
    }

    fn evaluate(&mut self, cell: Cell, incoming_side: Side, incoming: &BufferedTuple, stored: &BufferedTuple) {
        let (left, right) = match incoming_side {
            Side::Left => (incoming, stored),
            Side::Right => (stored, incoming),
        };

        if !self.window.admits(left.ingest_ms, right.ingest_ms) {
            return;
        }

        let result = self.predicate.matches(&left.row, &right.row).and_then(|matched| {
            if matched {
                self.operators.apply(Row::concat(&left.row, &right.row))
            } else {
                Ok(None)
            }
        });

        match result {
            Ok(Some(row)) => self.emit(MatchOutput {
                left: left.row.clone(),
                right: right.row.clone(),
                row,
            }),
            Ok(None) => (),
            Err(error) => {
                self.summary.faults += 1;
                self.faults.record(PredicateFault {
                    worker: self.worker,
                    cell,
                    left_seq: left.seq,
                    right_seq: right.seq,
                    error,
                });
            }
        }
    }

    fn emit(&mut self, output: MatchOutput) {
        self.summary.matches += 1;
        self.batched.push(output);
        if self.batch_interval.is_none() {
            self.flush_output();
        }
    }

    fn flush_output(&mut self) {
        if self.batched.is_empty() {
            return;
        }
        trace!(worker = self.worker, count = self.batched.len(), "flushing matches");

        for output in self.batched.drain(..) {
            if self.output_closed {
                continue;
            }
            if self.output.send(output).is_err() {
                debug!(worker = self.worker, "output receiver dropped, discarding matches");
                self.output_closed = true;
            }
        }
    }
}

#[derive(Debug)]
pub struct Joiner {
    id: WorkerId,
    epoch: Epoch,
    /// Epoch the current assignment was installed in.
    assignment_epoch: Epoch,
    assignment: Arc<MatrixAssignment>,
    plan: Option<MigrationPlan>,
    /// Cells of the current assignment owned by this joiner.
    cells: BTreeMap<Cell, CellState>,
    /// Cells of the previous assignment waiting to be retired.
    exporting: BTreeMap<Cell, CellState>,
    ctx: JoinContext,
    topology: Topology,
    inbound: mpsc::UnboundedReceiver<JoinerMessage>,
    cancel: CancelToken,
}

impl Joiner {
    pub fn new(
        initial: MappingVersion,
        ctx: JoinContext,
        topology: Topology,
        inbound: mpsc::UnboundedReceiver<JoinerMessage>,
        cancel: CancelToken,
    ) -> Self {
        let id = ctx.worker;
        let cells = initial
            .assignment
            .cells_of(id)
            .iter()
            .map(|&cell| (cell, CellState::new(cell)))
            .collect();

        Joiner {
            id,
            epoch: initial.epoch,
            assignment_epoch: initial.epoch,
            assignment: initial.assignment,
            plan: None,
            cells,
            exporting: BTreeMap::new(),
            ctx,
            topology,
            inbound,
            cancel,
        }
    }

    /// Run until finished. Fatal errors are reported to the reshuffler.
    pub async fn run(self, abort: CancelHandle) -> Result<JoinerSummary> {
        let id = self.id;
        let topology = self.topology.clone();

        let result = self.start().await;
        if let Err(e) = &result {
            if e.kind() != ErrorKind::Canceled {
                error!(worker = id, %e, "joiner failed");
                let report = ReshufflerMessage::WorkerFailed {
                    worker: id,
                    error: e.to_string(),
                };
                if topology.deliver_reshuffler(report).await.is_err() {
                    abort.abort();
                }
            }
        }
        result
    }

    async fn start(mut self) -> Result<JoinerSummary> {
        debug!(worker = self.id, cells = self.cells.len(), "starting joiner");

        let mut ticker = delayed_interval(self.ctx.batch_interval);
        let mut cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;

                state = cancel.stopped() => {
                    self.ctx.flush_output();
                    self.flush_stores()?;
                    debug!(worker = self.id, ?state, "joiner stopping");
                    return match state {
                        RunState::Aborted => Err(CancelToken::stop_error(state)),
                        _ => Ok(self.ctx.summary),
                    };
                }
                msg = self.inbound.recv() => {
                    match msg {
                        Some(JoinerMessage::Finish) | None => break,
                        Some(msg) => self.handle_msg(msg).await?,
                    }
                }
                _ = tick(&mut ticker) => self.ctx.flush_output(),
            }
        }

        self.finish()
    }

    fn finish(mut self) -> Result<JoinerSummary> {
        if let Some(cell) = self.cells.values().find(|c| !c.is_active()) {
            return Err(FlowError::protocol("Finished while a cell is still migrating")
                .with_field("worker", self.id)
                .with_field("cell", cell.cell));
        }

        self.ctx.flush_output();
        self.flush_stores()?;

        let summary = self.ctx.summary;
        info!(
            worker = self.id,
            matches = summary.matches,
            faults = summary.faults,
            spilled = summary.spilled,
            "joiner finished",
        );
        Ok(summary)
    }

    fn flush_stores(&mut self) -> Result<()> {
        self.cells.values_mut().try_for_each(|c| c.flush())
    }

    async fn handle_msg(&mut self, msg: JoinerMessage) -> Result<()> {
        match msg {
            JoinerMessage::Data(tuple) => self.on_tuple(tuple),
            JoinerMessage::CloseSignal(sig) => self.on_close(sig).await,
            JoinerMessage::MappingUpdate(update) => self.on_mapping_update(update),
            JoinerMessage::MigrationRequest(req) => self.on_migration_request(req).await,
            JoinerMessage::MigrationPayload(payload) => self.on_migration_payload(payload).await,
            JoinerMessage::MigrationRetire(retire) => self.on_retire(retire),
            JoinerMessage::Finish => Ok(()),
        }
    }

    fn on_tuple(&mut self, tuple: DataTuple) -> Result<()> {
        if tuple.epoch != self.epoch {
            return Err(FlowError::protocol("Tuple from unexpected epoch")
                .with_field("worker", self.id)
                .with_field("tuple_epoch", tuple.epoch)
                .with_field("epoch", self.epoch));
        }

        let side = tuple.side;
        let bucket = self.assignment.bucket_of(side, tuple.seq);
        let targets: Vec<Cell> = self
            .assignment
            .cells_of(self.id)
            .iter()
            .filter(|c| c.bucket(side) == bucket)
            .copied()
            .collect();

        if targets.is_empty() {
            return Err(FlowError::protocol("Tuple routed to a joiner owning none of its cells")
                .with_field("worker", self.id)
                .with_field("side", side)
                .with_field("bucket", bucket));
        }

        for cell in targets {
            let state = self
                .cells
                .get_mut(&cell)
                .required("state for owned cell")?;

            if let CellPhase::MigratingIn { deferred, .. } = &mut state.phase {
                deferred.push(tuple.clone());
                continue;
            }
            if !state.is_active() {
                return Err(FlowError::protocol("Tuple for a cell being exported")
                    .with_field("worker", self.id)
                    .with_field("cell", cell));
            }
            self.ctx
                .match_and_insert(state, side, tuple.clone().into_buffered())?;
        }

        Ok(())
    }

    async fn on_close(&mut self, sig: EpochCloseSignal) -> Result<()> {
        if sig.epoch != self.epoch {
            return Err(FlowError::protocol("Close signal for unexpected epoch")
                .with_field("worker", self.id)
                .with_field("signal_epoch", sig.epoch)
                .with_field("epoch", self.epoch));
        }

        self.ctx.flush_output();
        self.flush_stores()?;

        trace!(worker = self.id, epoch = self.epoch, "acking epoch close");
        let ack = EpochCloseAck {
            epoch: sig.epoch,
            participant: Participant::Joiner(self.id),
            proposal: None,
        };
        self.topology
            .deliver_synchronizer(SynchronizerMessage::CloseAck(ack))
            .await
    }

    fn on_mapping_update(&mut self, update: MappingUpdate) -> Result<()> {
        let version = update.version;
        if version.epoch != self.epoch + 1 {
            return Err(FlowError::protocol("Mapping update skips an epoch")
                .with_field("worker", self.id)
                .with_field("update_epoch", version.epoch)
                .with_field("epoch", self.epoch));
        }
        self.epoch = version.epoch;

        if *version.assignment == *self.assignment {
            return Ok(());
        }
        if !self.exporting.is_empty() {
            return Err(FlowError::protocol("New assignment before previous migration retired")
                .with_field("worker", self.id));
        }

        let new = version.assignment;
        let plan = MigrationPlan::between(&self.assignment, &new);
        debug!(
            worker = self.id,
            epoch = self.epoch,
            kind = ?plan.kind(),
            "applying new assignment",
        );

        for (cell, mut state) in std::mem::take(&mut self.cells) {
            if let Some(sides) = plan.export_sides(cell) {
                state.export_state(sides)?;
                self.exporting.insert(cell, state);
            } else if plan.kind() != MigrationKind::Repartition {
                // Same shape, ownership unchanged.
                self.cells.insert(cell, state);
            } else {
                trace!(worker = self.id, %cell, "dropping cell");
            }
        }

        for &cell in new.cells_of(self.id) {
            if self.cells.contains_key(&cell) {
                continue;
            }
            let state = match plan.expected_payloads(cell) {
                Some(payloads) => CellState::migrating_in(cell, payloads),
                None => CellState::new(cell),
            };
            self.cells.insert(cell, state);
        }

        self.assignment = new;
        self.assignment_epoch = self.epoch;
        self.plan = Some(plan);

        Ok(())
    }

    async fn on_migration_request(&mut self, req: MigrationRequest) -> Result<()> {
        if req.epoch != self.assignment_epoch || req.from != self.id {
            return Err(FlowError::protocol("Unexpected migration request")
                .with_field("worker", self.id)
                .with_field("cell", req.cell)
                .with_field("request_epoch", req.epoch));
        }

        let plan = self.plan.as_ref().required("migration plan")?;
        let source = self.exporting.get(&req.cell).required("exporting cell")?;
        let CellPhase::MigratingOut { sides, state } = &source.phase else {
            return Err(FlowError::protocol("Migration requested for a cell not being exported")
                .with_field("cell", req.cell));
        };

        let payloads: Vec<_> = plan
            .targets_on(req.cell, req.to)
            .map(|target| MigrationPayload {
                epoch: req.epoch,
                target,
                source: req.cell,
                state: payload_for(state, *sides, &self.assignment, target),
            })
            .collect();

        for payload in payloads {
            debug!(
                worker = self.id,
                source = %payload.source,
                target = %payload.target,
                to = req.to,
                tuples = payload.state.len(),
                "sending migration payload",
            );
            self.ctx.summary.exported += payload.state.len() as u64;
            self.topology
                .deliver_joiner(req.to, JoinerMessage::MigrationPayload(payload))
                .await?;
        }

        Ok(())
    }

    async fn on_migration_payload(&mut self, payload: MigrationPayload) -> Result<()> {
        if payload.epoch != self.assignment_epoch {
            return Err(FlowError::protocol("Migration payload for unexpected epoch")
                .with_field("worker", self.id)
                .with_field("payload_epoch", payload.epoch)
                .with_field("epoch", self.assignment_epoch));
        }

        let cell = payload.target;
        let state = self.cells.get_mut(&cell).required("target cell")?;
        let remaining = match &mut state.phase {
            CellPhase::MigratingIn { remaining, .. } if *remaining > 0 => remaining,
            _ => {
                return Err(FlowError::protocol("Unexpected migration payload")
                    .with_field("worker", self.id)
                    .with_field("cell", cell)
                    .with_field("source", payload.source));
            }
        };
        *remaining -= 1;
        let done = *remaining == 0;

        let BufferedState { left, right } = payload.state;
        self.ctx.summary.imported += (left.len() + right.len()) as u64;
        for tuple in left {
            self.ctx.insert(state, Side::Left, tuple)?;
        }
        for tuple in right {
            self.ctx.insert(state, Side::Right, tuple)?;
        }

        if !done {
            return Ok(());
        }

        let phase = std::mem::replace(&mut state.phase, CellPhase::Active);
        if let CellPhase::MigratingIn { deferred, .. } = phase {
            trace!(worker = self.id, %cell, deferred = deferred.len(), "replaying deferred tuples");
            for tuple in deferred {
                let side = tuple.side;
                self.ctx.match_and_insert(state, side, tuple.into_buffered())?;
            }
        }

        debug!(worker = self.id, %cell, "cell migrated in");
        let ack = MigrationAck {
            epoch: self.assignment_epoch,
            cell,
            worker: self.id,
        };
        self.topology
            .deliver_reshuffler(ReshufflerMessage::MigrationAck(ack))
            .await
    }

    fn on_retire(&mut self, retire: MigrationRetire) -> Result<()> {
        if retire.epoch != self.assignment_epoch || self.exporting.remove(&retire.cell).is_none() {
            return Err(FlowError::protocol("Unexpected retire")
                .with_field("worker", self.id)
                .with_field("cell", retire.cell)
                .with_field("retire_epoch", retire.epoch));
        }
        trace!(worker = self.id, cell = %retire.cell, "retired cell");
        Ok(())
    }
}
