//! Deploying a join.
//!
//! A deployed join runs one synchronizer, one reshuffler and one joiner per
//! worker slot as tokio tasks, wired together through a [`Topology`]. Slots
//! beyond the initial parallelism stay idle until a remap hands them cells.
//! The caller interacts with it through the handles in [`DeployedJoin`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures::future::join_all;
use thetaflow_error::{ErrorKind, FlowError, Result, ResultExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelHandle, RunState};
use crate::clock::now_ms;
use crate::config::JoinConfig;
use crate::fault::{FaultSink, LoggingFaultSink};
use crate::joiner::cell::SpillContext;
use crate::joiner::{JoinContext, Joiner, JoinerSummary};
use crate::matrix::{MappingVersion, MatrixAssignment};
use crate::message::{JoinerMessage, MatchOutput, ReshufflerMessage, SourceTuple};
use crate::operator::{Operator, OperatorChain};
use crate::predicate::JoinPredicate;
use crate::reshuffler::{Reshuffler, ReshufflerSummary};
use crate::row::{Row, Side};
use crate::synchronizer::{EpochSynchronizer, SynchronizerSummary};
use crate::topology::{Link, RetryPolicy, Topology};

/// A join ready to be deployed.
#[derive(Debug)]
pub struct ThetaJoin {
    config: JoinConfig,
    predicate: Arc<dyn JoinPredicate>,
    operators: OperatorChain,
    faults: Arc<dyn FaultSink>,
}

impl ThetaJoin {
    pub fn new(config: JoinConfig, predicate: impl JoinPredicate + 'static) -> Self {
        ThetaJoin {
            config,
            predicate: Arc::new(predicate),
            operators: OperatorChain::new(),
            faults: Arc::new(LoggingFaultSink::default()),
        }
    }

    /// Append an operator to the chain applied to every joined row.
    pub fn with_operator(mut self, op: impl Operator + 'static) -> Self {
        self.operators.push(op);
        self
    }

    pub fn with_operators(mut self, operators: OperatorChain) -> Self {
        self.operators = operators;
        self
    }

    pub fn with_fault_sink(mut self, faults: Arc<dyn FaultSink>) -> Self {
        self.faults = faults;
        self
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    /// Deploy using an assignment computed from cardinality estimates.
    ///
    /// Must be called from within a tokio runtime.
    pub fn deploy(self, left_cardinality: i64, right_cardinality: i64) -> Result<DeployedJoin> {
        let assignment = MatrixAssignment::compute(
            left_cardinality,
            right_cardinality,
            self.config.joiner_parallelism,
        )?;
        self.deploy_with_assignment(assignment)
    }

    pub fn deploy_with_assignment(self, assignment: MatrixAssignment) -> Result<DeployedJoin> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("Deploying a join requires a tokio runtime")?;

        let workers = self.config.joiner_parallelism;
        if assignment.num_workers() != workers {
            return Err(FlowError::configuration(
                "Assignment worker count does not match joiner parallelism",
            )
            .with_field("assignment", assignment.num_workers())
            .with_field("parallelism", workers));
        }
        let slots = self.config.joiner_slots();
        if self.config.spill_threshold > 0 && self.predicate.key_datatype().is_none() {
            warn!("predicate has no key type, tuples will not be spilled");
        }

        let id = Uuid::new_v4();
        let dims = assignment.dimensions_string();
        let initial = MappingVersion::new(0, Arc::new(assignment));

        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (resh_tx, resh_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::channel(self.config.input_capacity);
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let mut joiner_links: Vec<Arc<dyn Link<JoinerMessage>>> = Vec::with_capacity(slots);
        let mut joiner_inboxes = Vec::with_capacity(slots);
        for _ in 0..slots {
            let (tx, rx) = mpsc::unbounded_channel();
            joiner_links.push(Arc::new(tx));
            joiner_inboxes.push(rx);
        }

        let retry = RetryPolicy {
            attempts: self.config.delivery_attempts,
            backoff: self.config.delivery_backoff(),
        };
        let topology = Topology::new(
            Arc::new(sync_tx),
            Arc::new(resh_tx.clone()),
            joiner_links,
            retry,
        );

        let (cancel, token) = CancelHandle::new();

        let synchronizer = EpochSynchronizer::new(
            initial.clone(),
            self.config.epoch_interval(),
            topology.clone(),
            sync_rx,
            token.clone(),
        );
        let sync_handle = runtime.spawn(synchronizer.run(cancel.clone()));

        let epoch_budget = (self.config.epoch_tuples > 0).then_some(self.config.epoch_tuples);
        let reshuffler = Reshuffler::new(
            initial.clone(),
            epoch_budget,
            topology.clone(),
            resh_rx,
            input_rx,
            token.clone(),
        );
        let resh_handle = runtime.spawn(reshuffler.run(cancel.clone()));

        let key_type = self.predicate.key_datatype();
        let joiner_handles: Vec<_> = joiner_inboxes
            .into_iter()
            .enumerate()
            .map(|(worker, inbox)| {
                let spill = SpillContext {
                    worker,
                    threshold: self.config.spill_threshold,
                    dispersion: self.config.dispersion,
                    location: self.config.spill_location.clone(),
                    key_type,
                };
                let ctx = JoinContext::new(
                    worker,
                    self.predicate.clone(),
                    self.operators.clone(),
                    self.config.window,
                    spill,
                    self.faults.clone(),
                    output_tx.clone(),
                    self.config.batch_output_interval(),
                );
                let joiner = Joiner::new(initial.clone(), ctx, topology.clone(), inbox, token.clone());
                runtime.spawn(joiner.run(cancel.clone()))
            })
            .collect();
        drop(output_tx);

        let (done_tx, done_rx) = oneshot::channel();
        runtime.spawn({
            let cancel = cancel.clone();
            async move {
                let result = supervise(sync_handle, resh_handle, joiner_handles, &cancel).await;
                match &result {
                    Ok(summary) => info!(
                        %id,
                        status = ?summary.status,
                        matches = summary.matches,
                        faults = summary.faults,
                        "join finished",
                    ),
                    Err(e) => warn!(%id, %e, "join failed"),
                }
                let _ = done_tx.send(result);
            }
        });

        info!(%id, workers, slots, %dims, "deployed join");

        Ok(DeployedJoin {
            id,
            input: JoinInput { tx: input_tx },
            output: JoinOutput { rx: output_rx },
            control: JoinControl {
                reshuffler: resh_tx,
                cancel,
                workers,
                slots,
            },
            completion: JoinCompletion { rx: done_rx },
        })
    }
}

async fn supervise(
    sync: JoinHandle<Result<SynchronizerSummary>>,
    resh: JoinHandle<Result<ReshufflerSummary>>,
    joiners: Vec<JoinHandle<Result<JoinerSummary>>>,
    cancel: &CancelHandle,
) -> Result<JoinSummary> {
    let joiners: Vec<Result<JoinerSummary>> = join_all(joiners)
        .await
        .into_iter()
        .map(|r| r.context("Joiner task failed").and_then(|r| r))
        .collect();
    let resh = resh.await.context("Reshuffler task failed").and_then(|r| r);
    let sync = sync.await.context("Synchronizer task failed").and_then(|r| r);

    // Report the root cause, joiner failures are reported to the reshuffler
    // which fails in turn.
    let first_err = joiners
        .iter()
        .filter_map(|r| r.as_ref().err())
        .chain(resh.as_ref().err())
        .chain(sync.as_ref().err())
        .position(|e| e.kind() != ErrorKind::Canceled);

    if first_err.is_some() || cancel.state() == RunState::Aborted {
        let mut errors = joiners
            .into_iter()
            .filter_map(|r| r.err())
            .chain(resh.err())
            .chain(sync.err());
        let err = match first_err {
            Some(idx) => errors.nth(idx),
            None => errors.next(),
        };
        return Err(err.unwrap_or_else(|| FlowError::canceled("Join aborted")));
    }

    let workers = joiners.into_iter().collect::<Result<Vec<_>>>()?;
    let status = match cancel.state() {
        RunState::Cancelled => JoinStatus::Cancelled,
        _ => JoinStatus::Completed,
    };
    let (resh, sync) = match (resh, sync) {
        (Ok(resh), Ok(sync)) => (resh, sync),
        (Err(e), _) | (_, Err(e)) => return Err(e),
    };

    Ok(JoinSummary {
        status,
        matches: workers.iter().map(|w| w.matches).sum(),
        faults: workers.iter().map(|w| w.faults).sum(),
        spilled: workers.iter().map(|w| w.spilled).sum(),
        left_tuples: resh.left_routed,
        right_tuples: resh.right_routed,
        remaps: resh.remaps,
        epochs: sync.epoch + 1,
        workers,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct JoinSummary {
    pub status: JoinStatus,
    pub matches: u64,
    pub faults: u64,
    pub spilled: u64,
    pub left_tuples: u64,
    pub right_tuples: u64,
    pub remaps: u64,
    /// Number of epochs opened, including the initial one.
    pub epochs: u64,
    pub workers: Vec<JoinerSummary>,
}

#[derive(Debug)]
pub struct DeployedJoin {
    pub id: Uuid,
    pub input: JoinInput,
    pub output: JoinOutput,
    pub control: JoinControl,
    pub completion: JoinCompletion,
}

/// Feeds tuples into the join. Dropping or finishing it ends the input.
#[derive(Debug, Clone)]
pub struct JoinInput {
    tx: mpsc::Sender<SourceTuple>,
}

impl JoinInput {
    /// Send a tuple stamped with the current time.
    pub async fn send(&self, side: Side, row: Row) -> Result<()> {
        self.send_at(side, row, now_ms()).await
    }

    /// Send a tuple with an explicit ingest time in milliseconds.
    pub async fn send_at(&self, side: Side, row: Row, ingest_ms: u64) -> Result<()> {
        let tuple = SourceTuple {
            side,
            ingest_ms,
            row,
        };
        self.tx
            .send(tuple)
            .await
            .map_err(|_| FlowError::delivery("Join is no longer accepting input"))
    }

    /// Drop this handle. Input ends once every clone is gone.
    pub fn finish(self) {
        debug!("finishing join input");
    }
}

/// Matches produced by the join. Ends once every joiner stopped.
#[derive(Debug)]
pub struct JoinOutput {
    rx: mpsc::UnboundedReceiver<MatchOutput>,
}

impl JoinOutput {
    pub async fn recv(&mut self) -> Option<MatchOutput> {
        self.rx.recv().await
    }

    /// Read matches until the output ends.
    pub async fn collect_all(mut self) -> Vec<MatchOutput> {
        let mut out = Vec::new();
        while let Some(m) = self.rx.recv().await {
            out.push(m);
        }
        out
    }
}

impl Stream for JoinOutput {
    type Item = MatchOutput;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone)]
pub struct JoinControl {
    reshuffler: mpsc::UnboundedSender<ReshufflerMessage>,
    cancel: CancelHandle,
    workers: usize,
    slots: usize,
}

impl JoinControl {
    /// Request a new assignment, applied at the next epoch boundary once any
    /// previous migration settled.
    ///
    /// The assignment may use any number of workers up to the deployed
    /// joiner slots.
    pub fn remap(&self, assignment: MatrixAssignment) -> Result<()> {
        if assignment.num_workers() > self.slots {
            return Err(FlowError::configuration(
                "Remap uses more workers than deployed joiner slots",
            )
            .with_field("slots", self.slots)
            .with_field("requested", assignment.num_workers()));
        }
        self.reshuffler
            .send(ReshufflerMessage::Remap { assignment })
            .map_err(|_| FlowError::delivery("Join already finished"))
    }

    /// Request an assignment computed for new cardinality estimates.
    pub fn remap_for(&self, left_cardinality: i64, right_cardinality: i64) -> Result<()> {
        let assignment =
            MatrixAssignment::compute(left_cardinality, right_cardinality, self.workers)?;
        self.remap(assignment)
    }

    /// Request an assignment over a different number of workers.
    pub fn rescale(&self, workers: usize, left_cardinality: i64, right_cardinality: i64) -> Result<()> {
        let assignment = MatrixAssignment::compute(left_cardinality, right_cardinality, workers)?;
        self.remap(assignment)
    }

    pub fn cancel(&self) {
        info!("canceling join");
        self.cancel.cancel();
    }

    /// Workers of the initial assignment.
    pub fn num_workers(&self) -> usize {
        self.workers
    }

    pub fn max_workers(&self) -> usize {
        self.slots
    }
}

#[derive(Debug)]
pub struct JoinCompletion {
    rx: oneshot::Receiver<Result<JoinSummary>>,
}

impl JoinCompletion {
    pub async fn wait(self) -> Result<JoinSummary> {
        self.rx
            .await
            .map_err(|_| FlowError::new("Join supervisor dropped without a result"))?
    }
}
