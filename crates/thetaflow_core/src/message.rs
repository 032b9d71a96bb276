//! Messages exchanged between the synchronizer, the reshuffler and joiners.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::matrix::{Cell, Epoch, MappingVersion, MatrixAssignment, WorkerId};
use crate::row::{Row, Side};

/// Addressable participant of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Participant {
    Synchronizer,
    Reshuffler,
    Joiner(WorkerId),
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synchronizer => write!(f, "synchronizer"),
            Self::Reshuffler => write!(f, "reshuffler"),
            Self::Joiner(id) => write!(f, "joiner-{id}"),
        }
    }
}

/// A tuple as it sits in a joiner's buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedTuple {
    pub seq: u64,
    pub ingest_ms: u64,
    pub row: Row,
}

/// Buffered tuples of a single cell, moved between joiners on migration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedState {
    pub left: Vec<BufferedTuple>,
    pub right: Vec<BufferedTuple>,
}

impl BufferedState {
    pub fn side(&self, side: Side) -> &[BufferedTuple] {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut Vec<BufferedTuple> {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    pub fn len(&self) -> usize {
        self.left.len() + self.right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }
}

/// A tuple pushed into the join by the source.
#[derive(Debug, Clone)]
pub struct SourceTuple {
    pub side: Side,
    pub ingest_ms: u64,
    pub row: Row,
}

/// A tuple routed by the reshuffler to a joiner.
#[derive(Debug, Clone)]
pub struct DataTuple {
    pub epoch: Epoch,
    pub side: Side,
    pub seq: u64,
    pub ingest_ms: u64,
    pub row: Row,
}

impl DataTuple {
    pub fn into_buffered(self) -> BufferedTuple {
        BufferedTuple {
            seq: self.seq,
            ingest_ms: self.ingest_ms,
            row: self.row,
        }
    }
}

/// Why an epoch is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Tuple or time budget exhausted.
    Budget,
    /// Explicit remap request.
    Remap,
}

#[derive(Debug, Clone, Copy)]
pub struct EpochCloseSignal {
    pub epoch: Epoch,
    pub reason: CloseReason,
}

#[derive(Debug, Clone)]
pub struct EpochCloseAck {
    pub epoch: Epoch,
    pub participant: Participant,
    /// Assignment suggested by the reshuffler for the next epoch.
    pub proposal: Option<MatrixAssignment>,
}

#[derive(Debug, Clone)]
pub struct MappingUpdate {
    pub version: MappingVersion,
    /// Set when this update consumed an explicit remap request.
    pub consumed_remap: bool,
}

/// Ask the owner of `cell` to export it to the new owners on worker `to`.
#[derive(Debug, Clone, Copy)]
pub struct MigrationRequest {
    pub epoch: Epoch,
    pub cell: Cell,
    pub from: WorkerId,
    pub to: WorkerId,
}

#[derive(Debug, Clone)]
pub struct MigrationPayload {
    pub epoch: Epoch,
    pub target: Cell,
    pub source: Cell,
    pub state: BufferedState,
}

/// A cell received every payload it was waiting for.
#[derive(Debug, Clone, Copy)]
pub struct MigrationAck {
    pub epoch: Epoch,
    pub cell: Cell,
    pub worker: WorkerId,
}

/// All targets fed by a source cell have acked, the source may drop it.
#[derive(Debug, Clone, Copy)]
pub struct MigrationRetire {
    pub epoch: Epoch,
    pub cell: Cell,
}

/// A joined pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutput {
    pub left: Row,
    pub right: Row,
    /// Joined row after the operator chain.
    pub row: Row,
}

#[derive(Debug)]
pub enum SynchronizerMessage {
    /// Close the current epoch, installing the given assignment next.
    RemapRequest { assignment: MatrixAssignment },
    /// The reshuffler routed the tuple budget for the epoch.
    BudgetExhausted { epoch: Epoch },
    CloseAck(EpochCloseAck),
    /// Input is exhausted and the mapping settled.
    Shutdown,
}

#[derive(Debug)]
pub enum ReshufflerMessage {
    Remap { assignment: MatrixAssignment },
    CloseSignal(EpochCloseSignal),
    MappingUpdate(MappingUpdate),
    MigrationAck(MigrationAck),
    /// The synchronizer stopped, no further epochs will be opened.
    Stop,
    WorkerFailed { worker: WorkerId, error: String },
}

#[derive(Debug)]
pub enum JoinerMessage {
    Data(DataTuple),
    CloseSignal(EpochCloseSignal),
    MappingUpdate(MappingUpdate),
    MigrationRequest(MigrationRequest),
    MigrationPayload(MigrationPayload),
    MigrationRetire(MigrationRetire),
    /// No more messages will follow.
    Finish,
}

impl JoinerMessage {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::CloseSignal(_) => "close_signal",
            Self::MappingUpdate(_) => "mapping_update",
            Self::MigrationRequest(_) => "migration_request",
            Self::MigrationPayload(_) => "migration_payload",
            Self::MigrationRetire(_) => "migration_retire",
            Self::Finish => "finish",
        }
    }
}
