//! State movement between two assignments.
//!
//! When only ownership changes, a cell keeps its meaning and moves whole to
//! its new owner. When the shape changes, every cell's meaning changes:
//! each left tuple lives in every cell of its old row, so it's exported once
//! from column 0, and each right tuple once from row 0. Every new cell then
//! receives one payload from each of those sources and never matches what it
//! imports, so every pair stays joined exactly once.

use std::collections::{BTreeMap, BTreeSet};

use crate::matrix::{Cell, MatrixAssignment, WorkerId};
use crate::message::{BufferedState, BufferedTuple};
use crate::row::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    Unchanged,
    /// Same shape, some cells change owner.
    Reassign,
    /// Shape changed, all state is redistributed.
    Repartition,
}

/// Which sides of a source cell are exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSides {
    pub left: bool,
    pub right: bool,
}

impl ExportSides {
    pub const BOTH: ExportSides = ExportSides {
        left: true,
        right: true,
    };

    pub fn includes(&self, side: Side) -> bool {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }
}

/// A single payload: part of a source cell sent to a target cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub source: Cell,
    pub from: WorkerId,
    pub target: Cell,
    pub to: WorkerId,
}

#[derive(Debug, Clone)]
pub struct MigrationPlan {
    kind: MigrationKind,
    /// Exporting cells of the old assignment.
    sources: BTreeMap<Cell, (WorkerId, ExportSides)>,
    transfers: Vec<Transfer>,
    /// Payloads each receiving cell of the new assignment waits for.
    expected: BTreeMap<Cell, usize>,
    /// Old cells discarded without export.
    dropped: BTreeSet<Cell>,
}

impl MigrationPlan {
    pub fn between(old: &MatrixAssignment, new: &MatrixAssignment) -> Self {
        if old == new {
            return MigrationPlan {
                kind: MigrationKind::Unchanged,
                sources: BTreeMap::new(),
                transfers: Vec::new(),
                expected: BTreeMap::new(),
                dropped: BTreeSet::new(),
            };
        }

        if old.same_shape(new) {
            Self::reassign(old, new)
        } else {
            Self::repartition(old, new)
        }
    }

    fn reassign(old: &MatrixAssignment, new: &MatrixAssignment) -> Self {
        let mut sources = BTreeMap::new();
        let mut transfers = Vec::new();
        let mut expected = BTreeMap::new();

        for cell in old.cells() {
            let from = old.owner(cell);
            let to = new.owner(cell);
            if from == to {
                continue;
            }
            sources.insert(cell, (from, ExportSides::BOTH));
            transfers.push(Transfer {
                source: cell,
                from,
                target: cell,
                to,
            });
            expected.insert(cell, 1);
        }

        let kind = if transfers.is_empty() {
            MigrationKind::Unchanged
        } else {
            MigrationKind::Reassign
        };

        MigrationPlan {
            kind,
            sources,
            transfers,
            expected,
            dropped: BTreeSet::new(),
        }
    }

    fn repartition(old: &MatrixAssignment, new: &MatrixAssignment) -> Self {
        let mut sources = BTreeMap::new();
        for row in 0..old.rows() {
            let cell = Cell::new(row, 0);
            let sides = ExportSides {
                left: true,
                right: row == 0,
            };
            sources.insert(cell, (old.owner(cell), sides));
        }
        for col in 1..old.cols() {
            let cell = Cell::new(0, col);
            let sides = ExportSides {
                left: false,
                right: true,
            };
            sources.insert(cell, (old.owner(cell), sides));
        }

        let dropped = old.cells().filter(|c| !sources.contains_key(c)).collect();

        let mut transfers = Vec::with_capacity(sources.len() * new.rows() * new.cols());
        for (&source, &(from, _)) in &sources {
            for target in new.cells() {
                transfers.push(Transfer {
                    source,
                    from,
                    target,
                    to: new.owner(target),
                });
            }
        }

        let expected = new.cells().map(|c| (c, sources.len())).collect();

        MigrationPlan {
            kind: MigrationKind::Repartition,
            sources,
            transfers,
            expected,
            dropped,
        }
    }

    pub fn kind(&self) -> MigrationKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.kind == MigrationKind::Unchanged
    }

    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    /// Sides exported by an old cell, None if the cell isn't a source.
    pub fn export_sides(&self, cell: Cell) -> Option<ExportSides> {
        self.sources.get(&cell).map(|(_, sides)| *sides)
    }

    pub fn sources(&self) -> impl Iterator<Item = (Cell, WorkerId)> + '_ {
        self.sources.iter().map(|(cell, (owner, _))| (*cell, *owner))
    }

    pub fn is_dropped(&self, cell: Cell) -> bool {
        self.dropped.contains(&cell)
    }

    /// Number of payloads a new cell waits for, None if it receives nothing.
    pub fn expected_payloads(&self, cell: Cell) -> Option<usize> {
        self.expected.get(&cell).copied()
    }

    pub fn receiving_cells(&self) -> impl Iterator<Item = Cell> + '_ {
        self.expected.keys().copied()
    }

    /// Distinct (source cell, target worker) pairs, each one migration
    /// request.
    pub fn requests(&self) -> BTreeSet<(Cell, WorkerId, WorkerId)> {
        self.transfers
            .iter()
            .map(|t| (t.source, t.from, t.to))
            .collect()
    }

    /// Target cells owned by `to` fed by `source`.
    pub fn targets_on(&self, source: Cell, to: WorkerId) -> impl Iterator<Item = Cell> + '_ {
        self.transfers
            .iter()
            .filter(move |t| t.source == source && t.to == to)
            .map(|t| t.target)
    }

    /// Source cells feeding a target cell.
    pub fn sources_of(&self, target: Cell) -> impl Iterator<Item = Cell> + '_ {
        self.transfers
            .iter()
            .filter(move |t| t.target == target)
            .map(|t| t.source)
    }
}

/// Extract the part of an exported cell destined for `target` under the new
/// assignment.
pub fn payload_for(
    state: &BufferedState,
    sides: ExportSides,
    new: &MatrixAssignment,
    target: Cell,
) -> BufferedState {
    let select = |side: Side| -> Vec<BufferedTuple> {
        if !sides.includes(side) {
            return Vec::new();
        }
        state
            .side(side)
            .iter()
            .filter(|t| new.bucket_of(side, t.seq) == target.bucket(side))
            .cloned()
            .collect()
    };

    BufferedState {
        left: select(Side::Left),
        right: select(Side::Right),
    }
}
