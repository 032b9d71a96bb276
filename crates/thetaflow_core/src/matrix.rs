//! Mapping of the logical join matrix onto workers.
//!
//! Every left tuple is bucketed to a row and every right tuple to a column of
//! the matrix. A cell `(r, c)` joins the tuples of row `r` with the tuples of
//! column `c`, so a worker owning a cell must receive both. Bucketing only
//! depends on the per-side arrival sequence number, never on tuple content.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thetaflow_error::{FlowError, Result};

use crate::row::Side;

pub type WorkerId = usize;
pub type Epoch = u64;

/// A single cell in the join matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub row: usize,
    pub col: usize,
}

impl Cell {
    pub const fn new(row: usize, col: usize) -> Self {
        Cell { row, col }
    }

    /// Bucket index of this cell along the axis of the given side.
    pub const fn bucket(&self, side: Side) -> usize {
        match side {
            Side::Left => self.row,
            Side::Right => self.col,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.row, self.col)
    }
}

/// Shape of the matrix and the owner of every cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAssignment {
    rows: usize,
    cols: usize,
    workers: usize,
    /// Owner per cell, row-major.
    owners: Vec<WorkerId>,
    /// Workers owning at least one cell in each row.
    row_workers: Vec<Vec<WorkerId>>,
    /// Workers owning at least one cell in each column.
    col_workers: Vec<Vec<WorkerId>>,
    /// Cells per worker, row-major order.
    worker_cells: Vec<Vec<Cell>>,
}

impl MatrixAssignment {
    /// Compute a content-insensitive assignment, assuming tuples are uniformly
    /// distributed across buckets.
    pub fn compute(
        row_cardinality: i64,
        col_cardinality: i64,
        workers: usize,
    ) -> Result<MatrixAssignment> {
        if workers < 1 {
            return Err(FlowError::configuration("Joiner parallelism must be at least 1")
                .with_field("workers", workers));
        }
        if row_cardinality <= 0 || col_cardinality <= 0 {
            return Err(FlowError::configuration("Cardinalities must be positive")
                .with_field("left", row_cardinality)
                .with_field("right", col_cardinality));
        }

        let (rows, cols) = choose_shape(row_cardinality as f64, col_cardinality as f64, workers);
        let owners = cover(rows, cols, workers);

        Self::try_from_owners(rows, cols, workers, owners)
    }

    /// Create an assignment from an explicit owner for every cell (row-major).
    ///
    /// Every cell needs exactly one owner and every worker must own at least
    /// one cell.
    pub fn try_from_owners(
        rows: usize,
        cols: usize,
        workers: usize,
        owners: Vec<WorkerId>,
    ) -> Result<MatrixAssignment> {
        if rows == 0 || cols == 0 {
            return Err(FlowError::configuration("Matrix must have at least one cell")
                .with_field("rows", rows)
                .with_field("cols", cols));
        }
        if owners.len() != rows * cols {
            return Err(FlowError::configuration("Owner count does not match matrix size")
                .with_field("owners", owners.len())
                .with_field("cells", rows * cols));
        }
        if let Some(bad) = owners.iter().find(|&&w| w >= workers) {
            return Err(FlowError::configuration("Cell owner out of range")
                .with_field("owner", bad)
                .with_field("workers", workers));
        }

        let mut row_workers = vec![Vec::new(); rows];
        let mut col_workers = vec![Vec::new(); cols];
        let mut worker_cells = vec![Vec::new(); workers];

        for (idx, &owner) in owners.iter().enumerate() {
            let cell = Cell::new(idx / cols, idx % cols);
            if !row_workers[cell.row].contains(&owner) {
                row_workers[cell.row].push(owner);
            }
            if !col_workers[cell.col].contains(&owner) {
                col_workers[cell.col].push(owner);
            }
            worker_cells[owner].push(cell);
        }

        if let Some(idle) = worker_cells.iter().position(|cells| cells.is_empty()) {
            return Err(FlowError::configuration("Every worker must own at least one cell")
                .with_field("worker", idle));
        }

        for ws in row_workers.iter_mut().chain(col_workers.iter_mut()) {
            ws.sort_unstable();
        }

        Ok(MatrixAssignment {
            rows,
            cols,
            workers,
            owners,
            row_workers,
            col_workers,
            worker_cells,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn num_workers(&self) -> usize {
        self.workers
    }

    /// Number of buckets along the axis of a side.
    pub fn dimension(&self, side: Side) -> usize {
        match side {
            Side::Left => self.rows,
            Side::Right => self.cols,
        }
    }

    /// Bucket for a tuple with the given per-side sequence number.
    pub fn bucket_of(&self, side: Side, seq: u64) -> usize {
        (seq % self.dimension(side) as u64) as usize
    }

    pub fn owner(&self, cell: Cell) -> WorkerId {
        self.owners[cell.row * self.cols + cell.col]
    }

    /// Workers that need to receive a tuple bucketed to `bucket`.
    pub fn workers_of(&self, side: Side, bucket: usize) -> &[WorkerId] {
        match side {
            Side::Left => &self.row_workers[bucket],
            Side::Right => &self.col_workers[bucket],
        }
    }

    /// Cells owned by a worker, empty for workers outside the assignment.
    pub fn cells_of(&self, worker: WorkerId) -> &[Cell] {
        self.worker_cells.get(worker).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (0..self.rows).flat_map(move |r| (0..self.cols).map(move |c| Cell::new(r, c)))
    }

    pub fn same_shape(&self, other: &MatrixAssignment) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }

    /// Expected input per cell for the given cardinalities.
    pub fn input_cost(&self, row_cardinality: f64, col_cardinality: f64) -> f64 {
        shape_cost(row_cardinality, col_cardinality, self.rows, self.cols)
    }

    pub fn dimensions_string(&self) -> String {
        format!("{}-{}", self.rows, self.cols)
    }
}

fn shape_cost(row_cardinality: f64, col_cardinality: f64, rows: usize, cols: usize) -> f64 {
    row_cardinality / rows as f64 + col_cardinality / cols as f64
}

/// Pick `(rows, cols)` with the fewest cells such that `rows * cols >= workers`.
///
/// Among shapes with equally few cells the one whose `rows / cols` is
/// closest to `row_card / col_card` wins, compared on a log scale. Remaining
/// ties go to fewer rows.
fn choose_shape(row_card: f64, col_card: f64, workers: usize) -> (usize, usize) {
    let target = (row_card / col_card).ln();
    let skew = |rows: usize, cols: usize| ((rows as f64 / cols as f64).ln() - target).abs();

    let mut best = (1, workers);
    for rows in 2..=workers {
        let cols = workers.div_ceil(rows);
        let cells = rows * cols;
        let best_cells = best.0 * best.1;

        let better = match cells.cmp(&best_cells) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => skew(rows, cols) < skew(best.0, best.1) - 1e-9,
            std::cmp::Ordering::Greater => false,
        };
        if better {
            best = (rows, cols);
        }
    }

    best
}

/// Greedy diagonal-striping cover.
///
/// Worker `w` claims `(w mod rows, w mod cols)` when free, leftover cells go
/// to the worker with the fewest cells. Requires `rows * cols >= workers`.
fn cover(rows: usize, cols: usize, workers: usize) -> Vec<WorkerId> {
    let mut owners: Vec<Option<WorkerId>> = vec![None; rows * cols];
    let mut counts = vec![0_usize; workers];

    for w in 0..workers {
        let idx = (w % rows) * cols + (w % cols);
        if owners[idx].is_none() {
            owners[idx] = Some(w);
            counts[w] += 1;
        }
    }

    for owner in owners.iter_mut().filter(|o| o.is_none()) {
        let w = counts
            .iter()
            .enumerate()
            .min_by_key(|(w, count)| (**count, *w))
            .map(|(w, _)| w)
            .unwrap_or(0);
        *owner = Some(w);
        counts[w] += 1;
    }

    owners.into_iter().map(|o| o.unwrap_or_default()).collect()
}

/// An assignment bound to the epoch it becomes active in.
#[derive(Debug, Clone)]
pub struct MappingVersion {
    pub epoch: Epoch,
    pub assignment: Arc<MatrixAssignment>,
}

impl MappingVersion {
    pub fn new(epoch: Epoch, assignment: Arc<MatrixAssignment>) -> Self {
        MappingVersion { epoch, assignment }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_balanced(assignment: &MatrixAssignment) {
        let cells = assignment.rows() * assignment.cols();
        assert!(cells >= assignment.num_workers());

        let counts: Vec<_> = (0..assignment.num_workers())
            .map(|w| assignment.cells_of(w).len())
            .collect();
        let total: usize = counts.iter().sum();
        assert_eq!(cells, total, "every cell has exactly one owner");

        let min = *counts.iter().min().unwrap();
        let max = *counts.iter().max().unwrap();
        assert!(min >= 1);
        assert!(max - min <= 1, "counts: {counts:?}");
        assert!(max <= cells.div_ceil(assignment.num_workers()));
    }

    #[test]
    fn square_for_equal_cardinalities() {
        let a = MatrixAssignment::compute(100, 100, 4).unwrap();
        assert_eq!((2, 2), (a.rows(), a.cols()));
        for w in 0..4 {
            assert_eq!(1, a.cells_of(w).len());
        }
        // One owner per cell, so no cell is duplicated.
        let mut owners: Vec<_> = a.cells().map(|c| a.owner(c)).collect();
        owners.sort();
        assert_eq!(vec![0, 1, 2, 3], owners);
    }

    #[test]
    fn aspect_follows_cardinalities() {
        let a = MatrixAssignment::compute(1000, 10, 8).unwrap();
        assert!(a.rows() > a.cols(), "got {}", a.dimensions_string());

        let a = MatrixAssignment::compute(10, 1000, 8).unwrap();
        assert!(a.cols() > a.rows(), "got {}", a.dimensions_string());
    }

    #[test]
    fn fewest_cells_covering_workers() {
        let a = MatrixAssignment::compute(100, 100, 5).unwrap();
        assert_eq!(5, a.rows() * a.cols());

        let a = MatrixAssignment::compute(100, 100, 10).unwrap();
        assert_eq!((2, 5), (a.rows(), a.cols()));

        let a = MatrixAssignment::compute(100, 100, 9).unwrap();
        assert_eq!((3, 3), (a.rows(), a.cols()));

        let a = MatrixAssignment::compute(390, 10, 4).unwrap();
        assert_eq!((4, 1), (a.rows(), a.cols()));

        for workers in 1..=33 {
            let a = MatrixAssignment::compute(123, 456, workers).unwrap();
            assert_eq!(workers, a.rows() * a.cols());
            for w in 0..workers {
                assert_eq!(1, a.cells_of(w).len());
            }
        }
    }

    #[test]
    fn balanced_for_many_inputs() {
        for workers in 1..=33 {
            for (l, r) in [(1, 1), (100, 100), (1, 1000), (5000, 7), (123, 456)] {
                let a = MatrixAssignment::compute(l, r, workers).unwrap();
                assert_balanced(&a);
            }
        }
    }

    #[test]
    fn deterministic() {
        let a = MatrixAssignment::compute(321, 77, 13).unwrap();
        let b = MatrixAssignment::compute(321, 77, 13).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn single_worker_single_cell() {
        let a = MatrixAssignment::compute(10, 10, 1).unwrap();
        assert_eq!((1, 1), (a.rows(), a.cols()));
        assert_eq!(&[0], a.workers_of(Side::Left, 0));
        assert_eq!(&[0], a.workers_of(Side::Right, 0));
    }

    #[test]
    fn routing_sets_cover_cells() {
        let a = MatrixAssignment::compute(40, 90, 7).unwrap();
        for cell in a.cells() {
            let owner = a.owner(cell);
            assert!(a.workers_of(Side::Left, cell.row).contains(&owner));
            assert!(a.workers_of(Side::Right, cell.col).contains(&owner));
        }
    }

    #[test]
    fn invalid_inputs() {
        use thetaflow_error::ErrorKind;

        let err = MatrixAssignment::compute(10, 10, 0).unwrap_err();
        assert_eq!(ErrorKind::Configuration, err.kind());
        let err = MatrixAssignment::compute(0, 10, 2).unwrap_err();
        assert_eq!(ErrorKind::Configuration, err.kind());
        let err = MatrixAssignment::compute(10, -1, 2).unwrap_err();
        assert_eq!(ErrorKind::Configuration, err.kind());
    }

    #[test]
    fn explicit_owners_validated() {
        MatrixAssignment::try_from_owners(2, 2, 4, vec![3, 2, 1, 0]).unwrap();
        // Worker 3 owns nothing.
        MatrixAssignment::try_from_owners(2, 2, 4, vec![0, 1, 2, 2]).unwrap_err();
        // Wrong size.
        MatrixAssignment::try_from_owners(2, 2, 4, vec![0, 1, 2]).unwrap_err();
        // Owner out of range.
        MatrixAssignment::try_from_owners(1, 2, 2, vec![0, 2]).unwrap_err();
    }

    #[test]
    fn bucket_by_sequence() {
        let a = MatrixAssignment::compute(100, 100, 4).unwrap();
        assert_eq!(0, a.bucket_of(Side::Left, 0));
        assert_eq!(1, a.bucket_of(Side::Left, 1));
        assert_eq!(0, a.bucket_of(Side::Right, 2));
    }

    #[test]
    fn idle_workers_own_nothing() {
        let a = MatrixAssignment::compute(100, 100, 2).unwrap();
        assert!(!a.cells_of(1).is_empty());
        assert!(a.cells_of(2).is_empty());
        assert!(a.cells_of(7).is_empty());
    }
}
