use thetaflow_error::{FlowError, Result};
use tracing::debug;

use crate::config::SpillLocation;
use crate::matrix::{Cell, WorkerId};
use crate::message::{BufferedState, BufferedTuple, DataTuple};
use crate::migration::ExportSides;
use crate::predicate::KeyRange;
use crate::row::{DataType, Side};
use crate::storage::{JoinKey, SkewedStore};

/// How and where a joiner spills cell buffers.
#[derive(Debug, Clone)]
pub struct SpillContext {
    pub worker: WorkerId,
    /// Zero disables spilling.
    pub threshold: usize,
    pub dispersion: u32,
    pub location: SpillLocation,
    /// Key type of the predicate, spilling requires one.
    pub key_type: Option<DataType>,
}

impl SpillContext {
    pub fn enabled(&self) -> bool {
        self.threshold > 0 && self.key_type.is_some()
    }

    fn create_store(&self, cell: Cell, side: Side) -> Result<SkewedStore> {
        let key_type = self
            .key_type
            .ok_or_else(|| FlowError::storage("Cannot spill without a key type"))?;

        let name = format!("w{}-r{}c{}-{}", self.worker, cell.row, cell.col, side);
        let kv = self.location.create_kv(&name)?;

        debug!(worker = self.worker, %cell, %side, "spilling cell buffer");
        SkewedStore::try_new(key_type, self.dispersion, kv)
    }
}

/// Tuples of one side of a cell.
///
/// Tuples with an index key move to the skewed store once the in-memory
/// count reaches the spill threshold. Tuples without a key always stay in
/// memory.
#[derive(Debug)]
pub struct SideBuffer {
    side: Side,
    keyed: Vec<(JoinKey, BufferedTuple)>,
    unkeyed: Vec<BufferedTuple>,
    store: Option<SkewedStore>,
}

impl SideBuffer {
    pub fn new(side: Side) -> Self {
        SideBuffer {
            side,
            keyed: Vec::new(),
            unkeyed: Vec::new(),
            store: None,
        }
    }

    pub fn len(&self) -> usize {
        self.keyed.len() + self.unkeyed.len() + self.spilled()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spilled(&self) -> usize {
        self.store.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    /// Append a tuple, returning the number of tuples spilled as a result.
    pub fn push(
        &mut self,
        cell: Cell,
        tuple: BufferedTuple,
        key: Option<JoinKey>,
        spill: &SpillContext,
    ) -> Result<usize> {
        match key {
            Some(key) if spill.enabled() => {
                self.keyed.push((key, tuple));
                if self.keyed.len() >= spill.threshold {
                    return self.spill(cell, spill);
                }
            }
            _ => self.unkeyed.push(tuple),
        }
        Ok(0)
    }

    fn spill(&mut self, cell: Cell, spill: &SpillContext) -> Result<usize> {
        if self.store.is_none() {
            self.store = Some(spill.create_store(cell, self.side)?);
        }
        let Some(store) = self.store.as_mut() else {
            return Err(FlowError::storage("Missing spill store"));
        };

        let count = self.keyed.len();
        for (key, tuple) in self.keyed.drain(..) {
            store.put(key, &encode(&tuple)?)?;
        }

        Ok(count)
    }

    /// Visit every buffered tuple that may match an incoming tuple with the given
    /// bounds. In-memory tuples are always visited, spilled tuples only
    /// within the bounds.
    pub fn for_each_candidate(
        &mut self,
        bounds: &KeyRange,
        mut f: impl FnMut(&BufferedTuple),
    ) -> Result<()> {
        self.keyed.iter().for_each(|(_, t)| f(t));
        self.unkeyed.iter().for_each(&mut f);

        if let Some(store) = &mut self.store {
            for value in store.get_range(bounds.0, bounds.1)? {
                f(&decode(&value)?);
            }
        }

        Ok(())
    }

    /// Take every tuple out of the buffer, ordered by sequence number.
    pub fn drain(&mut self) -> Result<Vec<BufferedTuple>> {
        let mut tuples: Vec<_> = self.keyed.drain(..).map(|(_, t)| t).collect();
        tuples.append(&mut self.unkeyed);

        if let Some(mut store) = self.store.take() {
            for value in store.scan_all()? {
                tuples.push(decode(&value)?);
            }
        }

        tuples.sort_by_key(|t| t.seq);
        Ok(tuples)
    }

    pub fn flush(&mut self) -> Result<()> {
        match &mut self.store {
            Some(store) => store.flush(),
            None => Ok(()),
        }
    }
}

fn encode(tuple: &BufferedTuple) -> Result<String> {
    serde_json::to_string(tuple)
        .map_err(|e| FlowError::storage("Failed to encode tuple").with_field("error", e))
}

fn decode(value: &str) -> Result<BufferedTuple> {
    serde_json::from_str(value)
        .map_err(|e| FlowError::storage("Failed to decode spilled tuple").with_field("error", e))
}

#[derive(Debug)]
pub enum CellPhase {
    Active,
    /// Frozen after its state was exported, waiting to be retired.
    MigratingOut {
        sides: ExportSides,
        state: BufferedState,
    },
    /// Waiting on payloads. Tuples arriving meanwhile are replayed once every
    /// payload is in.
    MigratingIn {
        remaining: usize,
        deferred: Vec<DataTuple>,
    },
}

#[derive(Debug)]
pub struct CellState {
    pub cell: Cell,
    pub phase: CellPhase,
    left: SideBuffer,
    right: SideBuffer,
}

impl CellState {
    pub fn new(cell: Cell) -> Self {
        CellState {
            cell,
            phase: CellPhase::Active,
            left: SideBuffer::new(Side::Left),
            right: SideBuffer::new(Side::Right),
        }
    }

    pub fn migrating_in(cell: Cell, payloads: usize) -> Self {
        CellState {
            phase: CellPhase::MigratingIn {
                remaining: payloads,
                deferred: Vec::new(),
            },
            ..Self::new(cell)
        }
    }

    pub fn buffer(&self, side: Side) -> &SideBuffer {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn buffer_mut(&mut self, side: Side) -> &mut SideBuffer {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, CellPhase::Active)
    }

    /// Drain both buffers and freeze the cell.
    pub fn export_state(&mut self, sides: ExportSides) -> Result<()> {
        let state = BufferedState {
            left: self.left.drain()?,
            right: self.right.drain()?,
        };
        self.phase = CellPhase::MigratingOut { sides, state };
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.left.flush()?;
        self.right.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    fn spill_ctx(threshold: usize, location: SpillLocation) -> SpillContext {
        SpillContext {
            worker: 0,
            threshold,
            dispersion: 4,
            location,
            key_type: Some(DataType::Int64),
        }
    }

    fn tuple(seq: u64, key: i64) -> BufferedTuple {
        BufferedTuple {
            seq,
            ingest_ms: 0,
            row: row![key, format!("v{seq}")],
        }
    }

    fn candidates(buf: &mut SideBuffer, bounds: KeyRange) -> Vec<u64> {
        let mut seqs = Vec::new();
        buf.for_each_candidate(&bounds, |t| seqs.push(t.seq)).unwrap();
        seqs.sort_unstable();
        seqs
    }

    #[test]
    fn spills_at_threshold() {
        let ctx = spill_ctx(3, SpillLocation::Memory);
        let cell = Cell::new(0, 0);
        let mut buf = SideBuffer::new(Side::Left);

        assert_eq!(0, buf.push(cell, tuple(0, 1), Some(JoinKey::Long(1)), &ctx).unwrap());
        assert_eq!(0, buf.push(cell, tuple(1, 2), Some(JoinKey::Long(2)), &ctx).unwrap());
        assert_eq!(3, buf.push(cell, tuple(2, 3), Some(JoinKey::Long(3)), &ctx).unwrap());
        buf.push(cell, tuple(3, 4), None, &ctx).unwrap();

        assert_eq!(4, buf.len());
        assert_eq!(3, buf.spilled());

        use std::ops::Bound;
        let bounds = (
            Bound::Included(JoinKey::Long(2)),
            Bound::Included(JoinKey::Long(2)),
        );
        // Unkeyed tuples are always candidates.
        assert_eq!(vec![1, 3], candidates(&mut buf, bounds));

        let drained = buf.drain().unwrap();
        assert_eq!(vec![0, 1, 2, 3], drained.iter().map(|t| t.seq).collect::<Vec<_>>());
        assert_eq!(tuple(2, 3), drained[2]);
        assert!(buf.is_empty());
    }

    #[test]
    fn spills_to_rocksdb() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = spill_ctx(1, SpillLocation::Directory(dir.path().to_path_buf()));
        let cell = Cell::new(1, 2);
        let mut buf = SideBuffer::new(Side::Right);

        for seq in 0..5 {
            buf.push(cell, tuple(seq, seq as i64 % 2), Some(JoinKey::Long(seq as i64 % 2)), &ctx)
                .unwrap();
        }
        buf.flush().unwrap();
        assert_eq!(1, std::fs::read_dir(dir.path()).unwrap().count());

        assert_eq!(vec![0, 1, 2, 3, 4], candidates(&mut buf, crate::predicate::FULL_SCAN));

        buf.drain().unwrap();
        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn no_spill_without_threshold() {
        let ctx = spill_ctx(0, SpillLocation::Memory);
        let mut buf = SideBuffer::new(Side::Left);
        for seq in 0..10 {
            buf.push(Cell::new(0, 0), tuple(seq, 1), Some(JoinKey::Long(1)), &ctx)
                .unwrap();
        }
        assert_eq!(0, buf.spilled());
        assert_eq!(10, buf.len());
    }

    #[test]
    fn export_freezes_cell() {
        let ctx = spill_ctx(2, SpillLocation::Memory);
        let mut cell = CellState::new(Cell::new(0, 0));
        for seq in 0..3 {
            cell.buffer_mut(Side::Left)
                .push(Cell::new(0, 0), tuple(seq, 7), Some(JoinKey::Long(7)), &ctx)
                .unwrap();
        }
        cell.buffer_mut(Side::Right)
            .push(Cell::new(0, 0), tuple(0, 7), None, &ctx)
            .unwrap();

        cell.export_state(ExportSides::BOTH).unwrap();
        match &cell.phase {
            CellPhase::MigratingOut { state, .. } => {
                assert_eq!(3, state.left.len());
                assert_eq!(1, state.right.len());
            }
            other => panic!("unexpected phase: {other:?}"),
        }
        assert!(cell.buffer(Side::Left).is_empty());
    }
}
