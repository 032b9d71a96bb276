use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thetaflow_error::FlowError;
use tracing::warn;

use crate::matrix::{Cell, WorkerId};

/// A pair of tuples that couldn't be evaluated.
#[derive(Debug)]
pub struct PredicateFault {
    pub worker: WorkerId,
    pub cell: Cell,
    pub left_seq: u64,
    pub right_seq: u64,
    pub error: FlowError,
}

/// Where joiners report per-pair evaluation failures.
///
/// Faults never stop the join, the offending pair is skipped.
pub trait FaultSink: Debug + Sync + Send {
    fn record(&self, fault: PredicateFault);

    /// Number of faults recorded so far.
    fn count(&self) -> u64;
}

/// Logs every fault and counts them.
#[derive(Debug, Default)]
pub struct LoggingFaultSink {
    count: AtomicU64,
}

impl FaultSink for LoggingFaultSink {
    fn record(&self, fault: PredicateFault) {
        self.count.fetch_add(1, Ordering::Relaxed);
        warn!(
            worker = fault.worker,
            cell = %fault.cell,
            left_seq = fault.left_seq,
            right_seq = fault.right_seq,
            error = %fault.error,
            "skipping pair, predicate evaluation failed",
        );
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Keeps every fault in memory.
#[derive(Debug, Default)]
pub struct CollectingFaultSink {
    faults: Mutex<Vec<PredicateFault>>,
}

impl CollectingFaultSink {
    pub fn take(&self) -> Vec<PredicateFault> {
        std::mem::take(&mut *self.faults.lock())
    }
}

impl FaultSink for CollectingFaultSink {
    fn record(&self, fault: PredicateFault) {
        self.faults.lock().push(fault);
    }

    fn count(&self) -> u64 {
        self.faults.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(left_seq: u64) -> PredicateFault {
        PredicateFault {
            worker: 1,
            cell: Cell::new(0, 1),
            left_seq,
            right_seq: 0,
            error: FlowError::predicate("bad pair"),
        }
    }

    #[test]
    fn logging_sink_counts() {
        let sink = LoggingFaultSink::default();
        sink.record(fault(0));
        sink.record(fault(1));
        assert_eq!(2, sink.count());
    }

    #[test]
    fn collecting_sink_keeps_faults() {
        let sink = CollectingFaultSink::default();
        sink.record(fault(3));
        assert_eq!(1, sink.count());

        let faults = sink.take();
        assert_eq!(3, faults[0].left_seq);
        assert_eq!(0, sink.count());
    }
}
