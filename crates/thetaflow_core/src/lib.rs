//! Adaptive parallel theta-join.
//!
//! Two input relations are partitioned over a grid of cells, each cell owned
//! by one joiner. Every left tuple reaches one row of the grid and every
//! right tuple one column, so any pair of tuples meets in exactly one cell
//! no matter what predicate joins them. The grid adapts to the observed
//! input at epoch boundaries, migrating buffered state between joiners
//! without losing or duplicating matches.

pub mod row;

pub mod cancel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod fault;
pub mod joiner;
pub mod matrix;
pub mod message;
pub mod migration;
pub mod operator;
pub mod predicate;
pub mod reshuffler;
pub mod storage;
pub mod synchronizer;
pub mod topology;
pub mod window;

pub use config::{JoinConfig, SpillLocation};
pub use engine::{
    DeployedJoin, JoinCompletion, JoinControl, JoinInput, JoinOutput, JoinStatus, JoinSummary,
    ThetaJoin,
};
pub use fault::{CollectingFaultSink, FaultSink, LoggingFaultSink, PredicateFault};
pub use matrix::{Cell, MatrixAssignment};
pub use message::MatchOutput;
pub use operator::{Filter, Operator, OperatorChain, Projection};
pub use predicate::{ComparisonOperator, ComparisonPredicate, FnPredicate, JoinPredicate};
pub use row::{DataType, Row, ScalarValue, Side};
pub use window::JoinWindow;
