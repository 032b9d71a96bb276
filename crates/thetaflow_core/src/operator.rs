use std::fmt::Debug;
use std::sync::Arc;

use thetaflow_error::Result;

use crate::predicate::{ComparisonOperator, compare_scalars};
use crate::row::{Row, ScalarValue};

/// A post-join transformation applied to each joined row.
pub trait Operator: Debug + Sync + Send {
    /// Transform a row. Returning None drops it.
    fn apply(&self, row: Row) -> Result<Option<Row>>;
}

/// Ordered list of operators. An empty chain passes rows through untouched.
#[derive(Debug, Clone, Default)]
pub struct OperatorChain {
    operators: Vec<Arc<dyn Operator>>,
}

impl OperatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: impl Operator + 'static) {
        self.operators.push(Arc::new(op));
    }

    pub fn with(mut self, op: impl Operator + 'static) -> Self {
        self.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn apply(&self, mut row: Row) -> Result<Option<Row>> {
        for op in &self.operators {
            row = match op.apply(row)? {
                Some(row) => row,
                None => return Ok(None),
            };
        }
        Ok(Some(row))
    }
}

/// Keep a subset of columns, in the given order.
#[derive(Debug, Clone)]
pub struct Projection {
    pub columns: Vec<usize>,
}

impl Projection {
    pub fn new(columns: impl IntoIterator<Item = usize>) -> Self {
        Projection {
            columns: columns.into_iter().collect(),
        }
    }
}

impl Operator for Projection {
    fn apply(&self, row: Row) -> Result<Option<Row>> {
        let values = self
            .columns
            .iter()
            .map(|&idx| row.column(idx).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Row { values }))
    }
}

/// Keep rows where `column op value` holds. Nulls never pass.
#[derive(Debug, Clone)]
pub struct Filter {
    pub column: usize,
    pub op: ComparisonOperator,
    pub value: ScalarValue,
}

impl Filter {
    pub fn new(column: usize, op: ComparisonOperator, value: impl Into<ScalarValue>) -> Self {
        Filter {
            column,
            op,
            value: value.into(),
        }
    }
}

impl Operator for Filter {
    fn apply(&self, row: Row) -> Result<Option<Row>> {
        let val = row.column(self.column)?;
        if val.is_null() || self.value.is_null() {
            return Ok(None);
        }
        let ord = compare_scalars(val, &self.value)?;
        let keep = match self.op {
            ComparisonOperator::Eq => ord.is_eq(),
            ComparisonOperator::NotEq => ord.is_ne(),
            ComparisonOperator::Lt => ord.is_lt(),
            ComparisonOperator::LtEq => ord.is_le(),
            ComparisonOperator::Gt => ord.is_gt(),
            ComparisonOperator::GtEq => ord.is_ge(),
        };
        Ok(keep.then_some(row))
    }
}
