use std::fmt::{self, Debug};
use std::ops::Bound;
use std::str::FromStr;

use thetaflow_error::{FlowError, Result};

use crate::row::{DataType, Row, ScalarValue, Side};
use crate::storage::JoinKey;

/// Bounds on the keys of the opposite side that may match a probing tuple.
pub type KeyRange = (Bound<JoinKey>, Bound<JoinKey>);

pub const FULL_SCAN: KeyRange = (Bound::Unbounded, Bound::Unbounded);

/// A binary join predicate.
///
/// `matches` is the only required method. The key methods let a joiner index
/// spilled tuples in the skewed store and narrow lookups to a key range; a
/// predicate that doesn't provide them still works, but its tuples are never
/// spilled.
pub trait JoinPredicate: Debug + Sync + Send {
    fn matches(&self, left: &Row, right: &Row) -> Result<bool>;

    /// Type of the key used to index tuples of both sides.
    fn key_datatype(&self) -> Option<DataType> {
        None
    }

    /// Key for a tuple of the given side, None if the tuple can't be indexed.
    fn index_key(&self, _side: Side, _row: &Row) -> Result<Option<JoinKey>> {
        Ok(None)
    }

    /// Key range on the opposite side that may match a tuple of `side`.
    fn key_range(&self, _side: Side, _row: &Row) -> Result<KeyRange> {
        Ok(FULL_SCAN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl ComparisonOperator {
    /// Operator with the operands swapped, `a < b` becomes `b > a`.
    pub const fn flip(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::NotEq => Self::NotEq,
            Self::Lt => Self::Gt,
            Self::LtEq => Self::GtEq,
            Self::Gt => Self::Lt,
            Self::GtEq => Self::LtEq,
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ComparisonOperator {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "=" | "==" => Self::Eq,
            "!=" | "<>" => Self::NotEq,
            "<" => Self::Lt,
            "<=" => Self::LtEq,
            ">" => Self::Gt,
            ">=" => Self::GtEq,
            other => {
                return Err(FlowError::configuration("Invalid comparison operator")
                    .with_field("operator", other.to_string()));
            }
        })
    }
}

/// Compares one column of the left tuple with one column of the right tuple.
///
/// Integer columns can additionally be joined on a band, `|left - right| <=
/// radius`, which replaces the operator.
#[derive(Debug, Clone)]
pub struct ComparisonPredicate {
    pub left_column: usize,
    pub op: ComparisonOperator,
    pub right_column: usize,
    pub band: Option<u64>,
    /// Set when both columns hold integer orderable values, enabling spills.
    pub key_datatype: Option<DataType>,
}

impl ComparisonPredicate {
    pub fn new(left_column: usize, op: ComparisonOperator, right_column: usize) -> Self {
        ComparisonPredicate {
            left_column,
            op,
            right_column,
            band: None,
            key_datatype: None,
        }
    }

    /// Band join with the given radius.
    pub fn band(left_column: usize, right_column: usize, radius: u64) -> Self {
        ComparisonPredicate {
            band: Some(radius),
            ..Self::new(left_column, ComparisonOperator::Eq, right_column)
        }
    }

    /// Declare the key type of the compared columns.
    ///
    /// Errors if the type cannot be used to index spilled tuples.
    pub fn with_key_datatype(mut self, datatype: DataType) -> Result<Self> {
        JoinKey::check_datatype(datatype)?;
        self.key_datatype = Some(datatype);
        Ok(self)
    }

    fn column(&self, side: Side) -> usize {
        match side {
            Side::Left => self.left_column,
            Side::Right => self.right_column,
        }
    }
}

impl JoinPredicate for ComparisonPredicate {
    fn matches(&self, left: &Row, right: &Row) -> Result<bool> {
        let l = left.column(self.left_column)?;
        let r = right.column(self.right_column)?;
        if l.is_null() || r.is_null() {
            return Ok(false);
        }

        if let Some(radius) = self.band {
            let diff = (l.try_as_i64()? as i128 - r.try_as_i64()? as i128).unsigned_abs();
            return Ok(diff <= radius as u128);
        }

        let ord = compare_scalars(l, r)?;
        Ok(match self.op {
            ComparisonOperator::Eq => ord.is_eq(),
            ComparisonOperator::NotEq => ord.is_ne(),
            ComparisonOperator::Lt => ord.is_lt(),
            ComparisonOperator::LtEq => ord.is_le(),
            ComparisonOperator::Gt => ord.is_gt(),
            ComparisonOperator::GtEq => ord.is_ge(),
        })
    }

    fn key_datatype(&self) -> Option<DataType> {
        self.key_datatype
    }

    fn index_key(&self, side: Side, row: &Row) -> Result<Option<JoinKey>> {
        let Some(key_type) = self.key_datatype else {
            return Ok(None);
        };
        Ok(JoinKey::coerce_scalar(row.column(self.column(side))?, key_type))
    }

    fn key_range(&self, side: Side, row: &Row) -> Result<KeyRange> {
        let key = match self.index_key(side, row)? {
            Some(key) => key,
            None => return Ok(FULL_SCAN),
        };

        if let Some(radius) = self.band {
            let center = key.to_orderable();
            let low = center.saturating_sub_unsigned(radius);
            let high = center.saturating_add_unsigned(radius);
            return Ok((
                Bound::Included(JoinKey::Long(low)),
                Bound::Included(JoinKey::Long(high)),
            ));
        }

        // Express the operator as `incoming op stored`.
        let op = match side {
            Side::Left => self.op,
            Side::Right => self.op.flip(),
        };

        Ok(match op {
            ComparisonOperator::Eq => (Bound::Included(key), Bound::Included(key)),
            ComparisonOperator::NotEq => FULL_SCAN,
            // incoming < stored
            ComparisonOperator::Lt => (Bound::Excluded(key), Bound::Unbounded),
            ComparisonOperator::LtEq => (Bound::Included(key), Bound::Unbounded),
            // incoming > stored
            ComparisonOperator::Gt => (Bound::Unbounded, Bound::Excluded(key)),
            ComparisonOperator::GtEq => (Bound::Unbounded, Bound::Included(key)),
        })
    }
}

/// Compare two non-null scalars.
pub fn compare_scalars(a: &ScalarValue, b: &ScalarValue) -> Result<std::cmp::Ordering> {
    use ScalarValue::*;

    Ok(match (a, b) {
        (Int32(_) | Int64(_) | Timestamp(_), Int32(_) | Int64(_) | Timestamp(_)) => {
            a.try_as_i64()?.cmp(&b.try_as_i64()?)
        }
        (Float64(x), Float64(y)) => x.partial_cmp(y).ok_or_else(|| {
            FlowError::predicate("Cannot compare NaN").with_field("left", x).with_field("right", y)
        })?,
        (Float64(x), Int32(_) | Int64(_)) => {
            let y = b.try_as_i64()? as f64;
            x.partial_cmp(&y)
                .ok_or_else(|| FlowError::predicate("Cannot compare NaN"))?
        }
        (Int32(_) | Int64(_), Float64(y)) => {
            let x = a.try_as_i64()? as f64;
            x.partial_cmp(y)
                .ok_or_else(|| FlowError::predicate("Cannot compare NaN"))?
        }
        (Utf8(x), Utf8(y)) => x.cmp(y),
        (Boolean(x), Boolean(y)) => x.cmp(y),
        (a, b) => {
            return Err(FlowError::predicate("Incomparable values")
                .with_field("left", a)
                .with_field("right", b));
        }
    })
}

/// Predicate backed by a closure.
pub struct FnPredicate<F> {
    name: &'static str,
    f: F,
}

impl<F> FnPredicate<F>
where
    F: Fn(&Row, &Row) -> Result<bool> + Sync + Send,
{
    pub fn new(name: &'static str, f: F) -> Self {
        FnPredicate { name, f }
    }
}

impl<F> Debug for FnPredicate<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPredicate").field("name", &self.name).finish()
    }
}

impl<F> JoinPredicate for FnPredicate<F>
where
    F: Fn(&Row, &Row) -> Result<bool> + Sync + Send,
{
    fn matches(&self, left: &Row, right: &Row) -> Result<bool> {
        (self.f)(left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    #[test]
    fn comparison_ops() {
        let lt = ComparisonPredicate::new(0, ComparisonOperator::Lt, 1);
        assert!(lt.matches(&row![1], &row![2, "x"]).is_err());
        assert!(lt.matches(&row![1], &row![0, 2]).unwrap());
        assert!(!lt.matches(&row![2], &row![0, 2]).unwrap());

        let eq = ComparisonPredicate::new(0, ComparisonOperator::Eq, 0);
        assert!(eq.matches(&row![3], &row![3_i64]).unwrap());
        assert!(!eq.matches(&row![ScalarValue::Null], &row![3]).unwrap());
        assert!(eq.matches(&row!["a"], &row!["a"]).unwrap());
    }

    #[test]
    fn parse_operator() {
        assert_eq!(ComparisonOperator::LtEq, "<=".parse().unwrap());
        assert_eq!(ComparisonOperator::NotEq, "<>".parse().unwrap());
        "=>".parse::<ComparisonOperator>().unwrap_err();
    }

    #[test]
    fn band_match() {
        let band = ComparisonPredicate::band(0, 0, 2);
        assert!(band.matches(&row![5], &row![7]).unwrap());
        assert!(band.matches(&row![5], &row![3]).unwrap());
        assert!(!band.matches(&row![5], &row![8]).unwrap());
    }

    #[test]
    fn key_range_follows_operator() {
        let p = ComparisonPredicate::new(0, ComparisonOperator::Lt, 0)
            .with_key_datatype(DataType::Int64)
            .unwrap();

        // left < right, probing with a left tuple: stored right keys > 5.
        let (low, high) = p.key_range(Side::Left, &row![5_i64]).unwrap();
        assert_eq!(Bound::Excluded(JoinKey::Long(5)), low);
        assert_eq!(Bound::Unbounded, high);

        // Probing with a right tuple: stored left keys < 5.
        let (low, high) = p.key_range(Side::Right, &row![5_i64]).unwrap();
        assert_eq!(Bound::Unbounded, low);
        assert_eq!(Bound::Excluded(JoinKey::Long(5)), high);
    }

    #[test]
    fn keys_follow_declared_type() {
        let p = ComparisonPredicate::new(0, ComparisonOperator::Eq, 1)
            .with_key_datatype(DataType::Int32)
            .unwrap();

        let parsed = Row::new(["7", "x"].map(ScalarValue::parse_inferred));
        assert_eq!(Some(JoinKey::Integer(7)), p.index_key(Side::Left, &parsed).unwrap());

        // Too wide for the key type, stays unkeyed and scans everything.
        let wide = row![1_i64 << 40];
        assert_eq!(None, p.index_key(Side::Left, &wide).unwrap());
        assert_eq!(FULL_SCAN, p.key_range(Side::Left, &wide).unwrap());

        let (low, high) = p.key_range(Side::Right, &row!["y", 3_i64]).unwrap();
        assert_eq!(Bound::Included(JoinKey::Integer(3)), low);
        assert_eq!(Bound::Included(JoinKey::Integer(3)), high);
    }

    #[test]
    fn key_datatype_validated() {
        ComparisonPredicate::new(0, ComparisonOperator::Eq, 0)
            .with_key_datatype(DataType::Utf8)
            .unwrap_err();
        ComparisonPredicate::new(0, ComparisonOperator::Eq, 0)
            .with_key_datatype(DataType::Float64)
            .unwrap_err();
    }

    #[test]
    fn no_key_without_datatype() {
        let p = ComparisonPredicate::new(0, ComparisonOperator::Eq, 0);
        assert_eq!(None, p.index_key(Side::Left, &row![1]).unwrap());
        assert_eq!(FULL_SCAN, p.key_range(Side::Left, &row![1]).unwrap());
    }

    #[test]
    fn closure_predicate() {
        let p = FnPredicate::new("sum_is_ten", |l: &Row, r: &Row| {
            Ok(l.column(0)?.try_as_i64()? + r.column(0)?.try_as_i64()? == 10)
        });
        assert!(p.matches(&row![4], &row![6]).unwrap());
        assert!(!p.matches(&row![4], &row![5]).unwrap());
    }
}
