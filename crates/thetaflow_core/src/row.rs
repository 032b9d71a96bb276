use std::fmt;

use serde::{Deserialize, Serialize};
use thetaflow_error::{FlowError, Result};

/// Which relation of the join a tuple belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Utf8,
    /// Microseconds since the unix epoch.
    Timestamp,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Boolean => "Boolean",
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::Float64 => "Float64",
            Self::Utf8 => "Utf8",
            Self::Timestamp => "Timestamp",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Timestamp(i64),
}

impl ScalarValue {
    /// Data type of the value, None for nulls.
    pub fn datatype(&self) -> Option<DataType> {
        Some(match self {
            Self::Null => return None,
            Self::Boolean(_) => DataType::Boolean,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float64(_) => DataType::Float64,
            Self::Utf8(_) => DataType::Utf8,
            Self::Timestamp(_) => DataType::Timestamp,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to get the value as an i64, widening integers.
    pub fn try_as_i64(&self) -> Result<i64> {
        match self {
            Self::Int32(v) => Ok(*v as i64),
            Self::Int64(v) | Self::Timestamp(v) => Ok(*v),
            other => Err(FlowError::new(format!("Cannot interpret {other} as an integer"))),
        }
    }

    /// Parse a value from text, preferring integers, then floats, falling back
    /// to a string.
    pub fn parse_inferred(s: &str) -> ScalarValue {
        let s = s.trim();
        if s.is_empty() {
            return ScalarValue::Null;
        }
        if let Ok(v) = s.parse::<i64>() {
            return ScalarValue::Int64(v);
        }
        if let Ok(v) = s.parse::<f64>() {
            return ScalarValue::Float64(v);
        }
        ScalarValue::Utf8(s.to_string())
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{v}us"),
        }
    }
}

impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        ScalarValue::Int32(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int64(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Utf8(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Utf8(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Float64(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

/// A single tuple.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<ScalarValue>,
}

impl Row {
    pub fn new(values: impl IntoIterator<Item = ScalarValue>) -> Self {
        Row {
            values: values.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a column, erroring if out of bounds.
    pub fn column(&self, idx: usize) -> Result<&ScalarValue> {
        self.values.get(idx).ok_or_else(|| {
            FlowError::new("Column index out of bounds")
                .with_field("index", idx)
                .with_field("width", self.values.len())
        })
    }

    /// Concatenate two rows, left columns first.
    pub fn concat(left: &Row, right: &Row) -> Row {
        let mut values = Vec::with_capacity(left.len() + right.len());
        values.extend(left.values.iter().cloned());
        values.extend(right.values.iter().cloned());
        Row { values }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, val) in self.values.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{val}")?;
        }
        Ok(())
    }
}

/// Create a row from a list of values convertible into scalars.
#[macro_export]
macro_rules! row {
    ($($val:expr),* $(,)?) => {
        $crate::row::Row::new([$($crate::row::ScalarValue::from($val)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inferred_values() {
        assert_eq!(ScalarValue::Int64(42), ScalarValue::parse_inferred(" 42 "));
        assert_eq!(ScalarValue::Float64(1.5), ScalarValue::parse_inferred("1.5"));
        assert_eq!(ScalarValue::Utf8("abc".into()), ScalarValue::parse_inferred("abc"));
        assert_eq!(ScalarValue::Null, ScalarValue::parse_inferred(""));
    }

    #[test]
    fn concat_rows() {
        let left = row![1, "a"];
        let right = row![2_i64];
        let out = Row::concat(&left, &right);
        assert_eq!("1,a,2", out.to_string());
    }

    #[test]
    fn column_out_of_bounds() {
        let r = row![1];
        r.column(3).unwrap_err();
    }
}
