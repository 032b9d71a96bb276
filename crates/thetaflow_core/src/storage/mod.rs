//! Skew tolerant spill storage.
//!
//! A hot logical key would otherwise accumulate a single, ever growing value
//! list that has to be read and rewritten on every append. Each logical key
//! `k` is instead spread over `D` physical keys in `[k*D, (k+1)*D)`, bounding
//! how large any single entry grows while still allowing exact reconstruction
//! through a range scan.

pub mod kv;

use std::fmt;
use std::ops::Bound;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thetaflow_error::{FlowError, Result};

use self::kv::OrderedKv;
use crate::row::{DataType, ScalarValue};

pub const DEFAULT_DISPERSION: u32 = 10_000;

/// Separator between values stored under the same physical key.
pub const VALUE_DELIMITER: char = '\n';

/// Keys usable by the skewed store.
///
/// Only types with a total order embeddable in a fixed width integer are
/// representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JoinKey {
    Integer(i32),
    Long(i64),
    /// Microseconds since the unix epoch.
    Timestamp(i64),
}

impl JoinKey {
    pub fn to_orderable(&self) -> i64 {
        match self {
            JoinKey::Integer(v) => *v as i64,
            JoinKey::Long(v) | JoinKey::Timestamp(v) => *v,
        }
    }

    pub fn datatype(&self) -> DataType {
        match self {
            JoinKey::Integer(_) => DataType::Int32,
            JoinKey::Long(_) => DataType::Int64,
            JoinKey::Timestamp(_) => DataType::Timestamp,
        }
    }

    /// Convert a scalar into a key of the given type.
    ///
    /// Any integer orderable value fitting the key type converts, so an
    /// `Int64` column can feed an `Int32` store. Nulls, values out of range
    /// and values that aren't integer orderable produce None, leaving the
    /// tuple unkeyed.
    pub fn coerce_scalar(value: &ScalarValue, key_type: DataType) -> Option<JoinKey> {
        let v = match value {
            ScalarValue::Int32(v) => *v as i64,
            ScalarValue::Int64(v) | ScalarValue::Timestamp(v) => *v,
            _ => return None,
        };
        match key_type {
            DataType::Int32 => i32::try_from(v).ok().map(JoinKey::Integer),
            DataType::Int64 => Some(JoinKey::Long(v)),
            DataType::Timestamp => Some(JoinKey::Timestamp(v)),
            _ => None,
        }
    }

    /// Check that a data type can be used for store keys.
    pub fn check_datatype(datatype: DataType) -> Result<()> {
        match datatype {
            DataType::Int32 | DataType::Int64 | DataType::Timestamp => Ok(()),
            other => Err(FlowError::configuration(
                "Unsupported key type for skewed store, keys must be integer orderable",
            )
            .with_field("datatype", other)),
        }
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_orderable())
    }
}

/// Ordered store mapping logical keys to a multiset of values.
#[derive(Debug)]
pub struct SkewedStore {
    key_type: DataType,
    dispersion: i128,
    kv: Box<dyn OrderedKv>,
    rng: StdRng,
    /// Number of values put.
    len: usize,
}

impl SkewedStore {
    /// Create a new store for the given key type.
    ///
    /// Fails if the key type is not integer orderable or the dispersion is
    /// zero.
    pub fn try_new(key_type: DataType, dispersion: u32, kv: Box<dyn OrderedKv>) -> Result<Self> {
        JoinKey::check_datatype(key_type)?;
        if dispersion == 0 {
            return Err(FlowError::configuration("Dispersion must be at least 1"));
        }

        Ok(SkewedStore {
            key_type,
            dispersion: dispersion as i128,
            kv,
            rng: StdRng::from_os_rng(),
            len: 0,
        })
    }

    /// Use a fixed seed for choosing physical keys.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn key_type(&self) -> DataType {
        self.key_type
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of physical entries backing the store.
    pub fn num_physical_entries(&self) -> usize {
        self.kv.num_entries()
    }

    /// Append a value under a logical key.
    pub fn put(&mut self, key: JoinKey, value: &str) -> Result<()> {
        self.check_key(key)?;
        if value.contains(VALUE_DELIMITER) {
            return Err(FlowError::storage("Value contains the store delimiter"));
        }

        let offset = self.rng.random_range(0..self.dispersion);
        let physical = key.to_orderable() as i128 * self.dispersion + offset;

        let value = match self.kv.get(physical)? {
            Some(mut existing) => {
                existing.push(VALUE_DELIMITER);
                existing.push_str(value);
                existing
            }
            None => value.to_string(),
        };
        self.kv.put(physical, value)?;
        self.len += 1;

        Ok(())
    }

    /// All values put under a key, in no particular order.
    pub fn get_all(&mut self, key: JoinKey) -> Result<Vec<String>> {
        self.check_key(key)?;
        self.get_range(Bound::Included(key), Bound::Included(key))
    }

    /// All values with keys in the given range.
    pub fn get_range(&mut self, low: Bound<JoinKey>, high: Bound<JoinKey>) -> Result<Vec<String>> {
        let low = map_bound(low, |k| k.to_orderable() as i128);
        let high = map_bound(high, |k| k.to_orderable() as i128);
        self.scan_logical(low, high)
    }

    /// All values with keys within `radius` of `key`.
    ///
    /// When not inclusive, keys exactly `radius` away are excluded.
    pub fn get_within(&mut self, key: JoinKey, radius: u64, inclusive: bool) -> Result<Vec<String>> {
        let center = key.to_orderable() as i128;
        let radius = radius as i128;
        let (low, high) = if inclusive {
            (Bound::Included(center - radius), Bound::Included(center + radius))
        } else {
            (Bound::Excluded(center - radius), Bound::Excluded(center + radius))
        };
        self.scan_logical(low, high)
    }

    /// Every value in the store.
    pub fn scan_all(&mut self) -> Result<Vec<String>> {
        self.scan_logical(Bound::Unbounded, Bound::Unbounded)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.kv.flush()
    }

    fn check_key(&self, key: JoinKey) -> Result<()> {
        let ok = match (self.key_type, key) {
            (DataType::Int64, JoinKey::Integer(_)) => true,
            (expected, key) => expected == key.datatype(),
        };
        if !ok {
            return Err(FlowError::storage("Key type does not match store key type")
                .with_field("expected", self.key_type)
                .with_field("got", key.datatype()));
        }
        Ok(())
    }

    /// Scan using logical bounds, mapping them to physical bounds.
    fn scan_logical(&mut self, low: Bound<i128>, high: Bound<i128>) -> Result<Vec<String>> {
        let d = self.dispersion;
        let low = match low {
            Bound::Unbounded => i128::MIN,
            Bound::Included(k) => k * d,
            Bound::Excluded(k) => (k + 1) * d,
        };
        // Exclusive upper bound.
        let high = match high {
            Bound::Unbounded => i128::MAX,
            Bound::Included(k) => (k + 1) * d,
            Bound::Excluded(k) => k * d,
        };

        let entries = self.kv.scan(low, high)?;
        let mut values = Vec::with_capacity(entries.len());
        for entry in entries {
            values.extend(entry.split(VALUE_DELIMITER).map(|s| s.to_string()));
        }

        Ok(values)
    }
}

fn map_bound<T, U>(bound: Bound<T>, f: impl FnOnce(T) -> U) -> Bound<U> {
    match bound {
        Bound::Included(v) => Bound::Included(f(v)),
        Bound::Excluded(v) => Bound::Excluded(f(v)),
        Bound::Unbounded => Bound::Unbounded,
    }
}
