use std::fmt;
use std::str::FromStr;

use thetaflow_error::{FlowError, Result};

/// Restricts which pairs may join based on the ingest time of each tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinWindow {
    #[default]
    Unbounded,
    /// Pairs whose ingest times are at most `range_ms` apart.
    Sliding { range_ms: u64 },
    /// Pairs whose ingest times fall in the same `size_ms` window.
    Tumbling { size_ms: u64 },
}

impl JoinWindow {
    pub fn admits(&self, left_ms: u64, right_ms: u64) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Sliding { range_ms } => left_ms.abs_diff(right_ms) <= *range_ms,
            Self::Tumbling { size_ms } => left_ms / size_ms == right_ms / size_ms,
        }
    }
}

impl FromStr for JoinWindow {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unbounded") {
            return Ok(Self::Unbounded);
        }

        let (kind, ms) = s.split_once(':').ok_or_else(|| {
            FlowError::configuration("Invalid window, expected 'unbounded', 'sliding:<ms>' or 'tumbling:<ms>'")
                .with_field("window", s)
        })?;
        let ms: u64 = ms.trim().parse().map_err(|_| {
            FlowError::configuration("Invalid window duration").with_field("window", s)
        })?;

        match kind.trim().to_ascii_lowercase().as_str() {
            "sliding" => Ok(Self::Sliding { range_ms: ms }),
            "tumbling" => {
                if ms == 0 {
                    return Err(FlowError::configuration("Tumbling window size must be non-zero"));
                }
                Ok(Self::Tumbling { size_ms: ms })
            }
            other => Err(FlowError::configuration("Unknown window kind").with_field("kind", other)),
        }
    }
}

impl fmt::Display for JoinWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => write!(f, "unbounded"),
            Self::Sliding { range_ms } => write!(f, "sliding:{range_ms}"),
            Self::Tumbling { size_ms } => write!(f, "tumbling:{size_ms}"),
        }
    }
}
