// Intervals - half-open [from, to) spans on either time axis
//
// Business time (validity) and transaction time (registration) share one
// interval type. Infinities are real variants, never sentinel dates, so they
// survive every operation and every serialization unchanged.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::fmt;
use std::str::FromStr;

use crate::error::{RegistryError, Result};

/// A point on either time axis
pub type Instant = DateTime<Utc>;

// ============================================================================
// BOUND
// ============================================================================

/// Interval endpoint. Variant order gives `-infinity < any instant < infinity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Bound {
    NegInfinity,
    At(Instant),
    PosInfinity,
}

impl Bound {
    pub fn instant(&self) -> Option<Instant> {
        match self {
            Bound::At(t) => Some(*t),
            _ => None,
        }
    }

    /// Lower bound from a nullable column/field: `None` means `-infinity`
    pub fn lower(value: Option<Instant>) -> Self {
        value.map_or(Bound::NegInfinity, Bound::At)
    }

    /// Upper bound from a nullable column/field: `None` means `infinity`
    pub fn upper(value: Option<Instant>) -> Self {
        value.map_or(Bound::PosInfinity, Bound::At)
    }
}

impl From<Instant> for Bound {
    fn from(t: Instant) -> Self {
        Bound::At(t)
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::NegInfinity => f.write_str("-infinity"),
            // fixed-width nanos keep lexical order equal to time order
            Bound::At(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            Bound::PosInfinity => f.write_str("infinity"),
        }
    }
}

impl FromStr for Bound {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "-infinity" => Ok(Bound::NegInfinity),
            "infinity" | "+infinity" => Ok(Bound::PosInfinity),
            other => DateTime::parse_from_rfc3339(other)
                .map(|dt| Bound::At(dt.with_timezone(&Utc)))
                .map_err(|e| RegistryError::Storage(format!("bad bound '{other}': {e}"))),
        }
    }
}

impl TryFrom<String> for Bound {
    type Error = RegistryError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Bound> for String {
    fn from(b: Bound) -> Self {
        b.to_string()
    }
}

// ============================================================================
// INTERVAL
// ============================================================================

/// Half-open `[from, to)` interval with `from < to` enforced on construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawInterval")]
pub struct Interval {
    from: Bound,
    to: Bound,
}

/// Business-time span of an attribute value
pub type ValidityInterval = Interval;

/// `[tx_start, tx_end)` of a registration; `tx_end = infinity` is the live one
pub type TransactionInterval = Interval;

#[derive(Deserialize)]
struct RawInterval {
    from: Bound,
    to: Bound,
}

impl TryFrom<RawInterval> for Interval {
    type Error = RegistryError;

    fn try_from(raw: RawInterval) -> Result<Self> {
        Interval::new(raw.from, raw.to)
    }
}

impl Interval {
    pub fn new(from: impl Into<Bound>, to: impl Into<Bound>) -> Result<Self> {
        let (from, to) = (from.into(), to.into());
        if from >= to {
            return Err(RegistryError::InvalidInterval {
                from,
                to,
                entity_id: None,
            });
        }
        Ok(Interval { from, to })
    }

    /// `[-infinity, infinity)`
    pub fn unbounded() -> Self {
        Interval {
            from: Bound::NegInfinity,
            to: Bound::PosInfinity,
        }
    }

    /// `[start, infinity)`
    pub fn starting_at(start: Instant) -> Self {
        Interval {
            from: Bound::At(start),
            to: Bound::PosInfinity,
        }
    }

    pub fn from(&self) -> Bound {
        self.from
    }

    pub fn to(&self) -> Bound {
        self.to
    }

    pub fn is_open_ended(&self) -> bool {
        self.to == Bound::PosInfinity
    }

    /// `from <= t < to`
    pub fn contains(&self, t: Instant) -> bool {
        let t = Bound::At(t);
        self.from <= t && t < self.to
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.from < other.to && other.from < self.to
    }

    /// True when `other` lies entirely inside `self`
    pub fn covers(&self, other: &Interval) -> bool {
        self.from <= other.from && other.to <= self.to
    }

    /// True when `self` ends exactly where `other` begins
    pub fn meets(&self, other: &Interval) -> bool {
        self.to == other.from
    }

    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        let from = max(self.from, other.from);
        let to = min(self.to, other.to);
        (from < to).then_some(Interval { from, to })
    }

    /// Parts of `self` not covered by `other`: zero, one or two intervals,
    /// head first.
    pub fn difference(&self, other: &Interval) -> Vec<Interval> {
        if !self.overlaps(other) {
            return vec![*self];
        }

        let mut parts = Vec::with_capacity(2);
        if self.from < other.from {
            parts.push(Interval {
                from: self.from,
                to: other.from,
            });
        }
        if other.to < self.to {
            parts.push(Interval {
                from: other.to,
                to: self.to,
            });
        }
        parts
    }

    /// Close an open-ended interval at `end`
    pub fn closed_at(&self, end: Instant) -> Result<Interval> {
        Interval::new(self.from, end)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> Instant {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_bound_ordering() {
        let t = Bound::At(date(2020, 1, 1));
        assert!(Bound::NegInfinity < t);
        assert!(t < Bound::PosInfinity);
        assert!(Bound::At(date(2019, 1, 1)) < t);
    }

    #[test]
    fn test_rejects_empty_and_inverted() {
        let t = date(2020, 1, 1);
        assert!(Interval::new(t, t).is_err());
        assert!(Interval::new(date(2021, 1, 1), t).is_err());
        assert!(Interval::new(Bound::PosInfinity, Bound::PosInfinity).is_err());
        assert!(Interval::new(Bound::NegInfinity, Bound::NegInfinity).is_err());
        assert!(Interval::new(Bound::NegInfinity, Bound::PosInfinity).is_ok());
    }

    #[test]
    fn test_contains_is_half_open() {
        let iv = Interval::new(date(2020, 1, 1), date(2021, 1, 1)).unwrap();
        assert!(iv.contains(date(2020, 1, 1)));
        assert!(iv.contains(date(2020, 6, 1)));
        assert!(!iv.contains(date(2021, 1, 1)));
        assert!(Interval::unbounded().contains(date(1, 1, 1)));
    }

    #[test]
    fn test_difference_splits_around_hole() {
        let outer = Interval::new(date(2015, 1, 1), date(2019, 1, 1)).unwrap();
        let hole = Interval::new(date(2016, 1, 1), date(2018, 1, 1)).unwrap();

        let parts = outer.difference(&hole);
        assert_eq!(
            parts,
            vec![
                Interval::new(date(2015, 1, 1), date(2016, 1, 1)).unwrap(),
                Interval::new(date(2018, 1, 1), date(2019, 1, 1)).unwrap(),
            ]
        );
        assert!(hole.difference(&outer).is_empty());
    }

    #[test]
    fn test_difference_with_infinities() {
        let all = Interval::unbounded();
        let middle = Interval::new(date(2000, 1, 1), date(2001, 1, 1)).unwrap();

        let parts = all.difference(&middle);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].from(), Bound::NegInfinity);
        assert_eq!(parts[1].to(), Bound::PosInfinity);
    }

    #[test]
    fn test_intersect() {
        let a = Interval::starting_at(date(2020, 1, 1));
        let b = Interval::new(Bound::NegInfinity, date(2021, 1, 1)).unwrap();
        assert_eq!(
            a.intersect(&b),
            Some(Interval::new(date(2020, 1, 1), date(2021, 1, 1)).unwrap())
        );

        let c = Interval::new(Bound::NegInfinity, date(2020, 1, 1)).unwrap();
        assert_eq!(a.intersect(&c), None);
        assert!(c.meets(&a));
    }

    #[test]
    fn test_bound_string_round_trip() {
        for bound in [
            Bound::NegInfinity,
            Bound::PosInfinity,
            Bound::At(date(1970, 1, 1)),
            Bound::At(Utc.timestamp_opt(1_690_000_000, 123_456_789).unwrap()),
        ] {
            let text = bound.to_string();
            assert_eq!(text.parse::<Bound>().unwrap(), bound, "{text}");
        }
    }

    #[test]
    fn test_interval_json_rejects_inverted() {
        let ok: Interval =
            serde_json::from_str(r#"{"from":"-infinity","to":"infinity"}"#).unwrap();
        assert_eq!(ok, Interval::unbounded());

        let bad = serde_json::from_str::<Interval>(r#"{"from":"infinity","to":"-infinity"}"#);
        assert!(bad.is_err());
    }
}
