use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical condition over the rows of one table, used for range scans,
/// predicate (range) locks, and serializable phantom validation.
///
/// `KeyRange` is half-open `[start, end)` over primary keys; `ColumnRange`
/// is closed `[min, max]` over a column's values, so `prix >= 5` is
/// `ColumnRange { column: "prix", min: Some(5), max: None }`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Predicate {
    /// Every row of the table.
    All,
    KeyRange {
        start: Option<Value>,
        end: Option<Value>,
    },
    ColumnRange {
        column: String,
        min: Option<Value>,
        max: Option<Value>,
    },
}

impl Predicate {
    /// Equality over a single column.
    pub fn column_eq(column: impl Into<String>, value: Value) -> Self {
        let column = column.into();
        Predicate::ColumnRange {
            column,
            min: Some(value.clone()),
            max: Some(value),
        }
    }

    /// Single primary key.
    pub fn key(key: Value) -> Self {
        let end = key.clone();
        Predicate::KeyRange {
            start: Some(key),
            end: Some(end),
        }
    }

    /// Whether a primary key alone decides a match. `ColumnRange` cannot be
    /// decided from the key, so this answers conservatively (`true`).
    pub fn matches_key(&self, key: &Value) -> bool {
        match self {
            Predicate::All => true,
            Predicate::KeyRange { start, end } => key_in_range(key, start.as_ref(), end.as_ref()),
            Predicate::ColumnRange { .. } => true,
        }
    }

    /// Precise match against a full row image.
    pub fn matches_row(&self, key: &Value, values: &Row) -> bool {
        match self {
            Predicate::All => true,
            Predicate::KeyRange { start, end } => key_in_range(key, start.as_ref(), end.as_ref()),
            Predicate::ColumnRange { column, min, max } => match values.get(column) {
                Some(v) => value_in_closed_range(v, min.as_ref(), max.as_ref()),
                None => false,
            },
        }
    }

    /// Whether two predicates could both match some row. Undecidable pairs
    /// (different columns, key range vs column range) answer `true`.
    pub fn overlaps(&self, other: &Predicate) -> bool {
        match (self, other) {
            (Predicate::All, _) | (_, Predicate::All) => true,
            (
                Predicate::KeyRange { start: s1, end: e1 },
                Predicate::KeyRange { start: s2, end: e2 },
            ) => half_open_ranges_overlap(s1.as_ref(), e1.as_ref(), s2.as_ref(), e2.as_ref()),
            (
                Predicate::ColumnRange {
                    column: c1,
                    min: lo1,
                    max: hi1,
                },
                Predicate::ColumnRange {
                    column: c2,
                    min: lo2,
                    max: hi2,
                },
            ) => {
                if c1 != c2 {
                    return true;
                }
                closed_ranges_overlap(lo1.as_ref(), hi1.as_ref(), lo2.as_ref(), hi2.as_ref())
            }
            (Predicate::KeyRange { .. }, Predicate::ColumnRange { .. })
            | (Predicate::ColumnRange { .. }, Predicate::KeyRange { .. }) => true,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => write!(f, "*"),
            Predicate::KeyRange { start, end } => {
                write!(f, "key in [")?;
                match start {
                    Some(v) => write!(f, "{}", v)?,
                    None => write!(f, "-inf")?,
                }
                write!(f, ", ")?;
                match end {
                    Some(v) => write!(f, "{}", v)?,
                    None => write!(f, "+inf")?,
                }
                write!(f, "]")
            }
            Predicate::ColumnRange { column, min, max } => match (min, max) {
                (Some(lo), Some(hi)) if lo == hi => write!(f, "{} = {}", column, lo),
                (Some(lo), Some(hi)) => write!(f, "{} between {} and {}", column, lo, hi),
                (Some(lo), None) => write!(f, "{} >= {}", column, lo),
                (None, Some(hi)) => write!(f, "{} <= {}", column, hi),
                (None, None) => write!(f, "{} is anything", column),
            },
        }
    }
}

fn key_in_range(key: &Value, start: Option<&Value>, end: Option<&Value>) -> bool {
    // Degenerate single-key range: start == end matches exactly that key.
    if let (Some(s), Some(e)) = (start, end) {
        if s == e {
            return key == s;
        }
    }
    match (start, end) {
        (None, None) => true,
        (Some(s), None) => key >= s,
        (None, Some(e)) => key < e,
        (Some(s), Some(e)) => key >= s && key < e,
    }
}

fn value_in_closed_range(v: &Value, min: Option<&Value>, max: Option<&Value>) -> bool {
    match (min, max) {
        (None, None) => true,
        (Some(lo), None) => v >= lo,
        (None, Some(hi)) => v <= hi,
        (Some(lo), Some(hi)) => v >= lo && v <= hi,
    }
}

fn half_open_ranges_overlap(
    s1: Option<&Value>,
    e1: Option<&Value>,
    s2: Option<&Value>,
    e2: Option<&Value>,
) -> bool {
    let start = match (s1, s2) {
        (None, s) | (s, None) => s,
        (Some(a), Some(b)) => Some(a.max(b)),
    };
    let end = match (e1, e2) {
        (None, e) | (e, None) => e,
        (Some(a), Some(b)) => Some(a.min(b)),
    };
    match (start, end) {
        (Some(s), Some(e)) => s <= e,
        _ => true,
    }
}

fn closed_ranges_overlap(
    lo1: Option<&Value>,
    hi1: Option<&Value>,
    lo2: Option<&Value>,
    hi2: Option<&Value>,
) -> bool {
    let lo = match (lo1, lo2) {
        (None, l) | (l, None) => l,
        (Some(a), Some(b)) => Some(a.max(b)),
    };
    let hi = match (hi1, hi2) {
        (None, h) | (h, None) => h,
        (Some(a), Some(b)) => Some(a.min(b)),
    };
    match (lo, hi) {
        (Some(l), Some(h)) => l <= h,
        _ => true,
    }
}
