//! Core types for the state history.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Nanoseconds, signed. Both ends of an interval are inclusive.
pub type Timestamp = i64;

/// Handle of one attribute in the attribute tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Quark(pub u32);

impl Quark {
    /// Sentinel for "no attribute". Never handed out by a tree.
    pub const INVALID: Quark = Quark(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Position of this attribute in per-attribute tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Quark(index as u32)
    }
}

impl fmt::Debug for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Quark({})", self.0)
        } else {
            write!(f, "Quark(INVALID)")
        }
    }
}

impl fmt::Display for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of a non-null state value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Long,
    Double,
    String,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Double => "double",
            ValueType::String => "string",
        };
        f.write_str(name)
    }
}

/// The value an attribute holds during an interval.
///
/// `Null` means "no information", which is distinct from zero or an empty
/// string.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub enum StateValue {
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl StateValue {
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Type of the value, `None` for null.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            StateValue::Null => None,
            StateValue::Int(_) => Some(ValueType::Int),
            StateValue::Long(_) => Some(ValueType::Long),
            StateValue::Double(_) => Some(ValueType::Double),
            StateValue::String(_) => Some(ValueType::String),
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            StateValue::Long(v) => Some(*v),
            StateValue::Int(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            StateValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Null => f.write_str("null"),
            StateValue::Int(v) => write!(f, "{}", v),
            StateValue::Long(v) => write!(f, "{}", v),
            StateValue::Double(v) => write!(f, "{}", v),
            StateValue::String(v) => f.write_str(v),
        }
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Int(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Long(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Double(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::String(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::String(v)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(StateValue::Null)
    }
}

/// One stored state: `quark` held `value` from `start` to `end`, inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub quark: Quark,
    pub start: Timestamp,
    pub end: Timestamp,
    pub value: StateValue,
}

impl Interval {
    pub fn new(quark: Quark, start: Timestamp, end: Timestamp, value: StateValue) -> Self {
        Self {
            quark,
            start,
            end,
            value,
        }
    }

    /// Whether `t` falls inside this interval.
    pub fn intersects(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    /// An interval still open in the ongoing state of a store being built.
    pub fn is_ongoing(&self) -> bool {
        self.end == Timestamp::MAX
    }
}

/// Inclusive time range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range covering every representable timestamp.
    pub fn eternity() -> Self {
        Self {
            start: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }
}

/// An event as delivered by the upstream source: at `timestamp`, the
/// attribute at `path` takes `value`.
///
/// Providers decide what an event means; the pipeline only looks at the
/// timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: Timestamp,
    pub path: Vec<String>,
    pub value: StateValue,
}

impl TraceEvent {
    pub fn new<S: AsRef<str>>(timestamp: Timestamp, path: &[S], value: impl Into<StateValue>) -> Self {
        Self {
            timestamp,
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
            value: value.into(),
        }
    }
}

/// Storage strategy of a state history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// Every interval persisted to an on-disk history file.
    #[default]
    Full,
    /// Only checkpoint-crossing intervals on disk, the rest re-simulated.
    Partial,
    /// Every interval kept in memory.
    InMemory,
    /// No history, only the ongoing state.
    Null,
}

impl BackendType {
    /// Whether this strategy writes a history file.
    pub fn is_on_disk(self) -> bool {
        matches!(self, BackendType::Full | BackendType::Partial)
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendType::Full => "FULL",
            BackendType::Partial => "PARTIAL",
            BackendType::InMemory => "INMEM",
            BackendType::Null => "NULL",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackendType::Full),
            "partial" => Ok(BackendType::Partial),
            "inmem" | "in_memory" | "inmemory" => Ok(BackendType::InMemory),
            "null" => Ok(BackendType::Null),
            other => Err(format!("unknown backend type: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quark_sentinel() {
        assert!(Quark(0).is_valid());
        assert!(!Quark::INVALID.is_valid());
        assert_eq!(format!("{:?}", Quark::INVALID), "Quark(INVALID)");
    }

    #[test]
    fn test_interval_intersects() {
        let interval = Interval::new(Quark(0), 10, 19, StateValue::Int(2));
        assert!(interval.intersects(10));
        assert!(interval.intersects(19));
        assert!(!interval.intersects(20));
        assert!(!interval.is_ongoing());
    }

    #[test]
    fn test_value_types() {
        assert_eq!(StateValue::Null.value_type(), None);
        assert_eq!(StateValue::from(3).value_type(), Some(ValueType::Int));
        assert_eq!(StateValue::from("x").value_type(), Some(ValueType::String));
        assert_eq!(StateValue::from(None::<i64>), StateValue::Null);
        assert_eq!(StateValue::Int(4).as_long(), Some(4));
    }

    #[test]
    fn test_backend_type_names() {
        assert_eq!(BackendType::InMemory.to_string(), "INMEM");
        assert_eq!("partial".parse::<BackendType>(), Ok(BackendType::Partial));
        assert!("bogus".parse::<BackendType>().is_err());
        assert!(BackendType::Full.is_on_disk());
        assert!(!BackendType::Null.is_on_disk());
    }
}
