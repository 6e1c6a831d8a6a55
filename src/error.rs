//! Error types for the state history.

use crate::types::{Quark, Timestamp, ValueType};
use thiserror::Error;

/// Main error type for state history operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of order write on {quark}: time {time} is not after {last_end}")]
    OutOfOrder {
        quark: Quark,
        time: Timestamp,
        last_end: Timestamp,
    },

    #[error("Time {time} is outside of the store range [{start}, {end}]")]
    TimeRange {
        time: Timestamp,
        start: Timestamp,
        end: Timestamp,
    },

    #[error("Store is closed, no further writes are accepted")]
    ClosedStore,

    #[error("Attribute {0} is not currently acquired from the pool")]
    NotInUse(Quark),

    #[error("This backend keeps no history, only the ongoing state can be queried")]
    NoHistory,

    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Invalid attribute quark: {0}")]
    InvalidQuark(Quark),

    #[error("Invalid interval: start {start} is after end {end}")]
    InvalidInterval { start: Timestamp, end: Timestamp },

    #[error("State value type mismatch on {quark}: expected {expected}, got {got}")]
    StateValueType {
        quark: Quark,
        expected: ValueType,
        got: ValueType,
    },

    #[error("Version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("Invalid history format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("History file is locked by another writer")]
    Locked,

    #[error("No target state system has been assigned to the provider")]
    ProviderNotAssigned,

    #[error("A target state system is already assigned to the provider")]
    ProviderAlreadyAssigned,

    #[error("Event pipeline is closed")]
    PipelineClosed,

    #[error("Build was cancelled")]
    Cancelled,

    #[error("State history build failed: {0}")]
    BuildFailed(String),

    #[error("State system has been disposed")]
    Disposed,

    #[error("No analysis registered under id: {0}")]
    AnalysisNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StateError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StateError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StateError::Deserialization(e.to_string())
    }
}

/// Result type for state history operations.
pub type Result<T> = std::result::Result<T, StateError>;
