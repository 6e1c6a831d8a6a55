//! Error handling tests: every failure is a typed error, never a panic.

use statehistory::{
    AttributeTree, HistoryFileBackend, InMemoryBackend, NullBackend, Quark, StateError,
    StateSystem, StateValue, ValueType,
};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use tempfile::TempDir;

fn in_memory() -> StateSystem {
    StateSystem::new(Box::new(InMemoryBackend::new("errors", 0)))
}

// --- Writes ---

#[test]
fn test_out_of_order_write() {
    let ss = in_memory();
    let q = ss.quark_absolute_and_add(&["A"]).unwrap();
    ss.modify_attribute(10, StateValue::Int(1), q).unwrap();

    let err = ss.modify_attribute(5, StateValue::Int(2), q).unwrap_err();
    assert!(matches!(
        err,
        StateError::OutOfOrder { time: 5, last_end: 9, .. }
    ));
    assert!(err.to_string().contains("Out of order"));
}

#[test]
fn test_write_after_close() {
    let ss = in_memory();
    let q = ss.quark_absolute_and_add(&["A"]).unwrap();
    ss.modify_attribute(0, StateValue::Int(1), q).unwrap();
    ss.close_history(10).unwrap();

    assert!(matches!(
        ss.modify_attribute(20, StateValue::Int(2), q),
        Err(StateError::ClosedStore)
    ));
    assert!(matches!(
        ss.insert_past_state(q, 11, 15, StateValue::Int(3)),
        Err(StateError::ClosedStore)
    ));
}

#[test]
fn test_value_type_mismatch() {
    let ss = in_memory();
    let q = ss.quark_absolute_and_add(&["A"]).unwrap();
    ss.modify_attribute(0, StateValue::Int(1), q).unwrap();
    ss.modify_attribute(1, StateValue::Null, q).unwrap();

    let err = ss.modify_attribute(2, StateValue::from("text"), q).unwrap_err();
    assert!(matches!(
        err,
        StateError::StateValueType {
            expected: ValueType::Int,
            got: ValueType::String,
            ..
        }
    ));
}

#[test]
fn test_invalid_quark() {
    let ss = in_memory();
    assert!(matches!(
        ss.modify_attribute(0, StateValue::Int(1), Quark(42)),
        Err(StateError::InvalidQuark(Quark(42)))
    ));
    assert!(matches!(
        ss.query_ongoing(Quark::INVALID),
        Err(StateError::InvalidQuark(_))
    ));
}

#[test]
fn test_invalid_past_interval() {
    let ss = in_memory();
    let q = ss.quark_absolute_and_add(&["A"]).unwrap();
    assert!(matches!(
        ss.insert_past_state(q, 10, 5, StateValue::Int(1)),
        Err(StateError::InvalidInterval { start: 10, end: 5 })
    ));
}

// --- Queries ---

#[test]
fn test_missing_attribute() {
    let ss = in_memory();
    assert!(matches!(
        ss.quark_absolute(&["nope", "missing"]),
        Err(StateError::AttributeNotFound(path)) if path == "nope/missing"
    ));
    assert!(ss.opt_quark_absolute(&["nope"]).is_none());
}

#[test]
fn test_query_out_of_range() {
    let ss = in_memory();
    let q = ss.quark_absolute_and_add(&["A"]).unwrap();
    ss.modify_attribute(0, StateValue::Int(1), q).unwrap();
    ss.modify_attribute(50, StateValue::Int(2), q).unwrap();

    assert!(matches!(
        ss.query_single_state(51, q),
        Err(StateError::TimeRange { time: 51, start: 0, end: 50 })
    ));
    assert!(ss.query_full_state(-5).is_err());

    // Queries never poison the store.
    ss.modify_attribute(60, StateValue::Int(3), q).unwrap();
    assert_eq!(ss.query_single_state(55, q).unwrap().value, StateValue::Int(2));
}

#[test]
fn test_history_range_entirely_outside() {
    let ss = in_memory();
    let q = ss.quark_absolute_and_add(&["A"]).unwrap();
    ss.modify_attribute(0, StateValue::Int(1), q).unwrap();
    ss.close_history(100).unwrap();

    assert!(matches!(
        ss.query_history_range(q, 200, 300, 0),
        Err(StateError::TimeRange { .. })
    ));
}

#[test]
fn test_null_backend_has_no_history() {
    let ss = StateSystem::new(Box::new(NullBackend::new("null", 0)));
    let q = ss.quark_absolute_and_add(&["A"]).unwrap();
    ss.modify_attribute(0, StateValue::Int(1), q).unwrap();
    ss.modify_attribute(10, StateValue::Int(2), q).unwrap();

    assert!(matches!(ss.query_single_state(5, q), Err(StateError::NoHistory)));
    let now = ss.query_single_state(10, q).unwrap();
    assert_eq!(now.value, StateValue::Int(2));
    assert_eq!(ss.query_ongoing(q).unwrap(), StateValue::Int(2));
}

#[test]
fn test_disposed_state_system() {
    let ss = in_memory();
    let q = ss.quark_absolute_and_add(&["A"]).unwrap();
    ss.modify_attribute(0, StateValue::Int(1), q).unwrap();
    ss.dispose();

    assert!(matches!(ss.query_single_state(0, q), Err(StateError::Disposed)));
    assert!(matches!(ss.query_full_state(0), Err(StateError::Disposed)));
    assert!(!ss.wait_until_built());
}

// --- Files ---

#[test]
fn test_reopen_missing_file() {
    let dir = TempDir::new().unwrap();
    let result = HistoryFileBackend::open("missing", dir.path().join("missing.ht"), 1, 16);
    assert!(matches!(result, Err(StateError::Io(_))));
}

#[test]
fn test_reopen_garbage_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.ht");
    std::fs::write(&path, vec![0xAB; 200]).unwrap();

    let result = HistoryFileBackend::open("garbage", &path, 1, 16);
    assert!(matches!(result, Err(StateError::InvalidFormat(_))));
}

#[test]
fn test_reopen_truncated_footer() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trunc.ht");
    {
        let backend = HistoryFileBackend::create("trunc", &path, 1, 0, 16).unwrap();
        let ss = StateSystem::new(Box::new(backend));
        let q = ss.quark_absolute_and_add(&["A"]).unwrap();
        ss.modify_attribute(0, StateValue::Int(1), q).unwrap();
        ss.close_history(10).unwrap();
        ss.dispose();
    }

    let len = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 4).unwrap();

    let result = HistoryFileBackend::open("trunc", &path, 1, 16);
    assert!(matches!(result, Err(StateError::InvalidFormat(_))));
}

#[test]
fn test_reopen_flipped_footer_byte() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flip.ht");
    {
        let backend = HistoryFileBackend::create("flip", &path, 1, 0, 16).unwrap();
        let ss = StateSystem::new(Box::new(backend));
        let q = ss.quark_absolute_and_add(&["A"]).unwrap();
        ss.modify_attribute(0, StateValue::Int(1), q).unwrap();
        ss.close_history(10).unwrap();
        ss.dispose();
    }

    let len = std::fs::metadata(&path).unwrap().len();
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(len - 1)).unwrap();
    file.write_all(&[0xFF]).unwrap();

    let result = HistoryFileBackend::open("flip", &path, 1, 16);
    assert!(matches!(result, Err(StateError::ChecksumMismatch { .. })));
}

#[test]
fn test_attribute_tree_bad_bytes() {
    assert!(matches!(
        AttributeTree::from_bytes(&[0xC1, 0x00, 0x13]),
        Err(StateError::Deserialization(_))
    ));
}
