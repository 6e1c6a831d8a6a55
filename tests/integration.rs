//! Integration tests for building and querying state histories.

use statehistory::{
    AttributeValueProvider, BackendType, FutureChange, HistoryFileBackend, InMemoryBackend,
    ModuleConfig, ProviderContext, ProviderPipeline, Quark, StateProvider, StateSystem,
    StateSystemModule, StateValue, TraceEvent, VecEventSource,
};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn scenario_events() -> Vec<TraceEvent> {
    vec![
        TraceEvent::new(0, &["A"], 1),
        TraceEvent::new(10, &["A"], 2),
        TraceEvent::new(20, &["A"], StateValue::Null),
        TraceEvent::new(30, &["B"], 5),
    ]
}

fn in_memory_pipeline() -> (ProviderPipeline, Arc<StateSystem>) {
    let provider = AttributeValueProvider::new("scenario", 1);
    let pipeline = ProviderPipeline::new(Box::new(provider), 16);
    let ss = Arc::new(StateSystem::new(Box::new(InMemoryBackend::new("scenario", 0))));
    pipeline.assign_target(Arc::clone(&ss)).unwrap();
    (pipeline, ss)
}

// --- Scenario ---

#[test]
fn test_scenario_while_building() {
    let (pipeline, ss) = in_memory_pipeline();
    for event in scenario_events() {
        pipeline.process_event(event).unwrap();
    }
    pipeline.wait_for_empty_queue().unwrap();

    let a = ss.quark_absolute(&["A"]).unwrap();

    let first = ss.query_single_state(5, a).unwrap();
    assert_eq!(first.value, StateValue::Int(1));
    assert_eq!((first.start, first.end), (0, 9));

    let second = ss.query_single_state(15, a).unwrap();
    assert_eq!(second.value, StateValue::Int(2));
    assert_eq!((second.start, second.end), (10, 19));

    let removed = ss.query_single_state(25, a).unwrap();
    assert!(removed.value.is_null());
    assert_eq!(removed.start, 20);
    assert!(removed.is_ongoing());

    pipeline.dispose();
}

#[test]
fn test_scenario_after_close() {
    let (pipeline, ss) = in_memory_pipeline();
    for event in scenario_events() {
        pipeline.process_event(event).unwrap();
    }
    pipeline.dispose();
    assert!(ss.wait_until_built());

    let a = ss.quark_absolute(&["A"]).unwrap();
    let b = ss.quark_absolute(&["B"]).unwrap();

    let removed = ss.query_single_state(25, a).unwrap();
    assert!(removed.value.is_null());
    assert_eq!((removed.start, removed.end), (20, 30));

    let b_before = ss.query_single_state(10, b).unwrap();
    assert!(b_before.value.is_null());
    assert_eq!((b_before.start, b_before.end), (0, 29));

    let full = ss.query_full_state(30).unwrap();
    assert_eq!(full.len(), 2);
    assert_eq!(full[b.index()].value, StateValue::Int(5));
    assert!(full.iter().all(|i| !i.is_ongoing()));
}

#[test]
fn test_history_range_clamps() {
    let (pipeline, ss) = in_memory_pipeline();
    for event in scenario_events() {
        pipeline.process_event(event).unwrap();
    }
    pipeline.dispose();

    let a = ss.quark_absolute(&["A"]).unwrap();
    let range = ss.query_history_range(a, -100, 1_000, 0).unwrap();
    let bounds: Vec<_> = range.iter().map(|i| (i.start, i.end)).collect();
    assert_eq!(bounds, vec![(0, 9), (10, 19), (20, 30)]);

    // Single-state queries stay strict.
    assert!(ss.query_single_state(-1, a).is_err());
    assert!(ss.query_single_state(31, a).is_err());
}

#[test]
fn test_history_range_resolution() {
    let ss = StateSystem::new(Box::new(InMemoryBackend::new("res", 0)));
    let q = ss.quark_absolute_and_add(&["CPU"]).unwrap();
    for t in 0..100 {
        ss.modify_attribute(t, StateValue::Long(t), q).unwrap();
    }
    ss.close_history(99).unwrap();

    let exact = ss.query_history_range(q, 0, 99, 0).unwrap();
    assert_eq!(exact.len(), 100);

    let sampled = ss.query_history_range(q, 0, 99, 10).unwrap();
    let starts: Vec<_> = sampled.iter().map(|i| i.start).collect();
    assert_eq!(starts, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 99]);
}

// --- Concurrent readers ---

#[test]
fn test_reader_never_sees_missing_state_during_close() {
    for _ in 0..10 {
        let ss = StateSystem::new(Box::new(InMemoryBackend::new("close", 0)));
        let quarks: Vec<Quark> = (0..2000)
            .map(|i| {
                let q = ss.quark_absolute_and_add(&["Threads", i.to_string().as_str()]).unwrap();
                ss.modify_attribute(0, StateValue::Int(i), q).unwrap();
                q
            })
            .collect();
        let clock = ss.quark_absolute_and_add(&["Clock"]).unwrap();
        ss.modify_attribute(8, StateValue::Long(8), clock).unwrap();
        let last = *quarks.last().unwrap();
        let started = Barrier::new(2);

        let failures = thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut failures = Vec::new();
                started.wait();
                loop {
                    let built = ss.is_built();
                    match ss.query_single_state(7, last) {
                        Ok(interval) => assert_eq!(interval.value, StateValue::Int(1999)),
                        Err(e) => failures.push(e.to_string()),
                    }
                    if built {
                        break;
                    }
                }
                failures
            });
            started.wait();
            ss.close_history(10).unwrap();
            reader.join().unwrap()
        });

        assert!(failures.is_empty(), "reads failed during close: {:?}", failures);
        assert_eq!(ss.query_single_state(7, last).unwrap().end, 10);
    }
}

// --- Full backend round trip ---

#[test]
fn test_full_history_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("round.ht");

    let expected: Vec<Vec<_>> = {
        let backend = HistoryFileBackend::create("round", &path, 3, 0, 64).unwrap();
        let ss = StateSystem::new(Box::new(backend));
        let cpus: Vec<Quark> = (0..4)
            .map(|i| ss.quark_absolute_and_add(&["CPUs", i.to_string().as_str()]).unwrap())
            .collect();
        for t in 0..200i64 {
            let cpu = cpus[(t % 4) as usize];
            ss.modify_attribute(t, StateValue::Int((t % 7) as i32), cpu).unwrap();
        }
        ss.close_history(250).unwrap();
        let snapshots = (0..=250).step_by(13).map(|t| ss.query_full_state(t).unwrap()).collect();
        ss.dispose();
        snapshots
    };

    let backend = HistoryFileBackend::open("round", &path, 3, 64).unwrap();
    let reopened = StateSystem::open_existing(Box::new(backend)).unwrap();
    assert!(reopened.is_built());
    assert_eq!(reopened.full_attribute_path(Quark(1)).unwrap(), "CPUs/0");

    let actual: Vec<Vec<_>> = (0..=250)
        .step_by(13)
        .map(|t| reopened.query_full_state(t).unwrap())
        .collect();
    assert_eq!(actual, expected);
}

// --- Stack attributes through a provider ---

/// Pushes on `enter`, pops on `exit`, and schedules a timeout reset.
struct CallStackProvider;

impl StateProvider for CallStackProvider {
    fn id(&self) -> &str {
        "callstack"
    }

    fn version(&self) -> u32 {
        1
    }

    fn event_handle(
        &mut self,
        event: &TraceEvent,
        ctx: &mut ProviderContext<'_>,
    ) -> statehistory::Result<()> {
        let stack = ctx.quark_absolute_and_add(&["Threads", "1", "CallStack"])?;
        let status = ctx.quark_absolute_and_add(&["Threads", "1", "Status"])?;
        match event.path[0].as_str() {
            "enter" => {
                ctx.push_attribute(event.timestamp, event.value.clone(), stack)?;
                ctx.modify_attribute(event.timestamp, StateValue::from("busy"), status)?;
                ctx.add_future_event(
                    event.timestamp + 1_000,
                    status,
                    FutureChange::Modify(StateValue::from("idle")),
                );
            }
            "exit" => {
                ctx.pop_attribute(event.timestamp, stack)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn new_instance(&self) -> Box<dyn StateProvider> {
        Box::new(CallStackProvider)
    }
}

#[test]
fn test_call_stack_provider() {
    let events = vec![
        TraceEvent::new(0, &["enter"], "main"),
        TraceEvent::new(5, &["enter"], "parse"),
        TraceEvent::new(9, &["exit"], StateValue::Null),
        TraceEvent::new(12, &["exit"], StateValue::Null),
        TraceEvent::new(2_000, &["exit"], StateValue::Null),
    ];
    let config = ModuleConfig::new("callstack").with_backend(BackendType::InMemory);
    let module = StateSystemModule::new(
        config,
        Arc::new(|| Box::new(CallStackProvider) as Box<dyn StateProvider>),
        Arc::new(VecEventSource::from_events(events).unwrap()),
    );
    module.execute().unwrap();

    let ss = module.state_system().unwrap();
    let stack = ss.quark_absolute(&["Threads", "1", "CallStack"]).unwrap();
    let status = ss.quark_absolute(&["Threads", "1", "Status"]).unwrap();
    let top = ss.quark_relative(stack, &["2"]).unwrap();

    assert_eq!(ss.query_single_state(6, stack).unwrap().value, StateValue::Int(2));
    assert_eq!(ss.query_single_state(6, top).unwrap().value, StateValue::from("parse"));
    assert!(ss.query_single_state(10, top).unwrap().value.is_null());
    assert!(ss.query_single_state(12, stack).unwrap().value.is_null());

    assert_eq!(ss.query_single_state(500, status).unwrap().value, StateValue::from("busy"));
    assert_eq!(ss.query_single_state(1_005, status).unwrap().value, StateValue::from("idle"));
}

#[test]
fn test_wildcard_quarks() {
    let ss = StateSystem::new(Box::new(InMemoryBackend::new("wild", 0)));
    for cpu in ["0", "1", "2"] {
        ss.quark_absolute_and_add(&["CPUs", cpu, "Status"]).unwrap();
        ss.quark_absolute_and_add(&["CPUs", cpu, "Current_thread"]).unwrap();
    }

    let statuses = ss.quarks(None, &["CPUs", "*", "Status"]).unwrap();
    assert_eq!(statuses.len(), 3);
    for q in &statuses {
        assert_eq!(ss.attribute_name(*q).unwrap(), "Status");
    }

    let cpus = ss.quarks(None, &["CPUs", "*", "Status", ".."]).unwrap();
    let names: Vec<_> = cpus.iter().map(|q| ss.attribute_name(*q).unwrap()).collect();
    assert_eq!(names, vec!["0", "1", "2"]);
}
