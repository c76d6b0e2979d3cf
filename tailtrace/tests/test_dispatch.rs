use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tailtrace::aggregation::AggregationTable;
use tailtrace::codec::Record;
use tailtrace::dispatch::handlers::{default_bindings, Binding, Greetings, HandlerRegistry};
use tailtrace::dispatch::{handler_fn, DispatchContext, DispatchResult, DispatchTable, HandlerEnv, OutputSink};
use tailtrace::domain::{ConfigError, DispatchLoopError};

fn env() -> HandlerEnv {
    HandlerEnv::new(Arc::new(AggregationTable::new()))
}

#[test]
fn test_alias_and_unbound() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let handler = handler_fn(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut table = DispatchTable::default();
    table.register(59, Arc::clone(&handler)).unwrap();
    table.register(60, handler).unwrap();
    assert!(Arc::ptr_eq(table.lookup(59).unwrap(), table.lookup(60).unwrap()));

    let env = env();
    assert!(matches!(table.dispatch(&Record::new(59, 0, 0), &env), Ok(DispatchResult::Handled { .. })));
    assert!(matches!(table.dispatch(&Record::new(60, 0, 0), &env), Ok(DispatchResult::Handled { .. })));
    assert_eq!(
        table.dispatch(&Record::new(999, 0, 0), &env),
        Ok(DispatchResult::NoHandler { opcode: 999 })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_ping_pong_hits_cap() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut table = DispatchTable::new(300, 8);
    for (from, to) in [(10, 11), (11, 10)] {
        let calls = Arc::clone(&calls);
        table
            .register(
                from,
                handler_fn(move |_, ctx| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ctx.tail_call(to);
                }),
            )
            .unwrap();
    }

    let err = table.dispatch(&Record::new(10, 0, 0), &env()).unwrap_err();
    assert_eq!(err, DispatchLoopError { origin: 10, target: 11, depth: 8 });
    assert_eq!(calls.load(Ordering::SeqCst), 9);
}

#[test]
fn test_chain_below_cap_succeeds() {
    let mut table = DispatchTable::new(300, 3);
    for opcode in 1..=3 {
        table
            .register_fn(opcode, move |_: &Record, ctx: &mut DispatchContext<'_>| {
                ctx.tail_call(opcode + 1);
            })
            .unwrap();
    }
    table
        .register_fn(4, |record: &Record, ctx: &mut DispatchContext<'_>| {
            ctx.aggregation().increment(u64::from(record.subject_id));
        })
        .unwrap();

    let env = env();
    let result = table.dispatch(&Record::new(1, 7, 0), &env).unwrap();
    assert_eq!(result, DispatchResult::Handled { opcode: 4, tail_calls: 3 });
    assert_eq!(env.aggregation().get(7), Some(1));
}

#[test]
fn test_last_tail_call_request_wins() {
    let mut table = DispatchTable::default();
    table
        .register_fn(1, |_: &Record, ctx: &mut DispatchContext<'_>| {
            ctx.tail_call(2);
            ctx.tail_call(3);
        })
        .unwrap();
    table.register(2, handler_fn(|_, ctx| ctx.emit("two"))).unwrap();
    table.register(3, handler_fn(|_, ctx| ctx.emit("three"))).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let env = env().with_output(OutputSink::new(tx));
    table.dispatch(&Record::new(1, 0, 0), &env).unwrap();
    let messages: Vec<_> = rx.try_iter().map(|event| event.message).collect();
    assert_eq!(messages, vec!["three"]);
}

#[test]
fn test_router_through_registry() {
    let mut bindings = default_bindings();
    bindings.push(Binding::new("router", [0]));
    let registry = HandlerRegistry::builtin(Greetings::from([(501, "Hi user 501!".to_string())]));
    let mut table = DispatchTable::default();
    registry.bind(&mut table, &bindings).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let env = env().with_output(OutputSink::new(tx));

    for target in [59u32, 222, 21, 42] {
        let record = Record::new(0, 501, 1).with_payload(target.to_le_bytes());
        table.dispatch(&record, &env).unwrap();
    }

    let messages: Vec<_> = rx.try_iter().map(|event| (event.opcode, event.message)).collect();
    assert_eq!(
        messages,
        vec![
            (59, "Hi user 501!".to_string()),
            (222, "Creating a timer".to_string()),
            (0, "Another syscall: 42".to_string()),
        ]
    );
    assert_eq!(env.aggregation().get(501), Some(1));
}

#[test]
fn test_table_size_is_configurable() {
    let mut table = DispatchTable::new(8, 32);
    assert_eq!(table.slots(), 8);
    assert!(table.register(7, handler_fn(|_, _| {})).is_ok());
    assert_eq!(
        table.register(8, handler_fn(|_, _| {})).unwrap_err(),
        ConfigError::OpcodeOutOfRange { opcode: 8, slots: 8 }
    );
    assert_eq!(
        table.dispatch(&Record::new(8, 0, 0), &env()),
        Ok(DispatchResult::NoHandler { opcode: 8 })
    );
}
