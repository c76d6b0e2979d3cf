//! Built-in handlers, bindable by name from configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tailtrace_common::{NOISY_OPCODES, OPCODE_EXECVE, OPCODE_TIMER_CREATE, OPCODE_TIMER_DELETE, TIMER_OPCODES};

use super::{DispatchContext, DispatchTable, Handler};
use crate::codec::Record;
use crate::domain::ConfigError;

/// Subject → message shown when that subject runs a program
pub type Greetings = BTreeMap<u32, String>;

const EXEC_NOTICE: &str = "Executing a program";

/// `handler = "...", opcodes = [...]` in `[[dispatch.binding]]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
    pub handler: String,
    pub opcodes: Vec<u32>,
}

impl Binding {
    pub fn new(handler: impl Into<String>, opcodes: impl Into<Vec<u32>>) -> Self {
        Self { handler: handler.into(), opcodes: opcodes.into() }
    }
}

/// Execve to `exec`, the timer family to `timer`, noisy syscalls to `ignore`
#[must_use]
pub fn default_bindings() -> Vec<Binding> {
    vec![
        Binding::new("exec", [OPCODE_EXECVE]),
        Binding::new("timer", TIMER_OPCODES),
        Binding::new("ignore", NOISY_OPCODES),
    ]
}

/// Increments the aggregation table under the record's subject
pub struct CountSubject;

impl Handler for CountSubject {
    fn handle(&self, record: &Record, ctx: &mut DispatchContext<'_>) {
        ctx.aggregation().increment(u64::from(record.subject_id));
    }

    fn name(&self) -> &str {
        "count_subject"
    }
}

pub struct Ignore;

impl Handler for Ignore {
    fn handle(&self, _record: &Record, _ctx: &mut DispatchContext<'_>) {}

    fn name(&self) -> &str {
        "ignore"
    }
}

pub struct ExecNotice;

impl Handler for ExecNotice {
    fn handle(&self, _record: &Record, ctx: &mut DispatchContext<'_>) {
        ctx.emit(EXEC_NOTICE);
    }

    fn name(&self) -> &str {
        "exec_notice"
    }
}

pub struct Timer;

impl Handler for Timer {
    fn handle(&self, _record: &Record, ctx: &mut DispatchContext<'_>) {
        let message = match ctx.opcode() {
            OPCODE_TIMER_CREATE => "Creating a timer",
            OPCODE_TIMER_DELETE => "Deleting a timer",
            _ => "Some other timer operation",
        };
        ctx.emit(message);
    }

    fn name(&self) -> &str {
        "timer"
    }
}

/// Emits the configured greeting, else the record's payload text
pub struct Greeting {
    greetings: Arc<Greetings>,
}

impl Greeting {
    #[must_use]
    pub fn new(greetings: Arc<Greetings>) -> Self {
        Self { greetings }
    }
}

impl Handler for Greeting {
    fn handle(&self, record: &Record, ctx: &mut DispatchContext<'_>) {
        match self.greetings.get(&record.subject_id) {
            Some(message) => ctx.emit(message.as_str()),
            None => ctx.emit(record.payload_text()),
        }
    }

    fn name(&self) -> &str {
        "greeting"
    }
}

/// Tail calls the opcode stored little-endian in the first payload word
pub struct Router;

impl Router {
    fn target(record: &Record) -> Option<u32> {
        let bytes: [u8; 4] = record.payload.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}

impl Handler for Router {
    fn handle(&self, record: &Record, ctx: &mut DispatchContext<'_>) {
        let Some(target) = Self::target(record) else {
            ctx.emit("Another syscall: unknown");
            return;
        };
        if !ctx.tail_call(target) {
            ctx.emit(format!("Another syscall: {target}"));
        }
    }

    fn name(&self) -> &str {
        "router"
    }
}

/// Counts the subject, then greets it
pub struct Exec {
    greetings: Arc<Greetings>,
}

impl Exec {
    #[must_use]
    pub fn new(greetings: Arc<Greetings>) -> Self {
        Self { greetings }
    }
}

impl Handler for Exec {
    fn handle(&self, record: &Record, ctx: &mut DispatchContext<'_>) {
        ctx.aggregation().increment(u64::from(record.subject_id));
        match self.greetings.get(&record.subject_id) {
            Some(message) => ctx.emit(message.as_str()),
            None => ctx.emit(EXEC_NOTICE),
        }
    }

    fn name(&self) -> &str {
        "exec"
    }
}

/// Name → shared handler instance
///
/// Every lookup of a name returns the same `Arc`, so opcodes bound by name
/// alias one handler.
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn builtin(greetings: Greetings) -> Self {
        let greetings = Arc::new(greetings);
        let handlers: [(&'static str, Arc<dyn Handler>); 7] = [
            ("count_subject", Arc::new(CountSubject)),
            ("ignore", Arc::new(Ignore)),
            ("exec_notice", Arc::new(ExecNotice)),
            ("timer", Arc::new(Timer)),
            ("greeting", Arc::new(Greeting::new(Arc::clone(&greetings)))),
            ("router", Arc::new(Router)),
            ("exec", Arc::new(Exec::new(greetings))),
        ];
        Self { handlers: handlers.into_iter().collect() }
    }

    /// # Errors
    /// Returns [`ConfigError::UnknownHandler`] for names not in the registry.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Handler>, ConfigError> {
        self.handlers
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| ConfigError::UnknownHandler(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// Apply `bindings` in order; later bindings replace earlier ones
    ///
    /// # Errors
    /// Fails on an unknown handler name or an opcode outside the table.
    pub fn bind(&self, table: &mut DispatchTable, bindings: &[Binding]) -> Result<(), ConfigError> {
        for binding in bindings {
            let handler = self.get(&binding.handler)?;
            for &opcode in &binding.opcodes {
                table.register(opcode, Arc::clone(&handler))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationTable;
    use crate::dispatch::{DispatchResult, HandlerEnv, OutputEvent, OutputSink};
    use crossbeam_channel::Receiver;

    fn greetings() -> Greetings {
        BTreeMap::from([(0, "Hey root!".to_string()), (501, "Hi user 501!".to_string())])
    }

    fn setup(bindings: &[Binding]) -> (DispatchTable, HandlerEnv, Receiver<OutputEvent>) {
        let registry = HandlerRegistry::builtin(greetings());
        let mut table = DispatchTable::default();
        registry.bind(&mut table, bindings).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(64);
        let env = HandlerEnv::new(Arc::new(AggregationTable::new())).with_output(OutputSink::new(tx));
        (table, env, rx)
    }

    fn messages(rx: &Receiver<OutputEvent>) -> Vec<String> {
        rx.try_iter().map(|event| event.message).collect()
    }

    #[test]
    fn test_default_bindings() {
        let (table, env, rx) = setup(&default_bindings());

        table.dispatch(&Record::new(59, 501, 1), &env).unwrap();
        table.dispatch(&Record::new(59, 1000, 2), &env).unwrap();
        table.dispatch(&Record::new(222, 0, 3), &env).unwrap();
        table.dispatch(&Record::new(224, 0, 3), &env).unwrap();
        table.dispatch(&Record::new(226, 0, 3), &env).unwrap();
        table.dispatch(&Record::new(21, 0, 4), &env).unwrap();

        assert_eq!(
            messages(&rx),
            vec![
                "Hi user 501!",
                "Executing a program",
                "Creating a timer",
                "Some other timer operation",
                "Deleting a timer",
            ]
        );
        assert_eq!(env.aggregation().get(501), Some(1));
        assert_eq!(env.aggregation().get(1000), Some(1));
        assert_eq!(env.aggregation().len(), 2);
    }

    #[test]
    fn test_named_bindings_alias_one_instance() {
        let registry = HandlerRegistry::builtin(Greetings::new());
        let mut table = DispatchTable::default();
        registry.bind(&mut table, &[Binding::new("ignore", [21, 22])]).unwrap();
        assert!(Arc::ptr_eq(table.lookup(21).unwrap(), table.lookup(22).unwrap()));
        assert_eq!(table.lookup(21).unwrap().name(), "ignore");
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::builtin(Greetings::new());
        let mut table = DispatchTable::default();
        let err = registry.bind(&mut table, &[Binding::new("nope", [1])]).unwrap_err();
        assert_eq!(err, ConfigError::UnknownHandler("nope".into()));
    }

    #[test]
    fn test_binding_out_of_range() {
        let registry = HandlerRegistry::builtin(Greetings::new());
        let mut table = DispatchTable::new(300, 32);
        let err = registry.bind(&mut table, &[Binding::new("ignore", [300])]).unwrap_err();
        assert_eq!(err, ConfigError::OpcodeOutOfRange { opcode: 300, slots: 300 });
    }

    #[test]
    fn test_router_tail_calls_bound_target() {
        let mut bindings = default_bindings();
        bindings.push(Binding::new("router", [0]));
        let (table, env, rx) = setup(&bindings);

        let record = Record::new(0, 0, 7).with_payload(59u32.to_le_bytes());
        let result = table.dispatch(&record, &env).unwrap();
        assert_eq!(result, DispatchResult::Handled { opcode: 59, tail_calls: 1 });
        assert_eq!(messages(&rx), vec!["Hey root!"]);
        assert_eq!(env.aggregation().get(0), Some(1));
    }

    #[test]
    fn test_router_fallback() {
        let (table, env, rx) = setup(&[Binding::new("router", [0])]);

        let record = Record::new(0, 0, 7).with_payload(42u32.to_le_bytes());
        table.dispatch(&record, &env).unwrap();
        table.dispatch(&Record::new(0, 0, 7), &env).unwrap();
        assert_eq!(messages(&rx), vec!["Another syscall: 42", "Another syscall: unknown"]);
    }

    #[test]
    fn test_greeting_falls_back_to_payload() {
        let (table, env, rx) = setup(&[Binding::new("greeting", [59])]);

        table.dispatch(&Record::new(59, 0, 1), &env).unwrap();
        table.dispatch(&Record::new(59, 42, 1).with_payload(*b"Hello World"), &env).unwrap();
        assert_eq!(messages(&rx), vec!["Hey root!", "Hello World"]);
        assert!(env.aggregation().is_empty());
    }

    #[test]
    fn test_count_subject_and_exec_notice() {
        let (table, env, rx) = setup(&[
            Binding::new("count_subject", [1]),
            Binding::new("exec_notice", [2]),
        ]);

        table.dispatch(&Record::new(1, 9, 1), &env).unwrap();
        table.dispatch(&Record::new(1, 9, 1), &env).unwrap();
        table.dispatch(&Record::new(2, 9, 1), &env).unwrap();
        assert_eq!(env.aggregation().get(9), Some(2));
        assert_eq!(messages(&rx), vec!["Executing a program"]);
    }

    #[test]
    fn test_registry_names() {
        let registry = HandlerRegistry::builtin(Greetings::new());
        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec!["count_subject", "exec", "exec_notice", "greeting", "ignore", "router", "timer"]
        );
    }
}
