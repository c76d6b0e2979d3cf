//! Agent configuration: defaults, optional TOML file, CLI overrides.
//!
//! ```toml
//! [transport]
//! lanes = 4
//! capacity = 1024
//!
//! [dispatch]
//! max_tail_calls = 32
//!
//! [[dispatch.binding]]
//! handler = "router"
//! opcodes = [0]
//!
//! [greetings]
//! 0 = "Hey root!"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tailtrace_common::{MAX_OPCODES, OPCODE_ROUTER, PAYLOAD_CAPACITY};

use crate::cli::Args;
use crate::codec::RecordCodec;
use crate::consumer::DEFAULT_IDLE_TIMEOUT_MS;
use crate::dispatch::handlers::{default_bindings, Binding, Greetings, HandlerRegistry};
use crate::dispatch::{DispatchTable, DEFAULT_MAX_TAIL_CALLS};
use crate::domain::{ConfigError, LaneId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Randomised records from in-process threads
    #[default]
    Synthetic,
    /// Kernel probes loaded from a compiled object
    Ebpf,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synthetic => "synthetic",
            Self::Ebpf => "ebpf",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub lanes: u32,
    /// Records per lane
    pub capacity: usize,
    pub payload_capacity: usize,
    pub idle_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            capacity: 1024,
            payload_capacity: PAYLOAD_CAPACITY,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub slots: u32,
    pub max_tail_calls: u32,
    /// Start from the built-in execve/timer/ignore bindings
    pub defaults: bool,
    /// Applied after the defaults, later entries win
    #[serde(rename = "binding")]
    pub bindings: Vec<Binding>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            slots: MAX_OPCODES,
            max_tail_calls: DEFAULT_MAX_TAIL_CALLS,
            defaults: true,
            bindings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    pub interval_secs: u64,
    /// Output events buffered for the printer before new ones are dropped
    pub output_capacity: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { interval_secs: 2, output_capacity: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub object: Option<PathBuf>,
    pub kprobe: String,
    pub all_syscalls: bool,
    /// Synthetic records per second per lane, 0 for unthrottled
    pub rate: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            object: None,
            kprobe: "__x64_sys_execve".to_string(),
            all_syscalls: false,
            rate: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub transport: TransportConfig,
    pub dispatch: DispatchConfig,
    /// Subject ID (as a string key) → greeting
    pub greetings: BTreeMap<String, String>,
    pub report: ReportConfig,
    pub source: SourceConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            dispatch: DispatchConfig::default(),
            greetings: BTreeMap::from([
                ("0".to_string(), "Hey root!".to_string()),
                ("501".to_string(), "Hi user 501!".to_string()),
            ]),
            report: ReportConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Read a TOML file; missing sections and keys keep their defaults
    ///
    /// # Errors
    /// Returns [`ConfigError::ReadFailed`] or [`ConfigError::ParseFailed`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed {
            path: path.display().to_string(),
            error: e.message().to_string(),
        })
    }

    /// Defaults, then `--config`, then the remaining flags
    ///
    /// # Errors
    /// Fails when the config file cannot be read or the result is invalid.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(kind) = args.source {
            self.source.kind = kind;
        }
        if let Some(lanes) = args.lanes {
            self.transport.lanes = lanes;
        }
        if let Some(capacity) = args.capacity {
            self.transport.capacity = capacity;
        }
        if let Some(payload_capacity) = args.payload_capacity {
            self.transport.payload_capacity = payload_capacity;
        }
        if let Some(max_tail_calls) = args.max_tail_calls {
            self.dispatch.max_tail_calls = max_tail_calls;
        }
        if let Some(interval) = args.interval {
            self.report.interval_secs = interval;
        }
        if let Some(object) = &args.object {
            self.source.object = Some(object.clone());
        }
        if let Some(kprobe) = &args.kprobe {
            self.source.kprobe.clone_from(kprobe);
        }
        if args.all_syscalls {
            self.source.all_syscalls = true;
        }
        if let Some(rate) = args.rate {
            self.source.rate = rate;
        }
    }

    /// Check everything that would otherwise fail during setup
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.report.output_capacity == 0 {
            return Err(ConfigError::NoOutputCapacity);
        }
        if self.transport.lanes == 0 {
            return Err(ConfigError::NoLanes);
        }
        let capacity = self.transport.capacity;
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(ConfigError::InvalidCapacity { lane: LaneId(0), capacity });
        }
        self.codec()?;
        self.dispatch_table()?;

        if self.source.kind == SourceKind::Ebpf {
            if self.transport.payload_capacity != PAYLOAD_CAPACITY {
                return Err(ConfigError::SourceRequirement {
                    source_kind: SourceKind::Ebpf.as_str(),
                    requirement: format!("a payload capacity of {PAYLOAD_CAPACITY}"),
                });
            }
            if self.source.object.is_none() {
                return Err(ConfigError::SourceRequirement {
                    source_kind: SourceKind::Ebpf.as_str(),
                    requirement: "--object <FILE>".to_string(),
                });
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`ConfigError::InvalidPayloadCapacity`].
    pub fn codec(&self) -> Result<RecordCodec, ConfigError> {
        RecordCodec::new(self.transport.payload_capacity)
    }

    /// Greetings keyed by numeric subject ID
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidSubject`] for a key that is not a `u32`.
    pub fn greetings(&self) -> Result<Greetings, ConfigError> {
        self.greetings
            .iter()
            .map(|(subject, message)| {
                subject
                    .trim()
                    .parse::<u32>()
                    .map(|id| (id, message.clone()))
                    .map_err(|_| ConfigError::InvalidSubject(subject.clone()))
            })
            .collect()
    }

    /// Default bindings (unless disabled), the router when every syscall is
    /// traced, then the configured ones
    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings = if self.dispatch.defaults { default_bindings() } else { Vec::new() };
        if self.source.all_syscalls {
            bindings.push(Binding::new("router", [OPCODE_ROUTER]));
        }
        bindings.extend(self.dispatch.bindings.iter().cloned());
        bindings
    }

    /// Build and populate the dispatch table
    ///
    /// # Errors
    /// Fails on bad greetings, unknown handler names or out-of-range opcodes.
    pub fn dispatch_table(&self) -> Result<DispatchTable, ConfigError> {
        let registry = HandlerRegistry::builtin(self.greetings()?);
        let mut table = DispatchTable::new(self.dispatch.slots, self.dispatch.max_tail_calls);
        registry.bind(&mut table, &self.bindings())?;
        Ok(table)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.idle_timeout_ms)
    }

    #[must_use]
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report.interval_secs.max(1))
    }
}
