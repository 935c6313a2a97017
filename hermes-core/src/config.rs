//! Configuration for the Hermes coordinator (§6.1).
//!
//! A configuration declares the modules to spawn, the signals each of them
//! owns, the wires routing signals between them, and the execution mode the
//! scheduler should run under. Loading a config never touches the kernel:
//! all cross-checks here are pure validation over the parsed value, so
//! `validate <config>` can run without creating any IPC object.
use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{HermesErrorKind, HermesResult, ResultExt};
use crate::health::{ModuleInitHMTable, ModuleRunHMTable};
use crate::registry::SignalDescriptor;
use crate::wire::Wire;

/// Top-level Hermes configuration, as parsed from YAML.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Modules to spawn, keyed by their qualified-name prefix.
    pub modules: std::collections::BTreeMap<String, ModuleConfig>,

    /// Wires routed after each frame's module steps (§4.7).
    #[serde(default)]
    pub wiring: Vec<Wire>,

    /// Scheduler pacing and frame order.
    pub execution: ExecutionConfig,

    /// Passed through to the telemetry collaborator untouched.
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub hm_init_table: ModuleInitHMTable,

    #[serde(default)]
    pub hm_run_table: ModuleRunHMTable,
}

/// A single module's declaration: how to run it and what signals it owns.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModuleConfig {
    #[serde(rename = "type")]
    pub module_type: ModuleType,

    /// Path to an external executable. Required when `type = external`.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Path to an in-language script. Required when `type = script`.
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Optional path to a module-private config file, passed through
    /// unopened (§6.4).
    #[serde(default)]
    pub config: Option<PathBuf>,

    pub signals: Vec<SignalDescriptor>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    External,
    Script,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Realtime,
    Afap,
    SingleFrame,
}

/// Scheduler pacing and the module execution order (§4.6, §8.1 invariant 7).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,

    /// Frame rate; `dt_ns = round(1e9 / rate_hz)` (§3.5).
    pub rate_hz: f64,

    /// Optional simulation end time, in nanoseconds.
    #[serde(default)]
    pub end_time_ns: Option<u64>,

    /// Module execution order within a frame (§4.3, §4.5). Must be a
    /// permutation, or subset, of `modules`' keys (§8.1 invariant 7).
    pub schedule: Vec<String>,

    /// Coordinator timeout for any single barrier wait (§5, default 5s).
    #[serde(with = "humantime_serde", default = "default_barrier_timeout")]
    pub barrier_timeout: std::time::Duration,
}

fn default_barrier_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(5)
}

impl ExecutionConfig {
    /// `dt_ns = round(1e9 / rate_hz)` (§3.5 invariant).
    pub fn dt_ns(&self) -> u64 {
        (1e9 / self.rate_hz).round() as u64
    }
}

/// Passed straight through to the telemetry collaborator; Hermes's core
/// neither opens a socket nor interprets these fields (§1 Non-goals).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_telemetry_hz")]
    pub telemetry_hz: f64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_telemetry_hz() -> f64 {
    30.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            telemetry_hz: default_telemetry_hz(),
        }
    }
}

impl Config {
    /// Parses and validates a config in one step.
    pub fn load(path: &std::path::Path) -> HermesResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("reading config {path:?}: {e}"))
            .typ(HermesErrorKind::Config)?;
        let config: Config = serde_yaml::from_str(&text)
            .map_err(|e| anyhow!("parsing config {path:?}: {e}"))
            .typ(HermesErrorKind::Config)?;
        config.validate()?;
        Ok(config)
    }

    /// Runs every cross-check required at load (§6.1, §8.1 invariants 6–7).
    /// Module/signal name shape is validated later by
    /// [crate::registry::build_registry]; this only checks cross-references
    /// that the registry builder cannot see (wire endpoints, schedule
    /// membership, rate).
    pub fn validate(&self) -> HermesResult<()> {
        if self.modules.is_empty() {
            return Err(anyhow!("config declares no modules")).typ(HermesErrorKind::Config);
        }

        if self.execution.rate_hz <= 0.0 {
            return Err(anyhow!(
                "execution.rate_hz must be positive, got {}",
                self.execution.rate_hz
            ))
            .typ(HermesErrorKind::Config);
        }

        for (name, module) in &self.modules {
            match module.module_type {
                ModuleType::External if module.executable.is_none() => {
                    return Err(anyhow!("module {name:?} has type external but no executable"))
                        .typ(HermesErrorKind::Config);
                }
                ModuleType::Script if module.script.is_none() => {
                    return Err(anyhow!("module {name:?} has type script but no script"))
                        .typ(HermesErrorKind::Config);
                }
                _ => {}
            }
        }

        // Schedule permutation (§8.1 invariant 7): every scheduled name must
        // be a declared module, and must not repeat.
        let mut scheduled = HashSet::new();
        for name in &self.execution.schedule {
            if !self.modules.contains_key(name) {
                return Err(anyhow!(
                    "execution.schedule references undeclared module {name:?}"
                ))
                .typ(HermesErrorKind::Config);
            }
            if !scheduled.insert(name) {
                return Err(anyhow!("execution.schedule repeats module {name:?}"))
                    .typ(HermesErrorKind::Config);
            }
        }

        // Wire endpoint existence + destination writability + src != dst
        // (§3.6 invariant). Endpoint *existence in the registry* is the
        // stronger of the two checks and is re-verified again once the
        // registry is actually built, since a wire may reference a signal
        // whose owning module isn't in `modules` at all (caught here) or
        // whose local name is merely misspelled (caught by slot resolution).
        let known_signals = self.qualified_signal_names();
        for wire in &self.wiring {
            if wire.src == wire.dst {
                return Err(anyhow!("wire source and destination are both {:?}", wire.src))
                    .typ(HermesErrorKind::Config);
            }
            if !known_signals.contains(&wire.src) {
                return Err(anyhow!("wire source {:?} is not a declared signal", wire.src))
                    .typ(HermesErrorKind::Config);
            }
            let dst_writable = self.signal_is_writable(&wire.dst);
            match dst_writable {
                None => {
                    return Err(anyhow!(
                        "wire destination {:?} is not a declared signal",
                        wire.dst
                    ))
                    .typ(HermesErrorKind::Config)
                }
                Some(false) => {
                    return Err(anyhow!("wire destination {:?} is not writable", wire.dst))
                        .typ(HermesErrorKind::Config)
                }
                Some(true) => {}
            }
        }

        Ok(())
    }

    fn qualified_signal_names(&self) -> HashSet<String> {
        self.modules
            .iter()
            .flat_map(|(module_name, module)| {
                module
                    .signals
                    .iter()
                    .map(move |s| format!("{module_name}.{}", s.name))
            })
            .collect()
    }

    fn signal_is_writable(&self, qualified_name: &str) -> Option<bool> {
        let (module_name, local_name) = qualified_name.split_once('.')?;
        self.modules
            .get(module_name)?
            .signals
            .iter()
            .find(|s| s.name == local_name)
            .map(|s| s.writable)
    }

    /// The flat `(module_name, descriptor)` stream expected by
    /// [crate::registry::build_registry], in configured module order.
    pub fn signal_descriptors(&self) -> Vec<(&str, &SignalDescriptor)> {
        self.modules
            .iter()
            .flat_map(|(name, module)| module.signals.iter().map(move |s| (name.as_str(), s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DataType;
    use std::time::Duration;

    fn signal(name: &str, writable: bool) -> SignalDescriptor {
        SignalDescriptor {
            name: name.into(),
            data_type: DataType::F64,
            unit: None,
            description: None,
            writable,
            published: true,
        }
    }

    fn module(signals: Vec<SignalDescriptor>) -> ModuleConfig {
        ModuleConfig {
            module_type: ModuleType::Script,
            executable: None,
            script: Some("m.py".into()),
            config: None,
            signals,
        }
    }

    fn base_config() -> Config {
        let mut modules = std::collections::BTreeMap::new();
        modules.insert("a".to_string(), module(vec![signal("x", true)]));
        modules.insert("b".to_string(), module(vec![signal("y", true)]));
        Config {
            modules,
            wiring: vec![],
            execution: ExecutionConfig {
                mode: ExecutionMode::Afap,
                rate_hz: 100.0,
                end_time_ns: None,
                schedule: vec!["a".into(), "b".into()],
                barrier_timeout: Duration::from_secs(5),
            },
            server: ServerConfig::default(),
            hm_init_table: ModuleInitHMTable::default(),
            hm_run_table: ModuleRunHMTable::default(),
        }
    }

    #[test]
    fn dt_ns_matches_s3_5_example() {
        let mut config = base_config();
        config.execution.rate_hz = 600.0;
        assert_eq!(config.execution.dt_ns(), 1_666_667);
    }

    #[test]
    fn accepts_a_valid_config() {
        base_config().validate().unwrap();
    }

    #[test]
    fn rejects_schedule_referencing_unknown_module() {
        let mut config = base_config();
        config.execution.schedule.push("ghost".into());
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), HermesErrorKind::Config);
    }

    #[test]
    fn rejects_wire_to_non_writable_destination() {
        let mut config = base_config();
        config
            .modules
            .get_mut("b")
            .unwrap()
            .signals
            .push(signal("z", false));
        config.wiring.push(Wire {
            src: "a.x".into(),
            dst: "b.z".into(),
            gain: 1.0,
            offset: 0.0,
        });
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), HermesErrorKind::Config);
    }

    #[test]
    fn rejects_wire_with_identical_endpoints() {
        let mut config = base_config();
        config.wiring.push(Wire {
            src: "a.x".into(),
            dst: "a.x".into(),
            gain: 1.0,
            offset: 0.0,
        });
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), HermesErrorKind::Config);
    }
}
