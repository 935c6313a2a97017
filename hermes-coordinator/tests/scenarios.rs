//! Multi-process integration tests for §8.4 S1-S6, driving real child
//! processes (the `demos/` binaries) the way the teacher's `core/benches`
//! drive real OS primitives (fork/waitpid) from test code.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use hermes_core::config::{
    Config, ExecutionConfig, ExecutionMode, ModuleConfig, ModuleType, ServerConfig,
};
use hermes_core::error::HermesErrorKind;
use hermes_core::health::{ModuleInitHMTable, ModuleRunHMTable};
use hermes_core::registry::{DataType, SignalDescriptor};
use hermes_core::segment::BackplaneSegment;
use hermes_core::wire::Wire;
use hermes_coordinator::process_manager::ProcessManager;
use hermes_coordinator::scheduler::Scheduler;

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

fn unique_segment(test: &str) -> String {
    format!("/hermes-test-{test}-{}", std::process::id())
}

fn module(executable: PathBuf, signals: Vec<SignalDescriptor>) -> ModuleConfig {
    ModuleConfig {
        module_type: ModuleType::External,
        executable: Some(executable),
        script: None,
        config: None,
        signals,
    }
}

fn execution(schedule: Vec<&str>, mode: ExecutionMode, rate_hz: f64) -> ExecutionConfig {
    ExecutionConfig {
        mode,
        rate_hz,
        end_time_ns: None,
        schedule: schedule.into_iter().map(String::from).collect(),
        barrier_timeout: Duration::from_secs(5),
    }
}

fn base_config(modules: BTreeMap<String, ModuleConfig>, execution: ExecutionConfig) -> Config {
    Config {
        modules,
        wiring: vec![],
        execution,
        server: ServerConfig::default(),
        hm_init_table: ModuleInitHMTable::default(),
        hm_run_table: ModuleRunHMTable::default(),
    }
}

#[tokio::test]
async fn s2_one_module_step_loop() {
    let mut modules = BTreeMap::new();
    modules.insert(
        "m".to_string(),
        module(
            PathBuf::from(env!("CARGO_BIN_EXE_echo-module")),
            vec![signal("v", true)],
        ),
    );
    let config = base_config(modules, execution(vec!["m"], ExecutionMode::Afap, 100.0));

    let segment_name = unique_segment("s2");
    let manager = ProcessManager::build(&config, &segment_name).unwrap();
    let mut scheduler = Scheduler::new(
        manager,
        config.execution.dt_ns(),
        config.execution.mode,
        config.execution.end_time_ns,
    );

    scheduler.stage().await.unwrap();
    scheduler.step(10).await.unwrap();

    assert_eq!(scheduler.frame(), 10);
    assert_eq!(scheduler.time_ns(), 100_000_000);

    let check = BackplaneSegment::attach(&segment_name).unwrap();
    assert_eq!(check.get_f64("m.v").unwrap(), 10.0);
    drop(check);

    scheduler.shutdown(Duration::from_secs(2), Duration::from_secs(1));
}

#[tokio::test]
async fn s3_wire_routing() {
    let mut modules = BTreeMap::new();
    modules.insert(
        "in".to_string(),
        module(
            PathBuf::from(env!("CARGO_BIN_EXE_in-module")),
            vec![signal("u", true)],
        ),
    );
    modules.insert(
        "phys".to_string(),
        module(
            PathBuf::from(env!("CARGO_BIN_EXE_phys-module")),
            vec![signal("x", true), signal("y", true)],
        ),
    );
    let mut config = base_config(modules, execution(vec!["in", "phys"], ExecutionMode::Afap, 100.0));
    config.wiring.push(Wire {
        src: "in.u".into(),
        dst: "phys.x".into(),
        gain: 2.0,
        offset: 10.0,
    });
    config.validate().unwrap();

    let segment_name = unique_segment("s3");
    let manager = ProcessManager::build(&config, &segment_name).unwrap();
    let mut scheduler = Scheduler::new(
        manager,
        config.execution.dt_ns(),
        config.execution.mode,
        config.execution.end_time_ns,
    );

    scheduler.stage().await.unwrap();
    scheduler.step(1).await.unwrap();

    let check = BackplaneSegment::attach(&segment_name).unwrap();
    assert_eq!(check.get_f64("phys.x").unwrap(), 20.0);
    assert_eq!(check.get_f64("phys.y").unwrap(), 20.0);
    drop(check);

    scheduler.shutdown(Duration::from_secs(2), Duration::from_secs(1));
}

#[tokio::test]
async fn s4_barrier_timeout() {
    let mut modules = BTreeMap::new();
    modules.insert(
        "sleepy".to_string(),
        module(PathBuf::from(env!("CARGO_BIN_EXE_sleepy-module")), vec![]),
    );
    let mut execution = execution(vec!["sleepy"], ExecutionMode::Afap, 100.0);
    execution.barrier_timeout = Duration::from_millis(200);
    let config = base_config(modules, execution);

    let segment_name = unique_segment("s4");
    let manager = ProcessManager::build(&config, &segment_name).unwrap();
    let mut scheduler = Scheduler::new(
        manager,
        config.execution.dt_ns(),
        config.execution.mode,
        config.execution.end_time_ns,
    );

    scheduler.stage().await.unwrap();
    let err = scheduler.step(1).await.unwrap_err();
    assert_eq!(err.kind(), HermesErrorKind::BarrierTimeout);

    scheduler.shutdown(Duration::from_secs(2), Duration::from_secs(1));
}

#[tokio::test]
async fn s5_realtime_pacing() {
    let mut modules = BTreeMap::new();
    modules.insert(
        "m".to_string(),
        module(
            PathBuf::from(env!("CARGO_BIN_EXE_echo-module")),
            vec![signal("v", true)],
        ),
    );
    let config = base_config(modules, execution(vec!["m"], ExecutionMode::Realtime, 100.0));

    let segment_name = unique_segment("s5");
    let manager = ProcessManager::build(&config, &segment_name).unwrap();
    let mut scheduler = Scheduler::new(
        manager,
        config.execution.dt_ns(),
        config.execution.mode,
        Some(5_000_000_000),
    );

    scheduler.stage().await.unwrap();

    let started = Instant::now();
    scheduler.run(|_, _| {}).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(scheduler.time_ns(), 5_000_000_000);
    assert!(elapsed >= Duration::from_millis(4_900));
    assert!(elapsed <= Duration::from_millis(5_500));

    scheduler.shutdown(Duration::from_secs(2), Duration::from_secs(1));
}

#[tokio::test]
async fn s6_crash_resilience() {
    let mut modules = BTreeMap::new();
    modules.insert(
        "victim".to_string(),
        module(
            PathBuf::from(env!("CARGO_BIN_EXE_echo-module")),
            vec![signal("v", true)],
        ),
    );
    let config = base_config(modules, execution(vec!["victim"], ExecutionMode::Afap, 100.0));

    let segment_name = unique_segment("s6");
    let manager = ProcessManager::build(&config, &segment_name).unwrap();
    let mut scheduler = Scheduler::new(
        manager,
        config.execution.dt_ns(),
        config.execution.mode,
        config.execution.end_time_ns,
    );

    scheduler.stage().await.unwrap();
    scheduler.step(1).await.unwrap();

    // The module process is killed out-of-band, mimicking an operator or the
    // OS OOM-killer reaping it between frames.
    let pgrep = std::process::Command::new("pkill")
        .args(["-9", "-f", "echo-module"])
        .status();
    assert!(pgrep.is_ok());
    std::thread::sleep(Duration::from_millis(100));

    let err = scheduler.step(1).await.unwrap_err();
    assert_eq!(err.kind(), HermesErrorKind::ModuleCrashed);

    scheduler.shutdown(Duration::from_secs(2), Duration::from_secs(1));
}
