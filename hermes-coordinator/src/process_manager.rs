//! The process manager (§4.5): materializes the segment and barrier,
//! spawns module processes, sequences lifecycle commands, coordinates each
//! frame, and tears everything down on exit.
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use hermes_core::barrier::FrameBarrier;
use hermes_core::config::{Config, ModuleType};
use hermes_core::error::{HermesErrorKind, HermesResult, ResultExt};
use hermes_core::health::{ModuleInitHMTable, ModuleRecoveryAction, ModuleRunHMTable};
use hermes_core::ipc::{channel_pair, ControlCommand, ControlReply, IpcReceiver, IpcSender};
use hermes_core::registry::build_registry;
use hermes_core::segment::BackplaneSegment;
use hermes_core::spawn::{
    BARRIER_BASE_ENV, CMD_FD_ENV, MODULE_CONFIG_ENV, MODULE_NAME_ENV, REPLY_FD_ENV, SEGMENT_ENV,
};
use hermes_core::wire::WireRouter;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::io::AsRawFd;

/// Lifecycle state of a module record (§3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Init,
    Staged,
    Running,
    Error,
}

struct ModuleHandle {
    name: String,
    child: Child,
    cmd_tx: IpcSender<ControlCommand>,
    reply_rx: IpcReceiver<ControlReply>,
    state: ModuleState,
}

impl ModuleHandle {
    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

/// Owns the segment, the barrier, and every spawned module.
pub struct ProcessManager {
    segment: BackplaneSegment,
    barrier: FrameBarrier,
    modules: Vec<ModuleHandle>,
    schedule: Vec<usize>,
    wire_router: WireRouter,
    barrier_timeout: Duration,
    ack_timeout: Duration,
    hm_init_table: ModuleInitHMTable,
    hm_run_table: ModuleRunHMTable,
}

fn barrier_base_for(segment_name: &str) -> String {
    format!("{segment_name}_barrier")
}

impl ProcessManager {
    /// Builds the registry and segment, creates the barrier, and spawns
    /// every configured module. Rewinds (terminates already-spawned modules,
    /// unlinks segment/barrier) if any subsequent step fails (§4.5 Spawn,
    /// §8.3 boundary behavior).
    pub fn build(config: &Config, segment_name: &str) -> HermesResult<Self> {
        let signals = build_registry(config.signal_descriptors())?;
        let mut segment = BackplaneSegment::create(segment_name, &signals)?;
        let barrier_base = barrier_base_for(segment_name);
        let mut barrier = FrameBarrier::create(&barrier_base)?;

        let mut modules = Vec::new();
        for (name, module_config) in &config.modules {
            match Self::spawn_module(name, module_config, segment_name, &barrier_base) {
                Ok(handle) => modules.push(handle),
                Err(e) => {
                    log::error!("spawning module {name:?} failed: {e}");
                    Self::terminate_all(&mut modules, Duration::from_secs(1));
                    barrier.destroy();
                    segment.destroy();
                    return Err(e);
                }
            }
        }

        let wire_router = match WireRouter::compile(&config.wiring, &segment) {
            Ok(router) => router,
            Err(e) => {
                Self::terminate_all(&mut modules, Duration::from_secs(1));
                barrier.destroy();
                segment.destroy();
                return Err(e);
            }
        };

        let schedule = config
            .execution
            .schedule
            .iter()
            .map(|name| {
                modules
                    .iter()
                    .position(|m| &m.name == name)
                    .expect("execution.schedule was validated against config.modules")
            })
            .collect();

        Ok(Self {
            segment,
            barrier,
            modules,
            schedule,
            wire_router,
            barrier_timeout: config.execution.barrier_timeout,
            ack_timeout: Duration::from_secs(5),
            hm_init_table: config.hm_init_table.clone(),
            hm_run_table: config.hm_run_table.clone(),
        })
    }

    fn spawn_module(
        name: &str,
        module: &hermes_core::config::ModuleConfig,
        segment_name: &str,
        barrier_base: &str,
    ) -> HermesResult<ModuleHandle> {
        let (cmd_tx, cmd_rx) = channel_pair::<ControlCommand>()?;
        let (reply_tx, reply_rx) = channel_pair::<ControlReply>()?;

        let program = match module.module_type {
            ModuleType::External => module
                .executable
                .clone()
                .ok_or_else(|| anyhow!("module {name:?} has no executable"))
                .typ(HermesErrorKind::ModuleSpawn)?,
            ModuleType::Script => module
                .script
                .clone()
                .ok_or_else(|| anyhow!("module {name:?} has no script"))
                .typ(HermesErrorKind::ModuleSpawn)?,
        };

        let mut command = Command::new(&program);
        command
            .env(SEGMENT_ENV, segment_name)
            .env(BARRIER_BASE_ENV, barrier_base)
            .env(MODULE_NAME_ENV, name)
            .env(CMD_FD_ENV, cmd_rx.as_raw_fd().to_string())
            .env(REPLY_FD_ENV, reply_tx.as_raw_fd().to_string());
        if let Some(config_path) = &module.config {
            command.env(MODULE_CONFIG_ENV, config_path);
        }

        let child = command
            .spawn()
            .map_err(|e| anyhow!("spawning module {name:?} ({program:?}): {e}"))
            .typ(HermesErrorKind::ModuleSpawn)?;

        // The child inherited cmd_rx/reply_tx across fork/exec (the pair is
        // created SOCK_NONBLOCK but not CLOEXEC); the manager only keeps
        // cmd_tx/reply_rx from here on.
        drop(cmd_rx);
        drop(reply_tx);

        Ok(ModuleHandle {
            name: name.to_string(),
            child,
            cmd_tx,
            reply_rx,
            state: ModuleState::Init,
        })
    }

    /// Sends `stage` to every module and waits for acks (§4.5 Stage), then
    /// runs one wire pass so a consumer's first frame already observes its
    /// producer's staged value (§8.4 S3: wiring is a frame-boundary copy,
    /// and staging is frame 0's boundary).
    pub fn stage(&mut self) -> HermesResult<()> {
        self.broadcast(ControlCommand::Stage, ModuleState::Staged, true)?;
        self.wire_router.route(&self.segment);
        Ok(())
    }

    /// Sends `reset` to every module, waits for acks, and re-zeroes the
    /// header's `(frame, time_ns)` (§4.5 Reset, §8.2 round-trip property).
    pub fn reset(&mut self) -> HermesResult<()> {
        self.broadcast(ControlCommand::Reset, ModuleState::Staged, false)?;
        self.segment.set_frame(0)?;
        self.segment.set_time_ns(0)?;
        self.wire_router.route(&self.segment);
        Ok(())
    }

    fn broadcast(
        &mut self,
        command: ControlCommand,
        on_ack: ModuleState,
        is_init_phase: bool,
    ) -> HermesResult<()> {
        for module in &mut self.modules {
            module.cmd_tx.send(&command)?;
        }
        for module in &mut self.modules {
            match module.reply_rx.recv_timeout(Some(self.ack_timeout))? {
                Some(ControlReply::Ack) => module.state = on_ack,
                Some(ControlReply::Error(message)) => {
                    module.state = ModuleState::Error;
                    let err = anyhow!("module {:?} rejected {command:?}: {message}", module.name)
                        .context("control protocol error");
                    let kind = HermesErrorKind::Protocol;
                    self.log_recovery(kind, is_init_phase);
                    return Err(err).typ(kind);
                }
                None => {
                    module.state = ModuleState::Error;
                    let err = anyhow!(
                        "module {:?} did not acknowledge {command:?} within {:?}",
                        module.name,
                        self.ack_timeout
                    );
                    self.log_recovery(HermesErrorKind::Protocol, is_init_phase);
                    return Err(err).typ(HermesErrorKind::Protocol);
                }
            }
        }
        Ok(())
    }

    /// Runs one frame (§4.5 Per-frame coordination, §4.7 Wire route): writes
    /// `frame`/`time_ns`, releases `step` for every module, waits for all of
    /// them to report `done`, then routes wires.
    ///
    /// A timeout collecting `done` is fatal for the frame (§4.2, §8.1
    /// invariant 5) and is reported as [HermesErrorKind::BarrierTimeout]; a
    /// module process that has exited is reported as
    /// [HermesErrorKind::ModuleCrashed].
    pub fn step_all(&mut self, frame: u64, time_ns: u64) -> HermesResult<()> {
        self.segment.set_frame(frame)?;
        self.segment.set_time_ns(time_ns)?;

        let count = self.modules.len() as u32;
        let all_done = self.barrier.release_and_wait(count, self.barrier_timeout)?;

        if let Some((idx, status)) = self.find_crashed() {
            self.modules[idx].state = ModuleState::Error;
            let name = self.modules[idx].name.clone();
            let pid = self.modules[idx].pid().as_raw();
            self.log_recovery(HermesErrorKind::ModuleCrashed, false);
            return Err(anyhow!("module {name:?} (pid {pid}) crashed: {status}"))
                .typ(HermesErrorKind::ModuleCrashed);
        }

        if !all_done {
            self.log_recovery(HermesErrorKind::BarrierTimeout, false);
            return Err(anyhow!("one or more modules did not report done within {:?}", self.barrier_timeout))
                .typ(HermesErrorKind::BarrierTimeout);
        }

        for &idx in &self.schedule {
            self.modules[idx].state = ModuleState::Running;
        }
        self.wire_router.route(&self.segment);
        Ok(())
    }

    fn find_crashed(&mut self) -> Option<(usize, std::process::ExitStatus)> {
        self.modules.iter_mut().enumerate().find_map(|(idx, m)| match m.child.try_wait() {
            Ok(Some(status)) if !status.success() => Some((idx, status)),
            _ => None,
        })
    }

    fn log_recovery(&self, kind: HermesErrorKind, is_init_phase: bool) {
        let action = if is_init_phase {
            self.hm_init_table.action_for(kind)
        } else {
            self.hm_run_table.action_for(kind)
        };
        if let Some(action) = action {
            log::warn!("{kind}: recovery policy says {action:?}");
        }
    }

    pub fn segment(&self) -> &BackplaneSegment {
        &self.segment
    }

    pub fn recovery_action(&self, kind: HermesErrorKind) -> Option<ModuleRecoveryAction> {
        self.hm_run_table.action_for(kind)
    }

    /// Sends `terminate` to every module, escalating to `SIGTERM` then
    /// `SIGKILL` for stragglers, then unlinks the segment and barrier
    /// (§4.5 Termination). Runs on every exit path, including one already
    /// in progress due to an earlier error.
    pub fn shutdown(mut self, ack_grace: Duration, kill_grace: Duration) {
        Self::terminate_all(&mut self.modules, ack_grace);
        Self::kill_stragglers(&mut self.modules, kill_grace);
        self.barrier.destroy();
        self.segment.destroy();
    }

    fn terminate_all(modules: &mut [ModuleHandle], timeout: Duration) {
        for module in modules.iter_mut() {
            let _ = module.cmd_tx.send(&ControlCommand::Terminate);
        }
        for module in modules.iter_mut() {
            if module.reply_rx.recv_timeout(Some(timeout)).ok().flatten().is_none() {
                log::warn!("module {:?} did not acknowledge terminate", module.name);
            }
        }
    }

    fn kill_stragglers(modules: &mut [ModuleHandle], grace: Duration) {
        let deadline = Instant::now() + grace;
        for module in modules.iter_mut() {
            let _ = kill(module.pid(), Signal::SIGTERM);
        }
        while Instant::now() < deadline {
            if modules
                .iter_mut()
                .all(|m| m.child.try_wait().ok().flatten().is_some())
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        for module in modules.iter_mut() {
            if module.child.try_wait().ok().flatten().is_none() {
                log::warn!("force-killing module {:?}", module.name);
                let _ = kill(module.pid(), Signal::SIGKILL);
                let _ = module.child.wait();
            }
        }
    }
}
