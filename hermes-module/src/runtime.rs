//! The module-side main loop (§4.4): attach, then loop on the control
//! channel (`stage`/`reset`/`terminate`) and the frame barrier (`step`).
use std::time::Duration;

use hermes_core::barrier::ModuleBarrierHandle;
use hermes_core::error::HermesResult;
use hermes_core::ipc::{ControlCommand, ControlReply, IpcReceiver, IpcSender};
use hermes_core::segment::BackplaneSegment;

use crate::attach::AttachParams;

/// The polling interval while waiting for either a control command or a
/// frame release. Short enough that `terminate` is noticed promptly; long
/// enough not to busy-spin.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Module-defined behavior for the three lifecycle points the manager
/// drives. A module only reads/writes the backplane through `segment`.
pub trait ModuleLogic {
    /// Initializes internal state (zero/ICs). Called once before the first
    /// frame, and again after every `reset`.
    fn stage(&mut self, segment: &BackplaneSegment) -> HermesResult<()>;

    /// Runs one simulation step.
    fn step(&mut self, segment: &BackplaneSegment) -> HermesResult<()>;

    /// Reverts to the staged state. Default: re-run `stage`.
    fn reset(&mut self, segment: &BackplaneSegment) -> HermesResult<()> {
        self.stage(segment)
    }
}

/// Attaches to the segment and barrier named in the process environment,
/// then runs `logic` until a `terminate` command arrives or `step` returns
/// an error. Returns the process exit code (§6.4: 0 clean, non-zero error).
pub fn run_module(mut logic: impl ModuleLogic) -> i32 {
    match run_module_inner(&mut logic) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("module exiting with error: {e}");
            1
        }
    }
}

fn run_module_inner(logic: &mut impl ModuleLogic) -> HermesResult<()> {
    let params = AttachParams::from_env()?;
    log::info!("module {} attaching to segment {}", params.module_name, params.segment_name);

    let segment = BackplaneSegment::attach(&params.segment_name)?;
    let barrier = ModuleBarrierHandle::attach(&params.barrier_base)?;

    let cmd_rx: IpcReceiver<ControlCommand> = unsafe { IpcReceiver::from_raw_fd(params.cmd_fd) };
    let reply_tx: IpcSender<ControlReply> = unsafe { IpcSender::from_raw_fd(params.reply_fd) };

    loop {
        if let Some(cmd) = cmd_rx.recv_timeout(Some(POLL_INTERVAL))? {
            match cmd {
                ControlCommand::Stage => {
                    reply(&reply_tx, logic.stage(&segment));
                }
                ControlCommand::Reset => {
                    reply(&reply_tx, logic.reset(&segment));
                }
                ControlCommand::Terminate => {
                    reply_tx.send(&ControlReply::Ack)?;
                    return Ok(());
                }
            }
            continue;
        }

        if barrier.wait_step(Some(POLL_INTERVAL))? {
            logic.step(&segment)?;
            barrier.signal_done()?;
        }
    }
}

fn reply(reply_tx: &IpcSender<ControlReply>, result: HermesResult<()>) {
    let message = match result {
        Ok(()) => ControlReply::Ack,
        Err(e) => ControlReply::Error(e.to_string()),
    };
    if let Err(e) = reply_tx.send(&message) {
        log::error!("failed to reply on control channel: {e}");
    }
}
