//! The frame barrier (§4.2): a pair of named semaphores, `step` and `done`,
//! that hand a frame back and forth between the coordinator and the module
//! processes attached to a segment.
//!
//! Protocol: the coordinator posts `step` with the number of modules that
//! should run this frame, then waits on `done` once per module. Each module
//! waits on `step` once per frame it participates in, does its work, then
//! posts `done` with a count of 1. A module that never shows up (crashed,
//! never spawned) makes the coordinator's `done` wait time out. This is
//! always surfaced as [crate::error::HermesErrorKind::BarrierTimeout], never
//! silently treated as a release.
use std::time::Duration;

use crate::error::HermesResult;
use crate::sync::NamedSemaphore;

fn step_name(base: &str) -> String {
    format!("{base}_step")
}

fn done_name(base: &str) -> String {
    format!("{base}_done")
}

/// The coordinator's end of the frame barrier: owns both semaphores.
pub struct FrameBarrier {
    step: NamedSemaphore,
    done: NamedSemaphore,
}

impl FrameBarrier {
    /// Creates both semaphores fresh, named `<base>_step`/`<base>_done`.
    pub fn create(base: &str) -> HermesResult<Self> {
        let step = NamedSemaphore::create(&step_name(base), 0)?;
        let done = NamedSemaphore::create(&done_name(base), 0)?;
        Ok(Self { step, done })
    }

    /// Releases this frame to `count` modules and blocks until all of them
    /// have reported done, or `timeout` elapses on any single wait.
    ///
    /// Returns `Ok(true)` if every module reported done in time, `Ok(false)`
    /// on the first timeout (the remaining modules' completions are not
    /// waited for; the caller is expected to treat this as fatal for the
    /// frame per §8.1 invariant 5).
    pub fn release_and_wait(&self, count: u32, timeout: Duration) -> HermesResult<bool> {
        self.step.post(count)?;
        for _ in 0..count {
            if !self.done.wait_timeout(Some(timeout))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn destroy(&mut self) {
        self.step.destroy();
        self.done.destroy();
    }
}

/// A module's end of the frame barrier: attaches to both semaphores created
/// by the coordinator.
pub struct ModuleBarrierHandle {
    step: NamedSemaphore,
    done: NamedSemaphore,
}

impl ModuleBarrierHandle {
    pub fn attach(base: &str) -> HermesResult<Self> {
        let step = NamedSemaphore::attach(&step_name(base))?;
        let done = NamedSemaphore::attach(&done_name(base))?;
        Ok(Self { step, done })
    }

    /// Blocks until the coordinator releases a step, or `timeout` elapses.
    /// A module is expected to call this once per frame it is scheduled in.
    pub fn wait_step(&self, timeout: Option<Duration>) -> HermesResult<bool> {
        self.step.wait_timeout(timeout)
    }

    /// Reports this module's work for the current frame as complete.
    /// Always succeeds unless the barrier has already been torn down.
    pub fn signal_done(&self) -> HermesResult<()> {
        self.done.post(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn release_and_wait_succeeds_when_modules_report_done() {
        let base = format!("/hermes-test-barrier-{}", std::process::id());
        let mut coordinator = FrameBarrier::create(&base).unwrap();

        let module_base = base.clone();
        let worker = thread::spawn(move || {
            let module = ModuleBarrierHandle::attach(&module_base).unwrap();
            assert!(module
                .wait_step(Some(Duration::from_secs(1)))
                .unwrap());
            module.signal_done().unwrap();
        });

        let ok = coordinator
            .release_and_wait(1, Duration::from_secs(1))
            .unwrap();
        assert!(ok);

        worker.join().unwrap();
        coordinator.destroy();
    }

    #[test]
    fn release_and_wait_times_out_when_a_module_never_reports_done() {
        let base = format!("/hermes-test-barrier-timeout-{}", std::process::id());
        let mut coordinator = FrameBarrier::create(&base).unwrap();

        let ok = coordinator
            .release_and_wait(1, Duration::from_millis(50))
            .unwrap();
        assert!(!ok);

        coordinator.destroy();
    }
}
