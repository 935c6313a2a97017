//! The scheduler (§4.6): drives frames until a stop condition, pacing to
//! wall-clock or running as fast as possible, with `stop`/`pause`/`resume`
//! callable from outside the running task.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hermes_core::config::ExecutionMode;
use hermes_core::error::HermesResult;

use crate::process_manager::ProcessManager;

const PAUSE_SLICE: Duration = Duration::from_millis(10);
const AFAP_YIELD_INTERVAL: u64 = 100;

/// A cloneable set of control flags for a running [Scheduler], safe to hold
/// from a task other than the one running `run()` (§4.6 Cancellation).
#[derive(Clone)]
pub struct SchedulerHandle {
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl SchedulerHandle {
    /// Requests the loop stop before starting its next frame. The frame in
    /// flight, if any, always completes.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

pub struct Scheduler {
    manager: Arc<Mutex<ProcessManager>>,
    frame: u64,
    time_ns: u64,
    dt_ns: u64,
    mode: ExecutionMode,
    end_time_ns: Option<u64>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        manager: ProcessManager,
        dt_ns: u64,
        mode: ExecutionMode,
        end_time_ns: Option<u64>,
    ) -> Self {
        Self {
            manager: Arc::new(Mutex::new(manager)),
            frame: 0,
            time_ns: 0,
            dt_ns,
            mode,
            end_time_ns,
            running: Arc::new(AtomicBool::new(true)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            running: self.running.clone(),
            paused: self.paused.clone(),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn time_ns(&self) -> u64 {
        self.time_ns
    }

    /// Invokes `ProcessManager::stage`, then zeroes and writes `(frame,
    /// time_ns)` (§4.6 stage()).
    pub async fn stage(&mut self) -> HermesResult<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = manager.lock().expect("process manager mutex poisoned");
            guard.stage()?;
            guard.segment().set_frame(0)?;
            guard.segment().set_time_ns(0)?;
            Ok::<(), hermes_core::error::HermesError>(())
        })
        .await
        .expect("stage task panicked")?;

        self.frame = 0;
        self.time_ns = 0;
        Ok(())
    }

    /// Invokes `ProcessManager::reset`, then resets the in-process clock
    /// mirror to match (§4.6, §8.2 reset round-trip).
    pub async fn reset(&mut self) -> HermesResult<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = manager.lock().expect("process manager mutex poisoned");
            guard.reset()
        })
        .await
        .expect("reset task panicked")?;

        self.frame = 0;
        self.time_ns = 0;
        Ok(())
    }

    /// Runs `n` frames (§4.6 step(n=1)): `ProcessManager::step_all` on a
    /// blocking task, then `frame += 1`, `time_ns = frame * dt_ns`
    /// (multiplicative, never accumulated per §3.5).
    pub async fn step(&mut self, n: u32) -> HermesResult<()> {
        for _ in 0..n {
            self.step_one().await?;
        }
        Ok(())
    }

    async fn step_one(&mut self) -> HermesResult<()> {
        let next_frame = self.frame + 1;
        let next_time_ns = next_frame * self.dt_ns;

        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = manager.lock().expect("process manager mutex poisoned");
            guard.step_all(next_frame, next_time_ns)
        })
        .await
        .expect("step_all task panicked")?;

        self.frame = next_frame;
        self.time_ns = next_time_ns;
        Ok(())
    }

    /// Drives frames until `stop()`, `end_time_ns`, or a propagated error
    /// (§4.6 run(callback)). The three suspension points are the blocking
    /// `done` wait (inside `step_one`, via `spawn_blocking`), the REALTIME
    /// pacing sleep, and the periodic AFAP yield.
    pub async fn run<F>(&mut self, mut callback: F) -> HermesResult<()>
    where
        F: FnMut(u64, u64),
    {
        let wall_start = Instant::now();
        self.running.store(true, Ordering::SeqCst);

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Some(end) = self.end_time_ns {
                if self.time_ns >= end {
                    break;
                }
            }
            if self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(PAUSE_SLICE).await;
                continue;
            }
            if self.mode == ExecutionMode::SingleFrame {
                tokio::time::sleep(PAUSE_SLICE).await;
                continue;
            }

            self.step_one().await?;
            callback(self.frame, self.time_ns);

            if self.mode == ExecutionMode::Realtime {
                let target = wall_start + Duration::from_nanos(self.time_ns);
                let now = Instant::now();
                if target > now {
                    tokio::time::sleep(target - now).await;
                }
            }

            if self.mode == ExecutionMode::Afap && self.frame % AFAP_YIELD_INTERVAL == 0 {
                tokio::task::yield_now().await;
            }
        }

        Ok(())
    }

    /// Tears down the process manager (§4.5 Termination). Panics if other
    /// [SchedulerHandle]s or in-flight `spawn_blocking` tasks still hold a
    /// reference: callers should `stop()` and await `run()`'s return before
    /// shutting down.
    pub fn shutdown(self, ack_grace: Duration, kill_grace: Duration) {
        match Arc::try_unwrap(self.manager) {
            Ok(mutex) => mutex
                .into_inner()
                .expect("process manager mutex poisoned")
                .shutdown(ack_grace, kill_grace),
            Err(_) => panic!("Scheduler::shutdown called while a clone of the manager is still held"),
        }
    }
}
