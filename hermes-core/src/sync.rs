//! A named, cross-process counting semaphore.
//!
//! The frame barrier (§4.2) needs two named counting semaphores sharing a
//! base name. Rather than depend on platform POSIX semaphores directly, this
//! is built the way the teacher's dependency stack intends
//! `shared_memory`+`raw_sync` to be combined: `shared_memory` provides the
//! named, kernel-backed mapping; `raw_sync`'s manual-reset `Event` provides
//! the cross-process wake primitive. An `AtomicI64` counter placed right
//! after the event's own bytes in the same mapping turns the binary event
//! into a counting semaphore: `post(n)` adds `n` and (re-)signals the event;
//! `wait` decrements by one once it observes a positive count, blocking on
//! the event in between attempts.
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::Timeout as RawTimeout;
use shared_memory::{Shmem, ShmemConf};

use crate::error::{HermesErrorKind, HermesResult, ResultExt};

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A named counting semaphore backed by shared memory.
pub struct NamedSemaphore {
    shmem: Option<Shmem>,
    event: Box<dyn EventImpl>,
    counter_offset: usize,
    name: String,
    is_owner: bool,
}

// The only shared state is the atomic counter and the raw_sync event, both
// of which are explicitly designed for cross-process/cross-thread use.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Creates a new named semaphore with an initial count of `initial`.
    /// Fails if a semaphore of this name already exists and was not cleanly
    /// unlinked.
    pub fn create(name: &str, initial: i64) -> HermesResult<Self> {
        let region_size = align_up(Event::size_of(None), 8) + std::mem::size_of::<AtomicI64>();

        let shmem = ShmemConf::new()
            .size(region_size)
            .os_id(name)
            .create()
            .map_err(|e| anyhow!("creating semaphore {name:?}: {e}"))
            .typ(HermesErrorKind::Semaphore)?;

        let base = shmem.as_ptr();
        let (event, used) = unsafe { Event::new(base, true) }
            .map_err(|e| anyhow!("initializing event for semaphore {name:?}: {e}"))
            .typ(HermesErrorKind::Semaphore)?;

        let counter_offset = align_up(used, 8);
        unsafe {
            (base.add(counter_offset) as *mut AtomicI64).write(AtomicI64::new(initial));
        }

        Ok(Self {
            shmem: Some(shmem),
            event,
            counter_offset,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Attaches to an existing named semaphore.
    pub fn attach(name: &str) -> HermesResult<Self> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| anyhow!("attaching semaphore {name:?}: {e}"))
            .typ(HermesErrorKind::Semaphore)?;

        let base = shmem.as_ptr();
        let (event, used) = unsafe { Event::new(base, false) }
            .map_err(|e| anyhow!("attaching event for semaphore {name:?}: {e}"))
            .typ(HermesErrorKind::Semaphore)?;

        let counter_offset = align_up(used, 8);

        Ok(Self {
            shmem: Some(shmem),
            event,
            counter_offset,
            name: name.to_string(),
            is_owner: false,
        })
    }

    fn counter(&self) -> &AtomicI64 {
        let base = self.shmem.as_ref().expect("semaphore already unlinked").as_ptr();
        unsafe { &*(base.add(self.counter_offset) as *const AtomicI64) }
    }

    /// Releases `n` units. Always succeeds unless the semaphore has been
    /// destroyed (§4.2: "`signal_done()` always succeeds unless the
    /// semaphore is destroyed").
    pub fn post(&self, n: u32) -> HermesResult<()> {
        self.counter().fetch_add(n as i64, Ordering::SeqCst);
        self.event
            .set(EventState::Signaled)
            .map_err(|e| anyhow!("signaling semaphore {:?}: {e}", self.name))
            .typ(HermesErrorKind::Semaphore)?;
        Ok(())
    }

    /// Waits for one unit to become available, consuming it. Returns
    /// `Ok(true)` on release, `Ok(false)` on timeout: the "never silently"
    /// rule (§4.2) means a timeout is always reported as `false`, never
    /// mistaken for a release. `timeout = None` waits forever;
    /// `Some(Duration::ZERO)` returns immediately.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> HermesResult<bool> {
        let deadline = timeout.map(|d| Instant::now() + d);

        loop {
            if self
                .counter()
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                    if c > 0 {
                        Some(c - 1)
                    } else {
                        None
                    }
                })
                .is_ok()
            {
                return Ok(true);
            }

            let raw_timeout = match deadline {
                None => RawTimeout::Infinite,
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Ok(false);
                    }
                    RawTimeout::Val(dl - now)
                }
            };

            match self.event.wait(raw_timeout) {
                Ok(()) => continue,
                Err(_) if deadline.is_some() => return Ok(false),
                Err(e) => {
                    return Err(anyhow!("waiting on semaphore {:?}: {e}", self.name))
                        .typ(HermesErrorKind::Semaphore)
                }
            }
        }
    }

    /// Unmaps and unlinks the semaphore. Idempotent. Only the owner should
    /// call this; an attached module should only detach (drop the handle).
    pub fn destroy(&mut self) {
        if self.is_owner {
            self.shmem.take();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_zero_reports_pending_or_timeout() {
        let name = format!("/hermes-test-sem-{}", std::process::id());
        let mut sem = NamedSemaphore::create(&name, 0).unwrap();

        assert!(!sem.wait_timeout(Some(Duration::ZERO)).unwrap());

        sem.post(1).unwrap();
        assert!(sem.wait_timeout(Some(Duration::ZERO)).unwrap());
        assert!(!sem.wait_timeout(Some(Duration::ZERO)).unwrap());

        sem.destroy();
    }

    #[test]
    fn post_n_allows_n_waits() {
        let name = format!("/hermes-test-sem-n-{}", std::process::id());
        let mut sem = NamedSemaphore::create(&name, 0).unwrap();
        sem.post(3).unwrap();

        for _ in 0..3 {
            assert!(sem.wait_timeout(Some(Duration::from_millis(10))).unwrap());
        }
        assert!(!sem.wait_timeout(Some(Duration::from_millis(10))).unwrap());

        sem.destroy();
    }
}
