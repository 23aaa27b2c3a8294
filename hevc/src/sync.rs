//! Wait events and deferred work.
//!
//! `Event` is a notification event: once signalled it stays signalled
//! until cleared, waking every waiter. `Dpc` runs one unit of deferred
//! work on its own worker thread; schedules that arrive before the worker
//! gets to run collapse into a single run.

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

// ═══════════════════════════════════════════════════════════════════════════
// EVENT
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct EventState {
    signaled: bool,
    /// Bumped by every `signal`, so a waiter sees a signal that was
    /// cleared again before it woke.
    generation: u64,
}

/// Manually reset wait event.
pub struct Event {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(EventState {
                signaled: false,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Set the event and wake every waiter.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        self.state.lock().signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Block until signalled or `timeout` elapses.
    ///
    /// # Returns
    /// `true` if the event was signalled at any point during the wait.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let start = state.generation;
        while !state.signaled && state.generation == start {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.signaled || state.generation != start
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFERRED WORK
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct DpcState {
    pending: bool,
    stop: bool,
    runs: u64,
}

struct DpcShared {
    state: Mutex<DpcState>,
    cond: Condvar,
}

struct DpcWorker {
    handle: JoinHandle<()>,
    thread: ThreadId,
}

/// One deferred procedure, backed by a named worker thread.
pub struct Dpc {
    name: &'static str,
    shared: Arc<DpcShared>,
    worker: Mutex<Option<DpcWorker>>,
}

impl Dpc {
    /// Create an idle unit. Schedules are remembered until `start`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            shared: Arc::new(DpcShared {
                state: Mutex::new(DpcState::default()),
                cond: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn the worker running `work` once per coalesced schedule.
    pub fn start<F>(&self, mut work: F) -> std::io::Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("hevc-{}", self.name))
            .spawn(move || loop {
                {
                    let mut state = shared.state.lock();
                    while !state.pending && !state.stop {
                        shared.cond.wait(&mut state);
                    }
                    if state.stop {
                        return;
                    }
                    state.pending = false;
                }
                work();
                let mut state = shared.state.lock();
                state.runs += 1;
                shared.cond.notify_all();
            })?;
        let thread = handle.thread().id();
        *worker = Some(DpcWorker { handle, thread });
        Ok(())
    }

    /// Queue one run. Never blocks on the work itself.
    ///
    /// # Returns
    /// `false` if a run was already pending.
    pub fn schedule(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.stop || state.pending {
            return false;
        }
        state.pending = true;
        self.shared.cond.notify_all();
        true
    }

    /// Completed runs since start.
    pub fn runs(&self) -> u64 {
        self.shared.state.lock().runs
    }

    /// Stop the worker and join it, unless called from the worker itself.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.cond.notify_all();
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread != thread::current().id() {
                let _ = worker.handle.join();
            }
        }
    }
}

impl Drop for Dpc {
    fn drop(&mut self) {
        self.shutdown();
    }
}
