//! Explicit scheduler with cancellable tickets (spec.md §9 "Dynamic
//! timing"), replacing ad hoc `setInterval`/debounce timers with a design
//! that a test can drive deterministically.
//!
//! Every periodic concern in this engine — the watcher's polling fallback
//! (C13), the activity/deletion sync poll loop (C8/C9), and the pack/
//! snapshot/GC background jobs (C10) — goes through a [`Scheduler`] rather
//! than sleeping directly, so tests advance a [`VirtualClock`] instead of
//! waiting on a real one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A source of "now", swappable between the real clock and a test-driven
/// virtual one.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary but fixed epoch.
    fn now_millis(&self) -> u64;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock tests advance explicitly, so periodic jobs can be exercised
/// without real sleeps.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    millis: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new(start_millis: u64) -> Self {
        Self { millis: Arc::new(AtomicU64::new(start_millis)) }
    }

    /// Move the clock forward by `delta_millis`.
    pub fn advance(&self, delta_millis: u64) {
        self.millis.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// A cancellable handle to a scheduled recurring tick.
#[derive(Debug, Clone)]
pub struct Ticket {
    id: u64,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl Ticket {
    /// Cancel this ticket. A cancelled ticket's job is never due again,
    /// even if [`Scheduler::due`] is called before the ticket is removed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Job {
    ticket: Ticket,
    interval_millis: u64,
    next_due_millis: u64,
}

/// Holds every job registered against one clock, reporting which are due
/// on each poll rather than blocking a thread per job.
pub struct Scheduler<C: Clock> {
    clock: C,
    next_id: u64,
    jobs: Mutex<Vec<Job>>,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(clock: C) -> Self {
        Self { clock, next_id: 0, jobs: Mutex::new(Vec::new()) }
    }

    /// Register a job to recur every `interval_millis`, first due one
    /// interval from now. Returns a [`Ticket`] the caller can cancel.
    pub fn schedule(&mut self, interval_millis: u64) -> Ticket {
        self.next_id += 1;
        let ticket = Ticket {
            id: self.next_id,
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        let next_due_millis = self.clock.now_millis() + interval_millis;
        self.jobs.lock().unwrap().push(Job { ticket: ticket.clone(), interval_millis, next_due_millis });
        ticket
    }

    /// Remove cancelled jobs; call periodically so long-lived schedulers
    /// don't accumulate dead entries.
    pub fn prune_cancelled(&self) {
        self.jobs.lock().unwrap().retain(|job| !job.ticket.is_cancelled());
    }

    /// Every non-cancelled job whose next tick is due, advancing each one
    /// to its next interval (skipping ahead past any intervals a long gap
    /// between polls may have consumed, so one call always catches up to
    /// "now" rather than queuing a backlog).
    pub fn due(&self) -> Vec<u64> {
        let now = self.clock.now_millis();
        let mut jobs = self.jobs.lock().unwrap();
        let mut fired = Vec::new();
        for job in jobs.iter_mut() {
            if job.ticket.is_cancelled() {
                continue;
            }
            if job.next_due_millis <= now {
                fired.push(job.ticket.id());
                while job.next_due_millis <= now {
                    job.next_due_millis += job.interval_millis.max(1);
                }
            }
        }
        fired
    }
}
