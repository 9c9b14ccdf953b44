//! The "run this at the next opportunity" primitive the loop is driven by.
//!
//! The loop never blocks and never spawns threads. It hands zero-argument
//! callbacks to a [`Scheduler`] and keeps the returned [`CancelToken`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::warn;

/// A deferred callback.
pub type Task = Box<dyn FnOnce()>;

/// Schedules a task to run exactly once, later, on the current thread.
pub trait Scheduler {
    /// Queue `task`. The scheduler must check the returned token right before
    /// running the task and drop it instead if it was cancelled.
    fn schedule(&self, task: Task) -> CancelToken;
}

/// Cancellation handle shared between a scheduler and whoever scheduled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Rc<Cell<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

// ---------------------------------------------------------------------------
// ManualScheduler (tests, deterministic stepping)
// ---------------------------------------------------------------------------

/// Deterministic FIFO scheduler. Nothing runs until the owner steps it.
///
/// Clones share the same queue, so a test can keep one clone and hand the
/// other to the loop.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    tasks: Rc<RefCell<VecDeque<(Task, CancelToken)>>>,
}

impl ManualScheduler {
    /// Upper bound on tasks run by [`ManualScheduler::run_until_idle`].
    pub const DEFAULT_STEP_LIMIT: usize = 10_000;

    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks queued, cancelled ones included.
    pub fn pending_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Tasks queued and not cancelled.
    pub fn live_count(&self) -> usize {
        self.tasks
            .borrow()
            .iter()
            .filter(|(_, token)| !token.is_cancelled())
            .count()
    }

    /// Pop the oldest task and run it unless cancelled. Returns `false` when
    /// the queue was empty.
    pub fn run_next(&self) -> bool {
        // The borrow ends before the task runs; tasks schedule more tasks.
        let next = self.tasks.borrow_mut().pop_front();
        match next {
            Some((task, token)) => {
                if !token.is_cancelled() {
                    task();
                }
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue drains. Returns the number of tasks popped.
    pub fn run_until_idle(&self) -> usize {
        self.run_until_idle_bounded(Self::DEFAULT_STEP_LIMIT)
    }

    /// Like [`ManualScheduler::run_until_idle`] but gives up after `limit`
    /// tasks, so a producer that reposts forever cannot hang a test.
    pub fn run_until_idle_bounded(&self, limit: usize) -> usize {
        let mut steps = 0;
        while steps < limit && self.run_next() {
            steps += 1;
        }
        if steps == limit && self.pending_count() > 0 {
            warn!(limit, pending = self.pending_count(), "scheduler step limit reached");
        }
        steps
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: Task) -> CancelToken {
        let token = CancelToken::new();
        self.tasks.borrow_mut().push_back((task, token.clone()));
        token
    }
}

// ---------------------------------------------------------------------------
// LocalTaskScheduler (tokio, production)
// ---------------------------------------------------------------------------

/// Runs tasks with [`tokio::task::spawn_local`].
///
/// Scheduling panics outside a [`tokio::task::LocalSet`], which is also what
/// keeps the loop on one thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTaskScheduler;

impl Scheduler for LocalTaskScheduler {
    fn schedule(&self, task: Task) -> CancelToken {
        let token = CancelToken::new();
        let guard = token.clone();
        tokio::task::spawn_local(async move {
            if !guard.is_cancelled() {
                task();
            }
        });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Task) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = Rc::clone(&log);
        let make = move |n: u32| -> Task {
            let log = Rc::clone(&log2);
            Box::new(move || log.borrow_mut().push(n))
        };
        (log, make)
    }

    #[test]
    fn runs_in_fifo_order() {
        let sched = ManualScheduler::new();
        let (log, task) = recorder();
        sched.schedule(task(1));
        sched.schedule(task(2));
        sched.schedule(task(3));

        assert_eq!(sched.run_until_idle(), 3);
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_tasks_are_dropped() {
        let sched = ManualScheduler::new();
        let (log, task) = recorder();
        let token = sched.schedule(task(1));
        sched.schedule(task(2));
        token.cancel();
        token.cancel();

        assert_eq!(sched.live_count(), 1);
        sched.run_until_idle();
        assert_eq!(*log.borrow(), vec![2]);
    }

    #[test]
    fn tasks_may_schedule_tasks() {
        let sched = ManualScheduler::new();
        let (log, task) = recorder();
        let inner = sched.clone();
        let second = task(2);
        let first = task(1);
        sched.schedule(Box::new(move || {
            first();
            inner.schedule(second);
        }));

        assert!(sched.run_next());
        assert_eq!(sched.pending_count(), 1);
        assert!(sched.run_next());
        assert!(!sched.run_next());
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn step_limit_stops_livelock() {
        fn repost(sched: ManualScheduler) {
            let again = sched.clone();
            sched.schedule(Box::new(move || repost(again)));
        }
        let sched = ManualScheduler::new();
        repost(sched.clone());

        assert_eq!(sched.run_until_idle_bounded(50), 50);
        assert_eq!(sched.pending_count(), 1);
    }

    #[tokio::test]
    async fn local_task_scheduler_honours_cancel() {
        let local = tokio::task::LocalSet::new();
        let (log, task) = recorder();
        local
            .run_until(async {
                let sched = LocalTaskScheduler;
                sched.schedule(task(1));
                let token = sched.schedule(task(2));
                sched.schedule(task(3));
                token.cancel();
                tokio::task::yield_now().await;
            })
            .await;
        local.await;

        assert_eq!(*log.borrow(), vec![1, 3]);
    }
}
