//! Cross-thread task scheduling.
//!
//! Every thread other than the scheduler thread affects shared state by
//! enqueuing a closure here; the single consumer drains the queue in strict
//! FIFO order at a fixed cadence. This single-writer discipline replaces
//! fine-grained locking of the engine's mutable state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// How often the scheduler thread wakes to drain pending work.
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Logical kind of a scheduled task. Kinds other than `Generic` are
/// coalesced: at most one task of that kind is pending at any time, so rapid
/// repeated triggers (e.g. a flurry of aborts) collapse to a single effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Generic,
    Abort,
    NetworkError,
    FinishSpeaking,
}

pub struct Task<T> {
    kind: TaskKind,
    run: Box<dyn FnOnce(&mut T) + Send>,
}

/// Wake signals shared between the scheduler thread, the hardware pollers
/// and the protocol callbacks.
pub struct Signals {
    notified: Mutex<bool>,
    condvar: Condvar,
    input_ready: AtomicBool,
    output_ready: AtomicBool,
    shutdown: AtomicBool,
}

impl Signals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
            input_ready: AtomicBool::new(false),
            output_ready: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn wake(&self) {
        let mut notified = self.notified.lock().unwrap_or_else(|e| e.into_inner());
        *notified = true;
        self.condvar.notify_one();
    }

    /// Park the scheduler thread until woken or the timeout elapses.
    pub fn wait(&self, timeout: Duration) {
        let mut notified = self.notified.lock().unwrap_or_else(|e| e.into_inner());
        if !*notified {
            let (guard, _) = self
                .condvar
                .wait_timeout(notified, timeout)
                .unwrap_or_else(|e| e.into_inner());
            notified = guard;
        }
        *notified = false;
    }

    pub fn set_input_ready(&self) {
        self.input_ready.store(true, Ordering::Release);
        self.wake();
    }

    pub fn take_input_ready(&self) -> bool {
        self.input_ready.swap(false, Ordering::AcqRel)
    }

    pub fn set_output_ready(&self) {
        self.output_ready.store(true, Ordering::Release);
        self.wake();
    }

    pub fn take_output_ready(&self) -> bool {
        self.output_ready.swap(false, Ordering::AcqRel)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Multi-producer handle to the scheduler's task queue.
///
/// The mutex is held only across append and drain, never while a task runs.
pub struct TaskQueue<T> {
    tasks: Arc<Mutex<Vec<Task<T>>>>,
    signals: Arc<Signals>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            signals: self.signals.clone(),
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn new(signals: Arc<Signals>) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            signals,
        }
    }

    /// Enqueue a task with no coalescing.
    pub fn schedule(&self, run: impl FnOnce(&mut T) + Send + 'static) {
        self.schedule_tagged(TaskKind::Generic, run);
    }

    /// Enqueue a task; non-`Generic` kinds keep at most one pending instance.
    pub fn schedule_tagged(&self, kind: TaskKind, run: impl FnOnce(&mut T) + Send + 'static) {
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            if kind != TaskKind::Generic && tasks.iter().any(|t| t.kind == kind) {
                log::debug!("coalescing duplicate {:?} task", kind);
                return;
            }
            tasks.push(Task {
                kind,
                run: Box::new(run),
            });
        }
        self.signals.wake();
    }

    /// Snapshot and clear the whole queue.
    pub fn drain(&self) -> Vec<Task<T>> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *tasks)
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Run a drained batch in FIFO order, isolating per-task panics so one bad
/// task cannot abort the drain or kill the scheduler thread.
pub fn run_tasks<T>(tasks: Vec<Task<T>>, target: &mut T) {
    for task in tasks {
        let kind = task.kind;
        let run = task.run;
        if catch_unwind(AssertUnwindSafe(|| run(target))).is_err() {
            log::error!("scheduled {:?} task panicked; continuing drain", kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_run_in_fifo_order() {
        let signals = Signals::new();
        let queue: TaskQueue<Vec<u32>> = TaskQueue::new(signals);

        for i in 0..5 {
            queue.schedule(move |log: &mut Vec<u32>| log.push(i));
        }

        let mut log = Vec::new();
        run_tasks(queue.drain(), &mut log);
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn tagged_tasks_coalesce() {
        let signals = Signals::new();
        let queue: TaskQueue<u32> = TaskQueue::new(signals);

        queue.schedule_tagged(TaskKind::Abort, |n| *n += 1);
        queue.schedule_tagged(TaskKind::Abort, |n| *n += 1);
        queue.schedule_tagged(TaskKind::Abort, |n| *n += 1);
        assert_eq!(queue.pending(), 1);

        let mut count = 0;
        run_tasks(queue.drain(), &mut count);
        assert_eq!(count, 1);

        // Once drained, the kind may be scheduled again.
        queue.schedule_tagged(TaskKind::Abort, |n| *n += 1);
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn generic_tasks_never_coalesce() {
        let signals = Signals::new();
        let queue: TaskQueue<u32> = TaskQueue::new(signals);

        queue.schedule(|n| *n += 1);
        queue.schedule(|n| *n += 1);
        assert_eq!(queue.pending(), 2);
    }

    #[test]
    fn panicking_task_does_not_abort_drain() {
        let signals = Signals::new();
        let queue: TaskQueue<Vec<&'static str>> = TaskQueue::new(signals);

        queue.schedule(|log| log.push("first"));
        queue.schedule(|_| panic!("boom"));
        queue.schedule(|log| log.push("last"));

        let mut log = Vec::new();
        run_tasks(queue.drain(), &mut log);
        assert_eq!(log, vec!["first", "last"]);
    }

    #[test]
    fn wait_returns_on_wake() {
        let signals = Signals::new();
        let signals_clone = signals.clone();

        let handle = std::thread::spawn(move || {
            signals_clone.wait(Duration::from_secs(5));
        });
        signals.wake();
        handle.join().unwrap();
    }

    #[test]
    fn ready_flags_are_consumed_once() {
        let signals = Signals::new();
        signals.set_output_ready();
        assert!(signals.take_output_ready());
        assert!(!signals.take_output_ready());
    }
}
