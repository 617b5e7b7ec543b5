// Cross-thread task submission for a single owner thread
//
// Any thread enqueues work tagged with an optional de-duplication id; the
// owner thread drains the queue within a time budget and resolves one
// future per task. Tasks run against the owner thread's context `&mut C`,
// so work can touch state that never leaves that thread.

pub mod future;
pub mod waiter;

pub use future::TaskFuture;
pub use waiter::Waiter;

use crate::error::EngineError;
use future::{future_channel, FutureCompleter};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Largest valid de-duplication id.
pub const MAX_TASK_ID: u16 = 256;

static TASK_NAMES: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Small-integer tag ensuring at most one pending task of a recurring kind.
///
/// Ids come from a process-wide registry so the same id is never handed out
/// twice; the registered name exists for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(u16);

impl TaskId {
    /// Reserve a new unique task id. Panics once all [`MAX_TASK_ID`] ids
    /// have been handed out, which indicates a leak of recurring task kinds.
    pub fn unique(name: &str) -> TaskId {
        let mut names = TASK_NAMES.lock();
        assert!(
            names.len() < MAX_TASK_ID as usize,
            "no more unique task ids remaining"
        );
        names.push(name.to_owned());
        TaskId(names.len() as u16)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    /// Name given at registration.
    pub fn name(self) -> String {
        TASK_NAMES.lock()[(self.0 - 1) as usize].clone()
    }

    fn slot(self) -> usize {
        self.0 as usize
    }
}

struct QueuedTask<C> {
    id: Option<TaskId>,
    job: Box<dyn FnOnce(&mut C) + Send>,
}

/// Thread-safe FIFO of work for one owner thread.
pub struct TaskQueue<C> {
    queue: Mutex<VecDeque<QueuedTask<C>>>,
    /// One slot per de-duplication id; a set slot means a task with that id
    /// is queued and not yet drained.
    slots: Box<[AtomicBool]>,
    budget: Duration,
    wake: Option<Arc<Waiter>>,
}

impl<C> TaskQueue<C> {
    /// A queue whose owner polls it without a wake signal.
    pub fn new(budget: Duration) -> Self {
        Self::build(budget, None)
    }

    /// A queue that signals `wake` on every accepted submission, so the
    /// owner thread can sleep on the waiter while idle.
    pub fn with_wake(budget: Duration, wake: Arc<Waiter>) -> Self {
        Self::build(budget, Some(wake))
    }

    fn build(budget: Duration, wake: Option<Arc<Waiter>>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            slots: (0..=MAX_TASK_ID as usize)
                .map(|_| AtomicBool::new(false))
                .collect(),
            budget,
            wake,
        }
    }

    /// Queue `work` for execution on the owner thread. Non-blocking,
    /// callable from any thread.
    pub fn queue_for_execution<T, F>(&self, work: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> Result<T, EngineError> + Send + 'static,
    {
        let (completer, future) = future_channel();
        self.push(None, completer, work);
        future
    }

    /// Queue `work` under a de-duplication id. If a task with the same id
    /// is already queued and not yet drained, the new future is cancelled
    /// instead of queued, bounding backlog for this task kind.
    pub fn queue_with_id<T, F>(&self, id: TaskId, work: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> Result<T, EngineError> + Send + 'static,
    {
        let (completer, future) = future_channel();
        if self.slots[id.slot()].swap(true, Ordering::AcqRel) {
            log::debug!("task '{}' already queued, cancelling new submission", id.name());
            completer.cancel();
            return future;
        }
        self.push(Some(id), completer, work);
        future
    }

    fn push<T, F>(&self, id: Option<TaskId>, completer: FutureCompleter<T>, work: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> Result<T, EngineError> + Send + 'static,
    {
        let job = Box::new(move |ctx: &mut C| {
            completer.complete(work(ctx));
        });
        self.queue.lock().push_back(QueuedTask { id, job });
        if let Some(wake) = &self.wake {
            wake.signal();
        }
    }

    /// Drain the queue on the owner thread until it is empty or the drain
    /// budget has elapsed. Remaining tasks stay queued for the next call;
    /// no task is ever dropped. A task whose work fails resolves its own
    /// future with the error and never stalls the drain. Returns the
    /// number of tasks run.
    pub fn run_queued_tasks(&self, ctx: &mut C) -> usize {
        let start = Instant::now();
        let mut count = 0;
        while start.elapsed() < self.budget {
            let Some(task) = self.pop() else { break };
            (task.job)(ctx);
            count += 1;
        }
        count
    }

    /// Drain the queue completely, ignoring the budget. Used by the
    /// render thread's warm-up phase.
    pub fn run_all(&self, ctx: &mut C) -> usize {
        let mut count = 0;
        while let Some(task) = self.pop() {
            (task.job)(ctx);
            count += 1;
        }
        count
    }

    fn pop(&self) -> Option<QueuedTask<C>> {
        let task = self.queue.lock().pop_front()?;
        // The id slot frees as soon as the task leaves the queue, so the
        // next submission of this kind may queue while this one runs.
        if let Some(id) = task.id {
            self.slots[id.slot()].store(false, Ordering::Release);
        }
        Some(task)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use ash::vk;
    use std::thread;

    #[derive(Default)]
    struct Counter {
        seen: Vec<u32>,
    }

    fn queue() -> TaskQueue<Counter> {
        TaskQueue::new(Duration::from_millis(100))
    }

    #[test]
    fn tasks_run_in_submission_order_across_threads() {
        let queue = Arc::new(queue());
        // Submissions from three distinct threads, strictly ordered by
        // joining each submitter before the next one starts.
        for value in [1u32, 2, 3] {
            let queue = queue.clone();
            thread::spawn(move || {
                queue.queue_for_execution(move |ctx: &mut Counter| {
                    ctx.seen.push(value);
                    Ok(value)
                });
            })
            .join()
            .unwrap();
        }

        let mut ctx = Counter::default();
        assert_eq!(queue.run_queued_tasks(&mut ctx), 3);
        assert_eq!(ctx.seen, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_id_cancels_newer_submission() {
        let queue = queue();
        let id = TaskId::unique("dedup-test");

        let first = queue.queue_with_id(id, |ctx: &mut Counter| {
            ctx.seen.push(1);
            Ok(())
        });
        let second = queue.queue_with_id(id, |ctx: &mut Counter| {
            ctx.seen.push(2);
            Ok(())
        });

        let mut ctx = Counter::default();
        assert_eq!(queue.run_queued_tasks(&mut ctx), 1);
        assert_eq!(ctx.seen, vec![1]);
        assert!(first.get().is_ok());
        assert!(matches!(second.get(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn id_slot_frees_once_task_is_drained() {
        let queue = queue();
        let id = TaskId::unique("requeue-test");

        queue.queue_with_id(id, |_: &mut Counter| Ok(()));
        let mut ctx = Counter::default();
        queue.run_queued_tasks(&mut ctx);

        let again = queue.queue_with_id(id, |_: &mut Counter| Ok(()));
        queue.run_queued_tasks(&mut ctx);
        assert!(again.get().is_ok());
    }

    #[test]
    fn exhausted_budget_defers_tasks_without_dropping() {
        let queue: TaskQueue<Counter> = TaskQueue::new(Duration::ZERO);
        queue.queue_for_execution(|ctx: &mut Counter| {
            ctx.seen.push(1);
            Ok(())
        });

        let mut ctx = Counter::default();
        assert_eq!(queue.run_queued_tasks(&mut ctx), 0);
        assert_eq!(queue.len(), 1);

        // The deferred task survives and runs on an unbudgeted drain.
        assert_eq!(queue.run_all(&mut ctx), 1);
        assert_eq!(ctx.seen, vec![1]);
    }

    #[test]
    fn failing_task_resolves_its_future_and_drain_continues() {
        let queue = queue();
        let failing = queue.queue_for_execution(|_: &mut Counter| {
            Err::<(), _>(EngineError::native(
                "vkAllocateMemory",
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ))
        });
        let following = queue.queue_for_execution(|ctx: &mut Counter| {
            ctx.seen.push(9);
            Ok(())
        });

        let mut ctx = Counter::default();
        assert_eq!(queue.run_queued_tasks(&mut ctx), 2);
        assert_eq!(ctx.seen, vec![9]);
        assert!(matches!(failing.get(), Err(TaskError::Failed(_))));
        assert!(following.get().is_ok());
    }

    #[test]
    fn submission_signals_the_wake_waiter() {
        let waiter = Arc::new(Waiter::new());
        let queue: TaskQueue<Counter> =
            TaskQueue::with_wake(Duration::from_millis(100), waiter.clone());
        queue.queue_for_execution(|_: &mut Counter| Ok(()));
        // Sticky signal: returns immediately.
        waiter.wait();
    }
}
