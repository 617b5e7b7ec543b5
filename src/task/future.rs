// Completable future resolved by the thread that owns a task queue
//
// One future per queued task, plus the render thread's lifecycle futures
// (creation, warm-up ended, thread death). Exactly one terminal transition
// is allowed; later completions are no-ops.

use crate::error::{EngineError, TaskError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

enum FutureState<T> {
    Pending,
    Done(Result<T, TaskError>),
    /// Result was moved out by `get`.
    Taken,
}

struct Inner<T> {
    state: Mutex<FutureState<T>>,
    done: Condvar,
}

/// Consumer half of a completable future.
///
/// `get` blocks the calling thread, never the owner thread of the queue the
/// task was submitted to. No timeout is imposed; a hung owner thread is the
/// caller's own monitoring problem.
pub struct TaskFuture<T> {
    inner: Arc<Inner<T>>,
}

/// Producer half. Held by the task queue (or the render thread for its
/// lifecycle futures) and resolved exactly once.
pub(crate) struct FutureCompleter<T> {
    inner: Arc<Inner<T>>,
}

/// Create a connected completer/future pair.
pub(crate) fn future_channel<T>() -> (FutureCompleter<T>, TaskFuture<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(FutureState::Pending),
        done: Condvar::new(),
    });
    (
        FutureCompleter {
            inner: inner.clone(),
        },
        TaskFuture { inner },
    )
}

impl<T> FutureCompleter<T> {
    /// Resolve the future. A no-op if it already reached a terminal state.
    pub(crate) fn complete(&self, result: Result<T, EngineError>) {
        self.finish(result.map_err(TaskError::Failed));
    }

    /// Resolve the future as cancelled. A no-op if already terminal.
    pub(crate) fn cancel(&self) {
        self.finish(Err(TaskError::Cancelled));
    }

    fn finish(&self, result: Result<T, TaskError>) {
        let mut state = self.inner.state.lock();
        if matches!(*state, FutureState::Pending) {
            *state = FutureState::Done(result);
            self.inner.done.notify_all();
        }
    }
}

impl<T> TaskFuture<T> {
    /// Block until the future resolves and take the result.
    pub fn get(self) -> Result<T, TaskError> {
        let mut state = self.inner.state.lock();
        loop {
            match std::mem::replace(&mut *state, FutureState::Taken) {
                FutureState::Pending => {
                    *state = FutureState::Pending;
                    self.inner.done.wait(&mut state);
                }
                FutureState::Done(result) => return result,
                FutureState::Taken => unreachable!("result taken twice"),
            }
        }
    }

    /// Block until the future resolves, leaving the result in place so
    /// several threads may observe it.
    pub fn wait(&self) -> Result<T, TaskError>
    where
        T: Clone,
    {
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                FutureState::Pending => self.inner.done.wait(&mut state),
                FutureState::Done(result) => return result.clone(),
                FutureState::Taken => unreachable!("result taken while waiting"),
            }
        }
    }

    /// Whether the future has reached a terminal state.
    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.state.lock(), FutureState::Pending)
    }
}
