// Sticky wake signal
//
// Lets the owner thread of a task queue sleep while idle without losing a
// wake that arrives between draining the queue and going to sleep: a signal
// delivered before `wait` makes the next `wait` return immediately.

use parking_lot::{Condvar, Mutex};

pub struct Waiter {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Wake the waiting thread. Callable from any thread; the signal is
    /// retained until consumed by `wait`.
    pub fn signal(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.condvar.notify_all();
    }

    /// Block until signalled, then consume the signal.
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.condvar.wait(&mut signalled);
        }
        *signalled = false;
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}
