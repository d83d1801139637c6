//! Continuation driver.
//!
//! Containers never run one another on the native stack. Starting or
//! resuming a container queues a continuation on the current thread; the
//! outermost caller becomes the driver and runs queued continuations until
//! none remain. A `next` chain or a nest of sequential flows therefore runs
//! in constant stack depth however long it is.

use std::cell::RefCell;
use std::collections::VecDeque;

/// Deferred step of a container, run by the thread's driver.
pub(crate) type Continuation = Box<dyn FnOnce() + 'static>;

thread_local! {
    /// Continuations queued on this thread, `None` while no driver runs.
    static QUEUE: RefCell<Option<VecDeque<Continuation>>> = const { RefCell::new(None) };
}

/// Restores the queue that was current before a driver started.
struct DriverGuard {
    previous: Option<VecDeque<Continuation>>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        QUEUE.with(|queue| *queue.borrow_mut() = previous);
    }
}

fn enter(queue: Option<VecDeque<Continuation>>) -> DriverGuard {
    let previous = QUEUE.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), queue));
    DriverGuard { previous }
}

fn pop() -> Option<Continuation> {
    QUEUE.with(|queue| queue.borrow_mut().as_mut().and_then(VecDeque::pop_front))
}

/// Run `continuation` after the current one, or right away (draining
/// everything it queues) when this thread has no driver yet.
pub(crate) fn schedule(continuation: Continuation) {
    let continuation = QUEUE.with(|queue| match queue.borrow_mut().as_mut() {
        Some(queue) => {
            queue.push_back(continuation);
            None
        }
        None => Some(continuation),
    });
    let Some(continuation) = continuation else {
        return;
    };

    let _driver = enter(Some(VecDeque::new()));
    continuation();
    while let Some(continuation) = pop() {
        continuation();
    }
}

/// Run `work` with a driver of its own, so the continuations it schedules
/// complete before this returns even when called from inside a driver.
pub(crate) fn isolated<R>(work: impl FnOnce() -> R) -> R {
    let _outer = enter(None);
    work()
}

#[cfg(test)]
fn is_driving() -> bool {
    QUEUE.with(|queue| queue.borrow().is_some())
}
