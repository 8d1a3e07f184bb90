//! Tasks owned by an event loop and the handles used to await them.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    sync::{Arc, Condvar, Mutex, PoisonError},
    task::{Context, Poll, Wake, Waker},
};

use crate::{error::JoinError, event_loop::Inner};

/// Boxed, non-`Send` future.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Identifier of a task, unique within its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// The future driven by `run_until_complete`. Never a spawned task.
    pub(crate) const MAIN: Self = Self(0);
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// FIFO of task ids whose wakers fired.
///
/// Wakers must be `Send + Sync`, so this is the one piece of loop state
/// behind a mutex even though the loop itself is single-threaded. A wake
/// from another thread unparks a loop blocked in [`ReadyQueue::wait`].
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
    pushed: Condvar,
}

impl ReadyQueue {
    pub(crate) fn push(&self, id: TaskId) {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(id);
        self.pushed.notify_one();
    }

    /// Block until at least one id is queued.
    pub(crate) fn wait(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        while queue.is_empty() {
            queue = self.pushed.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn pop(&self) -> Option<TaskId> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    pub(crate) fn waker(self: &Arc<Self>, id: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker { id, ready: Arc::clone(self) }))
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

/// Loop-side storage of a spawned task.
pub(crate) struct TaskSlot {
    /// `None` while the task is being polled.
    pub(crate) future: Option<LocalBoxFuture<'static, ()>>,
    /// Resolves the join handle when the task ends without completing.
    pub(crate) on_abort: Box<dyn FnOnce(JoinError)>,
}

struct JoinState<T> {
    result: Option<Result<T, JoinError>>,
    waiter: Option<Waker>,
    finished: bool,
}

impl<T> JoinState<T> {
    fn finish(cell: &RefCell<Self>, result: Result<T, JoinError>) {
        let waiter = {
            let mut state = cell.borrow_mut();
            if state.finished {
                return;
            }
            state.finished = true;
            state.result = Some(result);
            state.waiter.take()
        };
        if let Some(waker) = waiter {
            waker.wake();
        }
    }
}

/// Build the slot and handle for a new task.
pub(crate) fn new_task<F>(
    id: TaskId,
    future: F,
    owner: Weak<Inner>,
) -> (TaskSlot, JoinHandle<F::Output>)
where
    F: Future + 'static,
    F::Output: 'static,
{
    let state = Rc::new(RefCell::new(JoinState { result: None, waiter: None, finished: false }));

    let on_complete = Rc::clone(&state);
    let wrapped = async move {
        let output = future.await;
        JoinState::finish(&on_complete, Ok(output));
    };

    let on_abort_state = Rc::clone(&state);
    let slot = TaskSlot {
        future: Some(Box::pin(wrapped)),
        on_abort: Box::new(move |reason| JoinState::finish(&on_abort_state, Err(reason))),
    };

    (slot, JoinHandle { id, state, owner })
}

/// Handle to a task spawned on an event loop.
///
/// Awaiting it yields the task's output, or a [`JoinError`] if the task was
/// cancelled or panicked. Dropping the handle detaches the task.
pub struct JoinHandle<T> {
    id: TaskId,
    state: Rc<RefCell<JoinState<T>>>,
    owner: Weak<Inner>,
}

impl<T> JoinHandle<T> {
    /// Identifier of the task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has completed, panicked or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Cancel the task. Its future is dropped immediately.
    ///
    /// Returns `false` if the task had already finished.
    pub fn abort(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        match self.owner.upgrade() {
            Some(inner) => inner.cancel_task(self.id),
            None => false,
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }
        if state.finished {
            // Output was already taken by an earlier poll
            return Poll::Ready(Err(JoinError::Cancelled));
        }
        state.waiter = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
