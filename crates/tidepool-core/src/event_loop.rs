//! Single-threaded event loop driven by a virtual clock.
//!
//! The loop owns three kinds of work:
//!
//! - Callbacks scheduled with [`LoopHandle::call_soon`] / [`LoopHandle::call_later`]
//! - Tasks spawned with [`LoopHandle::spawn`]
//! - Finalizers registered with [`LoopHandle::register_finalizer`], drained at
//!   shutdown
//!
//! Time never follows the wall clock. When nothing is runnable, the clock
//! jumps straight to the earliest pending deadline, so a reply scheduled
//! "five seconds later" is delivered without any real waiting.
//!
//! # Invariants
//!
//! - Callbacks fire in nondecreasing deadline order, FIFO among equal
//!   deadlines
//! - The clock never goes backwards
//! - After [`EventLoop::shutdown`] succeeds, no task is alive on the loop
//! - Once closed, a loop never runs anything again

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::{Pin, pin},
    rc::{Rc, Weak},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use crate::{
    error::{JoinError, LoopError},
    scheduler::{TimerId, TimerQueue},
    task::{JoinHandle, LocalBoxFuture, ReadyQueue, TaskId, TaskSlot, new_task},
};

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE_LOOP: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
}

/// Process-unique identifier of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u64);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// Event loop configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Trace every spawn, dispatch, clock jump and cancellation.
    pub debug: bool,
    /// Cancellation rounds attempted at shutdown before giving up on tasks
    /// that keep respawning.
    pub max_cancel_rounds: usize,
    /// Fail with [`LoopError::Stalled`] instead of parking the thread when
    /// nothing is runnable and no timer is pending.
    ///
    /// Off by default: a waker may still fire from another thread, and a
    /// future that is never woken hangs like it would on a real loop.
    pub detect_stalls: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { debug: false, max_cancel_rounds: 8, detect_stalls: false }
    }
}

/// What [`EventLoop::shutdown`] had to clean up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks cancelled because they were still pending.
    pub tasks_cancelled: usize,
    /// Finalizers driven to completion.
    pub finalizers_drained: usize,
    /// Callbacks still scheduled; they are discarded when the loop closes.
    pub callbacks_pending: usize,
    /// Callbacks that panicked over the loop's lifetime, up to shutdown.
    /// Close hooks run later and are counted on the loop only.
    pub callback_panics: usize,
}

pub(crate) enum TimerAction {
    Callback(Box<dyn FnOnce()>),
    Wake(std::task::Waker),
}

/// Loop state shared between the owning [`EventLoop`] and its handles.
pub(crate) struct Inner {
    id: LoopId,
    config: LoopConfig,
    clock: Cell<Duration>,
    timers: RefCell<TimerQueue<TimerAction>>,
    ready: Arc<ReadyQueue>,
    tasks: RefCell<BTreeMap<TaskId, TaskSlot>>,
    next_task: Cell<u64>,
    finalizers: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
    close_hooks: RefCell<Vec<Box<dyn FnOnce()>>>,
    callback_panics: Cell<usize>,
    closed: Cell<bool>,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), LoopError> {
        if self.closed.get() { Err(LoopError::Closed { loop_id: self.id }) } else { Ok(()) }
    }

    fn schedule(&self, deadline: Duration, action: TimerAction) -> Result<TimerId, LoopError> {
        self.ensure_open()?;
        Ok(self.timers.borrow_mut().insert(deadline, action))
    }

    fn poll_task(&self, id: TaskId) {
        let future = match self.tasks.borrow_mut().get_mut(&id) {
            Some(slot) => slot.future.take(),
            None => None,
        };
        // Stale wake for a task that already finished or is mid-poll
        let Some(mut future) = future else { return };

        let waker = self.ready.waker(id);
        let mut cx = Context::from_waker(&waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        match polled {
            Ok(Poll::Pending) => {
                let mut tasks = self.tasks.borrow_mut();
                if let Some(slot) = tasks.get_mut(&id) {
                    slot.future = Some(future);
                    return;
                }
                // Aborted from inside its own poll
                drop(tasks);
                drop(future);
            },
            Ok(Poll::Ready(())) => {
                let slot = self.tasks.borrow_mut().remove(&id);
                drop(slot);
                drop(future);
                if self.config.debug {
                    tracing::trace!(loop_id = %self.id, task = %id, "task completed");
                }
            },
            Err(payload) => {
                drop(future);
                let message = panic_message(payload.as_ref());
                tracing::error!(loop_id = %self.id, task = %id, %message, "task panicked");
                let slot = self.tasks.borrow_mut().remove(&id);
                if let Some(slot) = slot {
                    (slot.on_abort)(JoinError::Panicked(message));
                }
            },
        }
    }

    pub(crate) fn cancel_task(&self, id: TaskId) -> bool {
        let slot = self.tasks.borrow_mut().remove(&id);
        let Some(TaskSlot { future, on_abort }) = slot else { return false };
        drop(future);
        on_abort(JoinError::Cancelled);
        if self.config.debug {
            tracing::debug!(loop_id = %self.id, task = %id, "task cancelled");
        }
        true
    }

    /// Run every callback due at the current instant. Returns how many fired.
    fn dispatch_due(&self) -> usize {
        let now = self.clock.get();
        let watermark = self.timers.borrow().watermark();
        let mut fired = 0;

        loop {
            let due = self.timers.borrow_mut().pop_due(now, watermark);
            let Some(due) = due else { break };
            fired += 1;

            match due.payload {
                TimerAction::Wake(waker) => waker.wake(),
                TimerAction::Callback(callback) => {
                    if self.config.debug {
                        tracing::trace!(loop_id = %self.id, timer = %due.id, ?now, "dispatch");
                    }
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                        self.callback_panics.set(self.callback_panics.get() + 1);
                        tracing::error!(
                            loop_id = %self.id,
                            timer = %due.id,
                            message = %panic_message(payload.as_ref()),
                            "callback panicked"
                        );
                    }
                },
            }
        }

        fired
    }

    /// Jump the clock to the next deadline. Returns `false` if no timer is
    /// pending.
    fn advance_clock(&self) -> bool {
        let next = self.timers.borrow_mut().next_deadline();
        let Some(deadline) = next else { return false };

        if deadline > self.clock.get() {
            if self.config.debug {
                tracing::trace!(
                    loop_id = %self.id,
                    from = ?self.clock.get(),
                    to = ?deadline,
                    "clock jump"
                );
            }
            self.clock.set(deadline);
        }
        true
    }

    /// Cancel tasks in rounds until none is left, adding to `cancelled`.
    fn cancel_all_tasks(&self, cancelled: &mut usize) -> Result<(), LoopError> {
        for _ in 0..self.config.max_cancel_rounds {
            let ids: Vec<TaskId> = self.tasks.borrow().keys().copied().collect();
            if ids.is_empty() {
                return Ok(());
            }
            for id in ids {
                if self.cancel_task(id) {
                    *cancelled += 1;
                }
            }
        }

        let remaining = self.tasks.borrow().len();
        if remaining == 0 {
            Ok(())
        } else {
            Err(LoopError::CancellationIgnored {
                remaining,
                rounds: self.config.max_cancel_rounds,
            })
        }
    }
}

/// Cheap, clonable handle to an event loop.
///
/// Handles are how code under test and simulators schedule work. They do not
/// keep the loop open: once the owning [`EventLoop`] closes, every scheduling
/// call fails with [`LoopError::Closed`].
#[derive(Clone)]
pub struct LoopHandle {
    inner: Rc<Inner>,
}

impl LoopHandle {
    /// Identifier of the loop.
    pub fn id(&self) -> LoopId {
        self.inner.id
    }

    /// Virtual time elapsed since the loop was created.
    pub fn time(&self) -> Duration {
        self.inner.clock.get()
    }

    /// Whether the loop has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Whether debug tracing is enabled on this loop.
    pub fn debug(&self) -> bool {
        self.inner.config.debug
    }

    /// Schedule `callback` to run on the next dispatch at the current instant.
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) -> Result<TimerHandle, LoopError> {
        self.call_later(Duration::ZERO, callback)
    }

    /// Schedule `callback` to run `delay` after the current virtual time.
    pub fn call_later(
        &self,
        delay: Duration,
        callback: impl FnOnce() + 'static,
    ) -> Result<TimerHandle, LoopError> {
        self.call_at(self.time().saturating_add(delay), callback)
    }

    /// Schedule `callback` at an absolute virtual deadline.
    ///
    /// A deadline in the past is treated as the current instant, queued
    /// behind everything already due.
    pub fn call_at(
        &self,
        deadline: Duration,
        callback: impl FnOnce() + 'static,
    ) -> Result<TimerHandle, LoopError> {
        let deadline = deadline.max(self.time());
        let id = self.inner.schedule(deadline, TimerAction::Callback(Box::new(callback)))?;
        Ok(TimerHandle { id, deadline, owner: Rc::downgrade(&self.inner) })
    }

    /// Spawn a task owned by the loop.
    ///
    /// The task first runs the next time the loop is driven.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, LoopError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.inner.ensure_open()?;

        let id = TaskId(self.inner.next_task.get());
        self.inner.next_task.set(id.0 + 1);

        let (slot, handle) = new_task(id, future, Rc::downgrade(&self.inner));
        self.inner.tasks.borrow_mut().insert(id, slot);
        self.inner.ready.push(id);

        if self.inner.config.debug {
            tracing::debug!(loop_id = %self.inner.id, task = %id, "task spawned");
        }
        Ok(handle)
    }

    /// Future that completes once `duration` of virtual time has passed.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            owner: Rc::downgrade(&self.inner),
            deadline: self.time().saturating_add(duration),
            timer: None,
        }
    }

    /// Future that yields once to the rest of the loop.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow { yielded: false }
    }

    /// Register an asynchronous finalizer, drained by
    /// [`EventLoop::shutdown`].
    ///
    /// This is where suspended async streams put their `close` logic.
    pub fn register_finalizer(
        &self,
        finalizer: impl Future<Output = ()> + 'static,
    ) -> Result<(), LoopError> {
        self.inner.ensure_open()?;
        self.inner.finalizers.borrow_mut().push(Box::pin(finalizer));
        Ok(())
    }

    /// Register a hook that runs when the loop closes.
    ///
    /// Hooks run in registration order. On an already-closed loop the hook
    /// runs immediately.
    pub fn on_close(&self, hook: impl FnOnce() + 'static) {
        if self.inner.closed.get() {
            hook();
        } else {
            self.inner.close_hooks.borrow_mut().push(Box::new(hook));
        }
    }

    /// Number of tasks alive on the loop.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Number of callbacks and timers still scheduled.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.timers.borrow().len()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("id", &self.inner.id)
            .field("time", &self.inner.clock.get())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

/// Handle to a scheduled callback.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: TimerId,
    deadline: Duration,
    owner: Weak<Inner>,
}

impl TimerHandle {
    /// Virtual deadline the callback is scheduled for.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Prevent the callback from running. Returns `false` if it already ran
    /// or was cancelled.
    pub fn cancel(&self) -> bool {
        self.owner.upgrade().is_some_and(|inner| inner.timers.borrow_mut().cancel(self.id))
    }

    /// Whether the callback is still scheduled.
    pub fn is_pending(&self) -> bool {
        self.owner.upgrade().is_some_and(|inner| inner.timers.borrow().is_pending(self.id))
    }
}

/// Virtual-time sleep. See [`LoopHandle::sleep`].
#[derive(Debug)]
pub struct Sleep {
    owner: Weak<Inner>,
    deadline: Duration,
    timer: Option<TimerId>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let Some(inner) = this.owner.upgrade() else { return Poll::Ready(()) };

        if inner.clock.get() >= this.deadline {
            return Poll::Ready(());
        }
        if let Some(old) = this.timer.take() {
            inner.timers.borrow_mut().cancel(old);
        }
        // A closed loop is never driven again, so staying pending is accurate
        if let Ok(id) = inner.schedule(this.deadline, TimerAction::Wake(cx.waker().clone())) {
            this.timer = Some(id);
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let (Some(id), Some(inner)) = (self.timer.take(), self.owner.upgrade()) {
            // Dropped while the loop is mid-dispatch: the borrow may be held
            if let Ok(mut timers) = inner.timers.try_borrow_mut() {
                timers.cancel(id);
            }
        }
    }
}

/// See [`LoopHandle::yield_now`].
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Restores the previously active loop when dropped.
#[must_use = "the loop is only active while the guard is alive"]
#[derive(Debug)]
pub struct ActiveLoopGuard {
    previous: Option<LoopHandle>,
}

impl Drop for ActiveLoopGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE_LOOP.with(|active| *active.borrow_mut() = previous);
    }
}

/// The loop installed on this thread with [`EventLoop::install`].
pub fn current_loop() -> Option<LoopHandle> {
    ACTIVE_LOOP.with(|active| active.borrow().clone())
}

/// A single-threaded, virtual-time event loop.
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl EventLoop {
    /// Create a loop with the default configuration.
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default())
    }

    /// Create a loop with the given configuration.
    pub fn with_config(config: LoopConfig) -> Self {
        let id = LoopId(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed));
        if config.debug {
            tracing::debug!(loop_id = %id, "event loop created");
        }

        Self {
            inner: Rc::new(Inner {
                id,
                config,
                clock: Cell::new(Duration::ZERO),
                timers: RefCell::new(TimerQueue::new()),
                ready: Arc::new(ReadyQueue::default()),
                tasks: RefCell::new(BTreeMap::new()),
                // Zero is reserved for the run_until_complete future
                next_task: Cell::new(1),
                finalizers: RefCell::new(Vec::new()),
                close_hooks: RefCell::new(Vec::new()),
                callback_panics: Cell::new(0),
                closed: Cell::new(false),
            }),
        }
    }

    /// Identifier of the loop.
    pub fn id(&self) -> LoopId {
        self.inner.id
    }

    /// A handle for scheduling work on this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle { inner: Rc::clone(&self.inner) }
    }

    /// Whether the loop has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Make this loop the thread's active loop until the guard is dropped.
    pub fn install(&self) -> ActiveLoopGuard {
        let handle = self.handle();
        let previous = ACTIVE_LOOP.with(|active| active.borrow_mut().replace(handle));
        ActiveLoopGuard { previous }
    }

    /// Drive the loop until `future` completes.
    ///
    /// Tasks, callbacks and timers all make progress while the future is
    /// pending.
    ///
    /// # Errors
    ///
    /// - [`LoopError::Closed`] if the loop was closed
    /// - [`LoopError::Stalled`] if nothing can make progress and
    ///   [`LoopConfig::detect_stalls`] is set
    ///
    /// Otherwise an idle loop parks the thread until a waker fires.
    ///
    /// A panic inside `future` propagates to the caller. Panics inside
    /// spawned tasks and callbacks do not.
    pub fn run_until_complete<F: Future>(&mut self, future: F) -> Result<F::Output, LoopError> {
        self.inner.ensure_open()?;

        let mut future = pin!(future);
        let waker = self.inner.ready.waker(TaskId::MAIN);
        let mut cx = Context::from_waker(&waker);
        self.inner.ready.push(TaskId::MAIN);

        loop {
            while let Some(id) = self.inner.ready.pop() {
                if id == TaskId::MAIN {
                    if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                        return Ok(output);
                    }
                } else {
                    self.inner.poll_task(id);
                }
            }

            if self.inner.dispatch_due() > 0 {
                continue;
            }
            if self.inner.advance_clock() {
                continue;
            }
            if self.inner.config.detect_stalls {
                return Err(LoopError::Stalled {
                    now: self.inner.clock.get(),
                    parked_tasks: self.inner.tasks.borrow().len(),
                });
            }
            if self.inner.config.debug {
                tracing::trace!(loop_id = %self.inner.id, "idle, waiting for an external wake");
            }
            self.inner.ready.wait();
        }
    }

    /// Cancel every task, drain finalizers, then cancel whatever the
    /// finalizers spawned.
    ///
    /// Cancellation drops the task's future; the drop is the acknowledgement.
    /// The loop stays open; call [`EventLoop::close`] afterwards.
    ///
    /// # Errors
    ///
    /// [`LoopError::CancellationIgnored`] if tasks keep respawning. It is
    /// returned only after finalizers have been drained.
    pub fn shutdown(&mut self) -> Result<ShutdownReport, LoopError> {
        self.inner.ensure_open()?;
        let mut report = ShutdownReport::default();

        // Finalizers are drained even when some task refuses to go away
        let mut ignored = self.inner.cancel_all_tasks(&mut report.tasks_cancelled).err();

        for _ in 0..self.inner.config.max_cancel_rounds {
            let finalizers = std::mem::take(&mut *self.inner.finalizers.borrow_mut());
            if finalizers.is_empty() {
                break;
            }
            report.finalizers_drained += finalizers.len();

            let handle = self.handle();
            let joins = finalizers
                .into_iter()
                .map(|finalizer| handle.spawn(finalizer))
                .collect::<Result<Vec<_>, _>>()?;
            self.run_until_complete(async move {
                for join in joins {
                    // A panicking finalizer is already logged by the loop
                    let _ = join.await;
                }
            })?;

            ignored = self.inner.cancel_all_tasks(&mut report.tasks_cancelled).err();
        }

        report.callbacks_pending = self.inner.timers.borrow().len();
        report.callback_panics = self.inner.callback_panics.get();

        if self.inner.config.debug {
            tracing::debug!(
                loop_id = %self.inner.id,
                tasks_cancelled = report.tasks_cancelled,
                finalizers_drained = report.finalizers_drained,
                callbacks_pending = report.callbacks_pending,
                "event loop shut down"
            );
        }
        match ignored {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Close the loop: run close hooks, discard pending callbacks and drop
    /// any task still alive. Idempotent.
    pub fn close(&mut self) {
        if self.inner.closed.replace(true) {
            return;
        }

        let hooks = std::mem::take(&mut *self.inner.close_hooks.borrow_mut());
        for hook in hooks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
                self.inner.callback_panics.set(self.inner.callback_panics.get() + 1);
                tracing::error!(
                    loop_id = %self.inner.id,
                    message = %panic_message(payload.as_ref()),
                    "close hook panicked"
                );
            }
        }

        let discarded = self.inner.timers.borrow_mut().drain();
        let leftover_tasks = std::mem::take(&mut *self.inner.tasks.borrow_mut());
        let leftover_finalizers = std::mem::take(&mut *self.inner.finalizers.borrow_mut());

        if !leftover_tasks.is_empty() {
            tracing::warn!(
                loop_id = %self.inner.id,
                tasks = leftover_tasks.len(),
                "event loop closed with pending tasks"
            );
        }
        if self.inner.config.debug {
            tracing::debug!(
                loop_id = %self.inner.id,
                discarded_callbacks = discarded.len(),
                "event loop closed"
            );
        }

        drop(discarded);
        for (_, TaskSlot { future, on_abort }) in leftover_tasks {
            drop(future);
            on_abort(JoinError::Cancelled);
        }
        drop(leftover_finalizers);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("time", &self.inner.clock.get())
            .field("tasks", &self.inner.tasks.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

/// Best-effort rendering of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
