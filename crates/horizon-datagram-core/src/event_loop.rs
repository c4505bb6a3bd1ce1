//! Single-threaded event loops.
//!
//! An [`EventLoop`] is a dedicated OS thread running a current-thread Tokio
//! runtime together with a [`LocalSet`]. Work reaches the loop through a FIFO
//! task queue: [`EventLoop::execute`] may be called from any thread, and the
//! loop runs tasks one at a time in submission order. Because tasks run inside
//! the `LocalSet`, they may create `!Send` state and spawn local futures with
//! [`EventLoop::spawn_local`]; that state is then only ever touched by this
//! thread, so it needs no locks.
//!
//! Loops are created by an [`EventLoopGroup`](crate::EventLoopGroup).
//!
//! # Example
//!
//! ```no_run
//! use horizon_datagram_core::EventLoopGroup;
//!
//! let group = EventLoopGroup::with_threads(2).unwrap();
//! let event_loop = group.assign_loop().unwrap();
//!
//! event_loop.execute(|| println!("runs on the loop thread")).unwrap();
//! ```

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use crate::completion::Completion;
use crate::error::{LoopError, Result};
use crate::hooks::panic_message;
use crate::local;
use crate::logging::{span_names, targets};

/// A task queued on an event loop.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Message sent to a loop thread.
enum LoopMessage {
    Run(Task),
    Shutdown,
}

/// Identifier of a loop within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(usize);

impl LoopId {
    /// The loop's index within its group.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// What a loop did while shutting down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopReport {
    /// Tasks that ran after shutdown was requested.
    pub drained: usize,
    /// Tasks dropped because the shutdown deadline had passed.
    pub cancelled: usize,
    /// Loop-local shutdown hooks that ran.
    pub shutdown_hooks: usize,
}

/// State shared between the loop handle and the loop thread.
struct LoopControl {
    pending_tasks: AtomicUsize,
    deadline: Mutex<Option<Instant>>,
    thread_id: OnceLock<ThreadId>,
    terminated: Completion<LoopReport>,
}

impl LoopControl {
    fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }
}

pub(crate) struct LoopShared {
    id: LoopId,
    name: String,
    sender: mpsc::UnboundedSender<LoopMessage>,
    accepting: AtomicBool,
    channels: AtomicUsize,
    control: Arc<LoopControl>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// A handle to a single-threaded event loop.
///
/// Handles are cheap to clone and may be shared between threads.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

/// A non-owning reference to an [`EventLoop`].
#[derive(Clone)]
pub struct WeakEventLoop {
    shared: Weak<LoopShared>,
}

impl WeakEventLoop {
    /// Get the loop back if any strong handle is still alive.
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.shared.upgrade().map(EventLoop::from_shared)
    }
}

impl fmt::Debug for WeakEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEventLoop")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl EventLoop {
    pub(crate) fn from_shared(shared: Arc<LoopShared>) -> Self {
        Self { shared }
    }

    /// Spawn the loop thread and wait until its runtime is ready.
    pub(crate) fn start(index: usize, name: String) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let control = Arc::new(LoopControl {
            pending_tasks: AtomicUsize::new(0),
            deadline: Mutex::new(None),
            thread_id: OnceLock::new(),
            terminated: Completion::new(),
        });

        let shared = Arc::new(LoopShared {
            id: LoopId(index),
            name: name.clone(),
            sender,
            accepting: AtomicBool::new(true),
            channels: AtomicUsize::new(0),
            control: control.clone(),
            handle: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);
        let weak = Arc::downgrade(&shared);
        let id = shared.id;

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(id, weak, receiver, control, ready_tx))
            .map_err(|e| LoopError::SpawnFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                let _ = handle.join();
                return Err(LoopError::RuntimeCreation(msg));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(LoopError::RuntimeCreation(
                    "loop thread exited before reporting readiness".into(),
                ));
            }
        }

        *shared.handle.lock() = Some(handle);
        tracing::debug!(
            target: targets::EVENT_LOOP,
            loop_id = index,
            name = %shared.name,
            "event loop started"
        );
        Ok(Self { shared })
    }

    /// The loop's identifier within its group.
    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    /// The loop thread's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Check whether the loop still accepts tasks.
    pub fn is_running(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Number of tasks queued but not yet run.
    pub fn pending_tasks(&self) -> usize {
        self.shared.control.pending_tasks.load(Ordering::Acquire)
    }

    /// Number of channels currently owned by this loop.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.load(Ordering::Acquire)
    }

    /// Record that a channel now belongs to this loop.
    pub fn register_channel(&self) {
        self.shared.channels.fetch_add(1, Ordering::AcqRel);
    }

    /// Record that a channel owned by this loop was released.
    pub fn deregister_channel(&self) {
        let _ = self
            .shared
            .channels
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Check whether the calling thread is this loop's thread.
    pub fn in_event_loop(&self) -> bool {
        self.shared.control.thread_id.get() == Some(&thread::current().id())
    }

    /// Get a non-owning reference to this loop.
    pub fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Queue a task to run on this loop.
    ///
    /// Tasks run one at a time, in submission order. A panicking task is
    /// logged and does not stop the loop.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            return Err(LoopError::Shutdown);
        }

        let control = &self.shared.control;
        control.pending_tasks.fetch_add(1, Ordering::AcqRel);
        self.shared
            .sender
            .send(LoopMessage::Run(Box::new(task)))
            .map_err(|_| {
                control.pending_tasks.fetch_sub(1, Ordering::AcqRel);
                LoopError::Shutdown
            })
    }

    /// Spawn a `!Send` future on this loop.
    ///
    /// Must be called from the loop thread itself (typically from inside a
    /// task passed to [`execute`](Self::execute)).
    pub fn spawn_local<F>(&self, future: F) -> Result<tokio::task::JoinHandle<F::Output>>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        if !self.in_event_loop() {
            return Err(LoopError::WouldDeadlock);
        }
        Ok(tokio::task::spawn_local(future))
    }

    /// Signal resolved once the loop thread has exited.
    pub fn termination(&self) -> Completion<LoopReport> {
        self.shared.control.terminated.clone()
    }

    /// Stop accepting tasks and ask the loop to exit.
    ///
    /// Tasks already queued still run until `deadline`; later ones are
    /// dropped. Calling this more than once has no further effect.
    pub(crate) fn begin_shutdown(&self, deadline: Instant) -> Completion<LoopReport> {
        if self.shared.accepting.swap(false, Ordering::AcqRel) {
            *self.shared.control.deadline.lock() = Some(deadline);
            if self.shared.sender.send(LoopMessage::Shutdown).is_err() {
                self.shared.control.terminated.complete(LoopReport::default());
            }
            tracing::debug!(
                target: targets::EVENT_LOOP,
                loop_id = self.shared.id.0,
                "event loop shutdown requested"
            );
        }
        self.termination()
    }

    /// Join the loop thread. Does nothing when called from the loop itself.
    pub(crate) fn join(&self) {
        if self.in_event_loop() {
            return;
        }
        let handle = self.shared.handle.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!(
                target: targets::EVENT_LOOP,
                loop_id = self.shared.id.0,
                "event loop thread panicked"
            );
        }
    }
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for EventLoop {}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .field("pending_tasks", &self.pending_tasks())
            .field("channels", &self.channel_count())
            .finish()
    }
}

/// Body of a loop thread.
fn run_loop(
    id: LoopId,
    shared: Weak<LoopShared>,
    mut receiver: mpsc::UnboundedReceiver<LoopMessage>,
    control: Arc<LoopControl>,
    ready: crossbeam_channel::Sender<std::result::Result<(), String>>,
) {
    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            control.terminated.complete(LoopReport::default());
            return;
        }
    };

    let _ = control.thread_id.set(thread::current().id());
    let span = tracing::debug_span!(
        target: targets::EVENT_LOOP,
        span_names::EVENT_LOOP,
        loop_id = id.0
    );
    let _entered = span.enter();

    local::enter(shared);
    let _ = ready.send(Ok(()));

    let local_set = LocalSet::new();
    let report = local_set.block_on(&runtime, process_tasks(&mut receiver, &control));

    // Dropping the set cancels every future still spawned on this loop.
    drop(local_set);
    drop(runtime);
    local::exit();

    tracing::debug!(
        target: targets::EVENT_LOOP,
        loop_id = id.0,
        drained = report.drained,
        cancelled = report.cancelled,
        "event loop stopped"
    );
    control.terminated.complete(report);
}

async fn process_tasks(
    receiver: &mut mpsc::UnboundedReceiver<LoopMessage>,
    control: &LoopControl,
) -> LoopReport {
    let mut report = LoopReport::default();

    while let Some(message) = receiver.recv().await {
        match message {
            LoopMessage::Run(task) => run_or_cancel(task, control, &mut report),
            LoopMessage::Shutdown => {
                // Anything still queued was submitted before `accepting` was
                // observed false by its sender.
                while let Ok(message) = receiver.try_recv() {
                    if let LoopMessage::Run(task) = message {
                        run_or_cancel(task, control, &mut report);
                    }
                }
                break;
            }
        }
    }

    report.shutdown_hooks = local::run_shutdown_hooks();
    report
}

fn run_or_cancel(task: Task, control: &LoopControl, report: &mut LoopReport) {
    let deadline = control.deadline();
    match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            drop(task);
            report.cancelled += 1;
        }
        Some(_) => {
            run_task(task);
            report.drained += 1;
        }
        None => run_task(task),
    }
    control.pending_tasks.fetch_sub(1, Ordering::AcqRel);
}

fn run_task(task: Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        tracing::error!(
            target: targets::EVENT_LOOP,
            panic = %panic_message(&*payload),
            "event loop task panicked"
        );
    }
}

static_assertions::assert_impl_all!(EventLoop: Send, Sync, Clone);
static_assertions::assert_impl_all!(WeakEventLoop: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn start(name: &str) -> EventLoop {
        EventLoop::start(0, name.to_string()).unwrap()
    }

    fn stop(event_loop: &EventLoop) -> LoopReport {
        let report = event_loop
            .begin_shutdown(Instant::now() + Duration::from_secs(1))
            .wait();
        event_loop.join();
        report
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        let event_loop = start("order-loop");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let order = order.clone();
            event_loop.execute(move || order.lock().push(i)).unwrap();
        }

        let done = Completion::new();
        let done_clone = done.clone();
        event_loop
            .execute(move || {
                done_clone.complete(());
            })
            .unwrap();
        done.wait_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
        stop(&event_loop);
    }

    #[test]
    fn test_tasks_run_on_the_loop_thread() {
        let event_loop = start("affinity-loop");
        let observed = Completion::new();

        let handle = event_loop.clone();
        let observed_clone = observed.clone();
        event_loop
            .execute(move || {
                let name = thread::current().name().map(str::to_string);
                let in_loop = handle.in_event_loop();
                observed_clone.complete((in_loop, local::is_event_loop_thread(), name));
            })
            .unwrap();

        let (in_loop, is_loop_thread, name) =
            observed.wait_timeout(Duration::from_secs(2)).unwrap();
        assert!(in_loop);
        assert!(is_loop_thread);
        assert_eq!(name.as_deref(), Some("affinity-loop"));
        assert!(!event_loop.in_event_loop());
        stop(&event_loop);
    }

    #[test]
    fn test_panicking_task_does_not_stop_loop() {
        let event_loop = start("panic-loop");
        event_loop.execute(|| panic!("task failure")).unwrap();

        let done = Completion::new();
        let done_clone = done.clone();
        event_loop
            .execute(move || {
                done_clone.complete(true);
            })
            .unwrap();
        assert_eq!(done.wait_timeout(Duration::from_secs(2)), Some(true));
        stop(&event_loop);
    }

    #[test]
    fn test_execute_after_shutdown_fails() {
        let event_loop = start("closed-loop");
        stop(&event_loop);
        assert!(!event_loop.is_running());
        assert_eq!(event_loop.execute(|| {}), Err(LoopError::Shutdown));
    }

    #[test]
    fn test_shutdown_runs_local_hooks() {
        let event_loop = start("hook-loop");
        let fired = Arc::new(AtomicBool::new(false));

        let fired_clone = fired.clone();
        event_loop
            .execute(move || {
                local::on_shutdown(move || fired_clone.store(true, Ordering::SeqCst));
            })
            .unwrap();

        let report = stop(&event_loop);
        assert_eq!(report.shutdown_hooks, 1);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_spawn_local_requires_loop_thread() {
        let event_loop = start("spawn-loop");
        assert!(matches!(
            event_loop.spawn_local(async {}),
            Err(LoopError::WouldDeadlock)
        ));

        let result = Completion::new();
        let result_clone = result.clone();
        let handle = event_loop.clone();
        event_loop
            .execute(move || {
                let inner = result_clone.clone();
                let spawned = handle.spawn_local(async move {
                    inner.complete(7);
                });
                if spawned.is_err() {
                    result_clone.complete(-1);
                }
            })
            .unwrap();

        assert_eq!(result.wait_timeout(Duration::from_secs(2)), Some(7));
        stop(&event_loop);
    }

    #[test]
    fn test_channel_accounting() {
        let event_loop = start("count-loop");
        event_loop.register_channel();
        event_loop.register_channel();
        assert_eq!(event_loop.channel_count(), 2);
        event_loop.deregister_channel();
        event_loop.deregister_channel();
        event_loop.deregister_channel();
        assert_eq!(event_loop.channel_count(), 0);
        stop(&event_loop);
    }

    #[test]
    fn test_weak_handle() {
        let event_loop = start("weak-loop");
        let weak = event_loop.downgrade();
        assert_eq!(weak.upgrade(), Some(event_loop.clone()));
        stop(&event_loop);
    }
}
