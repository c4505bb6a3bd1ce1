//! Fixed-size pools of event loops.
//!
//! An [`EventLoopGroup`] owns a fixed number of loop slots. The first
//! `min_threads` loops start eagerly; the rest start the first time they are
//! selected. Once created, the slot count never changes.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::completion::Completion;
use crate::error::{LoopError, Result};
use crate::event_loop::{EventLoop, LoopReport};
use crate::logging::targets;

/// Timeout used when a non-daemon group is dropped without being shut down.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of loops: the available parallelism, but at least four.
pub fn default_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(4)
}

/// Configuration for an [`EventLoopGroup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLoopGroupConfig {
    /// Prefix of loop thread names (`{prefix}-{index}`).
    pub name_prefix: String,
    /// Loops started when the group is created.
    pub min_threads: usize,
    /// Total number of loop slots.
    pub max_threads: usize,
    /// When `true`, dropping the group does not shut its loops down.
    pub daemon: bool,
}

impl Default for EventLoopGroupConfig {
    fn default() -> Self {
        Self {
            name_prefix: "horizon-udp".to_string(),
            min_threads: 1,
            max_threads: default_threads(),
            daemon: false,
        }
    }
}

impl EventLoopGroupConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name prefix.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the number of eagerly started loops.
    pub fn min_threads(mut self, threads: usize) -> Self {
        self.min_threads = threads;
        self
    }

    /// Set the total number of loops.
    pub fn max_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads;
        self
    }

    /// Start every loop eagerly, using exactly `threads` loops.
    pub fn threads(mut self, threads: usize) -> Self {
        self.min_threads = threads;
        self.max_threads = threads;
        self
    }

    /// Set whether the group detaches on drop.
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(LoopError::InvalidConfig(
                "max_threads must be at least 1".into(),
            ));
        }
        if self.min_threads > self.max_threads {
            return Err(LoopError::InvalidConfig(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if self.name_prefix.is_empty() {
            return Err(LoopError::InvalidConfig("name_prefix is empty".into()));
        }
        Ok(())
    }
}

/// Outcome of a group shutdown, summed over all loops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that ran after shutdown was requested.
    pub drained: usize,
    /// Tasks dropped because the deadline had passed.
    pub cancelled: usize,
}

impl ShutdownReport {
    fn absorb(&mut self, report: LoopReport) {
        self.drained += report.drained;
        self.cancelled += report.cancelled;
    }
}

struct GroupInner {
    config: EventLoopGroupConfig,
    slots: Mutex<Vec<Option<EventLoop>>>,
    next: AtomicUsize,
    accepting: AtomicBool,
    termination: Mutex<Option<Completion<ShutdownReport>>>,
}

impl GroupInner {
    fn begin_shutdown(&self, timeout: Duration) -> Completion<ShutdownReport> {
        let mut termination = self.termination.lock();
        if let Some(existing) = termination.as_ref() {
            return existing.clone();
        }

        self.accepting.store(false, Ordering::Release);
        let completion = Completion::new();
        *termination = Some(completion.clone());
        drop(termination);

        let deadline = Instant::now() + timeout;
        let loops: Vec<EventLoop> = self.slots.lock().iter().flatten().cloned().collect();
        let pending: Vec<_> = loops
            .iter()
            .map(|event_loop| event_loop.begin_shutdown(deadline))
            .collect();

        tracing::debug!(
            target: targets::GROUP,
            prefix = %self.config.name_prefix,
            loops = loops.len(),
            ?timeout,
            "event loop group shutting down"
        );

        let finish = {
            let completion = completion.clone();
            let prefix = self.config.name_prefix.clone();
            move || {
                let mut report = ShutdownReport::default();
                for termination in pending {
                    report.absorb(termination.wait());
                }
                for event_loop in &loops {
                    event_loop.join();
                }
                tracing::debug!(
                    target: targets::GROUP,
                    prefix = %prefix,
                    drained = report.drained,
                    cancelled = report.cancelled,
                    "event loop group terminated"
                );
                completion.complete(report);
            }
        };

        // A loop cannot wait for itself, so shutdowns requested from a loop
        // thread (or from drop) finish on a watcher thread.
        let spawned = thread::Builder::new()
            .name(format!("{}-shutdown", self.config.name_prefix))
            .spawn(finish);
        if let Err(e) = spawned {
            tracing::warn!(target: targets::GROUP, error = %e, "failed to spawn shutdown watcher");
            completion.complete(ShutdownReport::default());
        }

        completion
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if !self.config.daemon {
            self.begin_shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
        }
    }
}

/// A fixed-size pool of single-threaded event loops.
///
/// Cloning the group yields another handle to the same pool.
#[derive(Clone)]
pub struct EventLoopGroup {
    inner: Arc<GroupInner>,
}

impl EventLoopGroup {
    /// Create a group from a configuration.
    pub fn new(config: EventLoopGroupConfig) -> Result<Self> {
        config.validate()?;

        let mut slots: Vec<Option<EventLoop>> = Vec::with_capacity(config.max_threads);
        for index in 0..config.max_threads {
            if index < config.min_threads {
                let event_loop = EventLoop::start(index, loop_name(&config.name_prefix, index));
                match event_loop {
                    Ok(event_loop) => slots.push(Some(event_loop)),
                    Err(e) => {
                        let deadline = Instant::now();
                        for started in slots.iter().flatten() {
                            started.begin_shutdown(deadline);
                            started.join();
                        }
                        return Err(e);
                    }
                }
            } else {
                slots.push(None);
            }
        }

        tracing::debug!(
            target: targets::GROUP,
            prefix = %config.name_prefix,
            min = config.min_threads,
            max = config.max_threads,
            daemon = config.daemon,
            "event loop group created"
        );

        Ok(Self {
            inner: Arc::new(GroupInner {
                config,
                slots: Mutex::new(slots),
                next: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                termination: Mutex::new(None),
            }),
        })
    }

    /// Create a group with exactly `threads` eagerly started loops.
    pub fn with_threads(threads: usize) -> Result<Self> {
        Self::new(EventLoopGroupConfig::new().threads(threads))
    }

    /// The process-wide shared group.
    ///
    /// Created on first use with [`default_threads`] lazily started loops.
    /// It is a daemon group and is never shut down implicitly.
    pub fn global() -> Result<Self> {
        static GLOBAL: OnceLock<EventLoopGroup> = OnceLock::new();
        if let Some(group) = GLOBAL.get() {
            return Ok(group.clone());
        }
        let group = Self::new(
            EventLoopGroupConfig::new()
                .name_prefix("horizon-udp-global")
                .min_threads(0)
                .daemon(true),
        )?;
        Ok(GLOBAL.get_or_init(|| group).clone())
    }

    /// The group's configuration.
    pub fn config(&self) -> &EventLoopGroupConfig {
        &self.inner.config
    }

    /// Number of loop slots. Fixed for the group's lifetime.
    pub fn size(&self) -> usize {
        self.inner.config.max_threads
    }

    /// Loops that have been started so far.
    pub fn loops(&self) -> Vec<EventLoop> {
        self.inner.slots.lock().iter().flatten().cloned().collect()
    }

    /// Check whether shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        !self.inner.accepting.load(Ordering::Acquire)
    }

    /// Check whether `event_loop` belongs to this group.
    pub fn contains(&self, event_loop: &EventLoop) -> bool {
        self.inner
            .slots
            .lock()
            .iter()
            .flatten()
            .any(|candidate| candidate == event_loop)
    }

    /// Check whether the calling thread is one of this group's loops.
    pub fn in_event_loop(&self) -> bool {
        self.inner
            .slots
            .lock()
            .iter()
            .flatten()
            .any(EventLoop::in_event_loop)
    }

    /// Pick the next loop in round-robin order.
    pub fn assign_loop(&self) -> Result<EventLoop> {
        self.ensure_accepting()?;
        let index = self.inner.next.fetch_add(1, Ordering::Relaxed) % self.size();
        self.loop_at(index)
    }

    /// Pick the loop with the fewest channels; ties go to the lowest id.
    ///
    /// A slot that has not started yet counts as empty.
    pub fn assign_least_loaded(&self) -> Result<EventLoop> {
        self.ensure_accepting()?;
        let index = {
            let slots = self.inner.slots.lock();
            slots
                .iter()
                .enumerate()
                .min_by_key(|(index, slot)| {
                    (slot.as_ref().map_or(0, EventLoop::channel_count), *index)
                })
                .map(|(index, _)| index)
                .unwrap_or(0)
        };
        self.loop_at(index)
    }

    /// Shut the group down.
    ///
    /// Stops accepting assignments and tasks, lets queued tasks run until
    /// `timeout` elapses, then drops whatever is still queued. The returned
    /// completion resolves once every loop thread has exited. Later calls
    /// return the same completion.
    pub fn shutdown_gracefully(&self, timeout: Duration) -> Completion<ShutdownReport> {
        self.inner.begin_shutdown(timeout)
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(LoopError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn loop_at(&self, index: usize) -> Result<EventLoop> {
        let mut slots = self.inner.slots.lock();
        if let Some(event_loop) = &slots[index] {
            return Ok(event_loop.clone());
        }

        // Re-checked under the slot lock so a loop never starts after
        // shutdown collected the running ones.
        self.ensure_accepting()?;
        let name = loop_name(&self.inner.config.name_prefix, index);
        let event_loop = EventLoop::start(index, name).map_err(|e| {
            tracing::warn!(target: targets::GROUP, index, error = %e, "failed to start event loop");
            LoopError::ResourceExhausted(self.inner.config.name_prefix.clone())
        })?;
        slots[index] = Some(event_loop.clone());
        Ok(event_loop)
    }
}

fn loop_name(prefix: &str, index: usize) -> String {
    format!("{prefix}-{index}")
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("name_prefix", &self.inner.config.name_prefix)
            .field("size", &self.size())
            .field("started", &self.loops().len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl PartialEq for EventLoopGroup {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventLoopGroup {}

static_assertions::assert_impl_all!(EventLoopGroup: Send, Sync, Clone);
