//! Ordered registries of fallible lifecycle callbacks.
//!
//! A [`HookRegistry`] holds callbacks for one lifecycle event. Hooks run in
//! registration order. Each hook is independently fallible: a hook that
//! returns an error or panics is recorded as a [`HookFailure`] and the
//! remaining hooks still run.
//!
//! Registries are plain values. Cloning one is cheap (hooks are shared behind
//! `Arc`), which lets configuration types embed them and clone on write.
//!
//! # Example
//!
//! ```
//! use horizon_datagram_core::hooks::{HookError, HookRegistry};
//!
//! let mut hooks = HookRegistry::<u16>::named("on_bind");
//! hooks.add(|port| {
//!     if *port == 0 { Err(HookError::new("ephemeral port")) } else { Ok(()) }
//! });
//! hooks.add(|_| Ok(()));
//!
//! let failures = hooks.run(&0);
//! assert_eq!(failures.len(), 1);
//! assert!(hooks.run(&8080).is_empty());
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::logging::targets;

/// Counter for unique hook IDs.
static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a registered hook, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

impl HookId {
    fn next() -> Self {
        Self(NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Error returned by a failing hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    /// Create a hook error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::new(format!("hook panicked: {}", panic_message(&*payload)))
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A recorded hook failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    /// The lifecycle event the hook belongs to.
    pub event: &'static str,
    /// The hook that failed.
    pub hook: HookId,
    /// What went wrong.
    pub error: HookError,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hook #{} failed: {}", self.event, self.hook.0, self.error)
    }
}

type HookFn<Args> = Arc<dyn Fn(&Args) -> Result<(), HookError> + Send + Sync>;

/// An ordered registry of fallible callbacks for one lifecycle event.
pub struct HookRegistry<Args> {
    event: &'static str,
    hooks: Vec<(HookId, HookFn<Args>)>,
}

impl<Args> Clone for HookRegistry<Args> {
    fn clone(&self) -> Self {
        Self {
            event: self.event,
            hooks: self.hooks.clone(),
        }
    }
}

impl<Args> Default for HookRegistry<Args> {
    fn default() -> Self {
        Self::named("hook")
    }
}

impl<Args> HookRegistry<Args> {
    /// Create an empty registry for the named lifecycle event.
    pub fn named(event: &'static str) -> Self {
        Self {
            event,
            hooks: Vec::new(),
        }
    }

    /// The lifecycle event name.
    pub fn event(&self) -> &'static str {
        self.event
    }

    /// Register a hook. Hooks run in registration order.
    pub fn add<F>(&mut self, hook: F) -> HookId
    where
        F: Fn(&Args) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let id = HookId::next();
        self.hooks.push((id, Arc::new(hook)));
        id
    }

    /// Remove a hook. Returns `true` if it was registered.
    pub fn remove(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(hook_id, _)| *hook_id != id);
        self.hooks.len() != before
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Check whether no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook in registration order.
    ///
    /// A failing or panicking hook does not stop the remaining hooks; every
    /// failure is logged and returned.
    pub fn run(&self, args: &Args) -> Vec<HookFailure> {
        let mut failures = Vec::new();
        for (id, hook) in &self.hooks {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook(args)))
                .unwrap_or_else(|payload| Err(HookError::from_panic(payload)));

            if let Err(error) = outcome {
                let failure = HookFailure {
                    event: self.event,
                    hook: *id,
                    error,
                };
                tracing::warn!(
                    target: targets::HOOKS,
                    event = self.event,
                    hook = id.0,
                    "{failure}"
                );
                failures.push(failure);
            }
        }
        failures
    }
}

impl<Args> fmt::Debug for HookRegistry<Args> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("event", &self.event)
            .field("len", &self.hooks.len())
            .finish()
    }
}

/// Render a panic payload as text.
///
/// Used wherever user code runs under `catch_unwind`.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
