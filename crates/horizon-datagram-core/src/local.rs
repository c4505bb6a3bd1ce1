//! Loop-local context.
//!
//! Code running on a loop thread can look up the loop it runs on and register
//! callbacks that run when that loop stops. Everything here is thread-local
//! and therefore lock-free; calling these functions from a thread that is not
//! an event loop is harmless and reports `None`/`false`.

use std::cell::RefCell;
use std::sync::Weak;

use crate::event_loop::{EventLoop, LoopShared};

/// Identifier of a loop-local shutdown hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShutdownHookId(u64);

struct LocalContext {
    event_loop: Weak<LoopShared>,
    next_hook: u64,
    shutdown_hooks: Vec<(ShutdownHookId, Box<dyn FnOnce()>)>,
}

thread_local! {
    static CONTEXT: RefCell<Option<LocalContext>> = const { RefCell::new(None) };
}

pub(crate) fn enter(event_loop: Weak<LoopShared>) {
    CONTEXT.with(|ctx| {
        *ctx.borrow_mut() = Some(LocalContext {
            event_loop,
            next_hook: 1,
            shutdown_hooks: Vec::new(),
        });
    });
}

pub(crate) fn exit() {
    CONTEXT.with(|ctx| ctx.borrow_mut().take());
}

/// Run and clear every registered shutdown hook, in registration order.
///
/// Returns the number of hooks that ran.
pub(crate) fn run_shutdown_hooks() -> usize {
    let hooks = CONTEXT.with(|ctx| {
        ctx.borrow_mut()
            .as_mut()
            .map(|ctx| std::mem::take(&mut ctx.shutdown_hooks))
            .unwrap_or_default()
    });
    let count = hooks.len();
    for (_, hook) in hooks {
        hook();
    }
    count
}

/// Get the event loop the current thread belongs to.
///
/// Returns `None` when called outside of an event loop thread.
pub fn current_loop() -> Option<EventLoop> {
    CONTEXT.with(|ctx| {
        ctx.borrow()
            .as_ref()
            .and_then(|ctx| ctx.event_loop.upgrade())
            .map(EventLoop::from_shared)
    })
}

/// Check whether the current thread is an event loop thread.
pub fn is_event_loop_thread() -> bool {
    CONTEXT.with(|ctx| ctx.borrow().is_some())
}

/// Register a callback that runs on this loop when it shuts down.
///
/// Returns `None` when called outside of an event loop thread.
pub fn on_shutdown<F>(hook: F) -> Option<ShutdownHookId>
where
    F: FnOnce() + 'static,
{
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        let ctx = ctx.as_mut()?;
        let id = ShutdownHookId(ctx.next_hook);
        ctx.next_hook += 1;
        ctx.shutdown_hooks.push((id, Box::new(hook)));
        Some(id)
    })
}

/// Remove a previously registered shutdown hook without running it.
///
/// Returns `true` if the hook was still registered.
pub fn cancel_shutdown_hook(id: ShutdownHookId) -> bool {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        match ctx.as_mut() {
            Some(ctx) => {
                let before = ctx.shutdown_hooks.len();
                ctx.shutdown_hooks.retain(|(hook_id, _)| *hook_id != id);
                ctx.shutdown_hooks.len() != before
            }
            None => false,
        }
    })
}
