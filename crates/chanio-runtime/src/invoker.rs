//! Completion handler invocation
//!
//! Decides whether a completion handler runs on the current thread's
//! stack (direct) or is handed to the group's pool (indirect).
//!
//! A thread may invoke directly only when it belongs to the handler's
//! group and fewer than `max_handlers_on_stack` handlers are already
//! nested on its stack. Group threads that run handlers carry a
//! thread-local marker `{group_id, depth}`; internal polling threads,
//! the timeout thread and foreign threads carry none and always go
//! through the pool.

use crate::group::ChannelGroup;
use crate::Task;

use chanio_core::{ChannelError, Result};

use std::cell::Cell;

/// Completion handler: receives the outcome and the caller's attachment
pub type Handler<V, A> = Box<dyn FnOnce(Result<V>, A) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
struct HandlerContext {
    group_id: u64,
    depth: usize,
}

thread_local! {
    static CONTEXT: Cell<Option<HandlerContext>> = const { Cell::new(None) };
}

/// Mark the current thread as a handler thread of `group_id`.
pub(crate) fn bind_thread(group_id: u64) {
    CONTEXT.with(|c| c.set(Some(HandlerContext { group_id, depth: 0 })));
}

/// Back at the top of a pool loop: nothing is nested any more.
pub(crate) fn reset_depth() {
    CONTEXT.with(|c| {
        if let Some(mut ctx) = c.get() {
            ctx.depth = 0;
            c.set(Some(ctx));
        }
    });
}

/// Group id of the current thread, if it is a handler thread
pub fn current_group_id() -> Option<u64> {
    CONTEXT.with(|c| c.get().map(|ctx| ctx.group_id))
}

/// Handlers currently nested on this thread's stack
pub fn handler_depth() -> usize {
    CONTEXT.with(|c| c.get().map_or(0, |ctx| ctx.depth))
}

/// True if the current thread runs handlers for `group`
pub fn is_group_thread(group: &ChannelGroup) -> bool {
    current_group_id() == Some(group.id())
}

/// True if a handler for `group` may run on this stack right now
pub fn may_invoke_direct(group: &ChannelGroup) -> bool {
    CONTEXT.with(|c| match c.get() {
        Some(ctx) => {
            ctx.group_id == group.id() && ctx.depth < group.config().max_handlers_on_stack
        }
        None => false,
    })
}

/// Sets the nesting depth for a scope and restores the previous value
/// on exit, even if the handler unwinds.
struct DepthScope {
    saved: Option<usize>,
}

impl DepthScope {
    fn set(f: impl FnOnce(usize) -> usize) -> Self {
        let saved = CONTEXT.with(|c| {
            c.get().map(|mut ctx| {
                let saved = ctx.depth;
                ctx.depth = f(saved);
                c.set(Some(ctx));
                saved
            })
        });
        DepthScope { saved }
    }
}

impl Drop for DepthScope {
    fn drop(&mut self) {
        if let Some(saved) = self.saved {
            CONTEXT.with(|c| {
                if let Some(mut ctx) = c.get() {
                    ctx.depth = saved;
                    c.set(Some(ctx));
                }
            });
        }
    }
}

/// Run the handler on this stack, counting it against the depth ceiling.
pub fn invoke_direct<V, A>(handler: Handler<V, A>, outcome: Result<V>, attachment: A) {
    let _depth = DepthScope::set(|d| d + 1);
    handler(outcome, attachment);
}

/// Hand the handler to the group's pool.
///
/// If the pool rejects the task (group terminating) and the current
/// thread belongs to the group, the handler runs here instead;
/// otherwise the caller gets `GroupShutdown`.
pub fn invoke_indirectly<V, A>(
    group: &ChannelGroup,
    handler: Handler<V, A>,
    outcome: Result<V>,
    attachment: A,
) -> Result<()>
where
    V: Send + 'static,
    A: Send + 'static,
{
    // A handler started from the pool is the first one on its stack.
    let task: Task = Box::new(move || {
        let _depth = DepthScope::set(|_| 1);
        handler(outcome, attachment)
    });
    match group.try_execute(task) {
        Ok(()) => Ok(()),
        Err(task) if is_group_thread(group) => {
            task();
            Ok(())
        }
        Err(_) => Err(ChannelError::GroupShutdown),
    }
}

/// Invoke directly when allowed, otherwise through the pool.
pub fn invoke<V, A>(
    group: &ChannelGroup,
    handler: Handler<V, A>,
    outcome: Result<V>,
    attachment: A,
) -> Result<()>
where
    V: Send + 'static,
    A: Send + 'static,
{
    if may_invoke_direct(group) {
        invoke_direct(handler, outcome, attachment);
        Ok(())
    } else {
        invoke_indirectly(group, handler, outcome, attachment)
    }
}

/// Run `task` here if this is one of the group's threads, else on the pool.
pub fn invoke_on_thread_in_pool(group: &ChannelGroup, task: Task) -> Result<()> {
    if is_group_thread(group) {
        task();
        Ok(())
    } else {
        group
            .try_execute(task)
            .map_err(|_| ChannelError::GroupShutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_foreign_thread_goes_indirect() {
        let group = ChannelGroup::new(GroupConfig::fixed(1)).unwrap();
        assert!(!may_invoke_direct(&group));
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        invoke(
            &group,
            Box::new(move |r: Result<u32>, att: &'static str| {
                tx.send((r, att, thread::current().id())).unwrap();
            }),
            Ok(7),
            "att",
        )
        .unwrap();
        let (r, att, ran_on) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(r, Ok(7));
        assert_eq!(att, "att");
        assert_ne!(ran_on, caller);
        group.shutdown_now().unwrap();
    }

    #[test]
    fn test_group_thread_invokes_direct_and_restores_depth() {
        let group = ChannelGroup::new(GroupConfig::fixed(1)).unwrap();
        let g = group.clone();
        let (tx, rx) = mpsc::channel();
        group
            .execute(move || {
                let outer = thread::current().id();
                let before = handler_depth();
                let tx2 = tx.clone();
                invoke(
                    &g,
                    Box::new(move |_: Result<()>, ()| {
                        tx2.send(("inner", thread::current().id() == outer, handler_depth()))
                            .unwrap();
                    }),
                    Ok(()),
                    (),
                )
                .unwrap();
                tx.send(("outer", true, handler_depth() - before)).unwrap();
            })
            .unwrap();
        let inner = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(inner, ("inner", true, 1));
        let outer = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outer, ("outer", true, 0));
        group.shutdown_now().unwrap();
    }

    #[test]
    fn test_rejected_off_group_is_group_shutdown() {
        let group = ChannelGroup::new(GroupConfig::fixed(1)).unwrap();
        group.shutdown();
        assert!(group.await_termination(Duration::from_secs(5)));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let res = invoke(
            &group,
            Box::new(move |_: Result<()>, ()| {
                r.fetch_add(1, Ordering::SeqCst);
            }),
            Ok(()),
            (),
        );
        assert_eq!(res, Err(ChannelError::GroupShutdown));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(
            invoke_on_thread_in_pool(&group, Box::new(|| {})),
            Err(ChannelError::GroupShutdown)
        );
    }
}
