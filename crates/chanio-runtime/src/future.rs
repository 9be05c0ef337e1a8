//! Pending results of asynchronous operations
//!
//! A [`PendingFuture`] is resolved exactly once: the first of
//! completion, failure, cancellation or timeout wins and every later
//! attempt is ignored. If the operation was started with a completion
//! handler, resolving dispatches the handler through the invoker
//! instead of storing the result.
//!
//! The wait latch (a condvar) is created lazily, on the first `wait`
//! that actually has to block.

use crate::group::{AsyncChannel, ChannelGroup};
use crate::invoker::{self, Handler};
use crate::timer::TimeoutHandle;

use chanio_core::{ChannelError, OpKind, Result};

use log::warn;
use parking_lot::{Condvar, Mutex};

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

enum Slot<V> {
    Pending,
    Ready(Result<V>),
    /// Outcome went to the completion handler
    Dispatched,
    /// Outcome already retrieved by `wait`
    Taken,
}

struct FutureState<V, A> {
    slot: Slot<V>,
    callback: Option<(Handler<V, A>, A)>,
    timer: Option<TimeoutHandle>,
    cancelled: bool,
}

struct FutureInner<V, A> {
    group: ChannelGroup,
    channel: Option<Weak<dyn AsyncChannel>>,
    kind: OpKind,
    state: Mutex<FutureState<V, A>>,
    latch: OnceLock<Condvar>,
}

/// Type-erased resolution side of a pending future
///
/// Channels keep their outstanding operations as
/// `Arc<dyn Completion<V>>`, whatever attachment type the caller used.
pub trait Completion<V>: Send + Sync {
    /// Resolve with `outcome`. `Ok(false)` if already resolved.
    fn complete(&self, outcome: Result<V>) -> Result<bool>;

    /// Attach the timeout task; cancelled when the future resolves.
    fn set_timeout(&self, handle: TimeoutHandle);

    fn is_done(&self) -> bool;
}

/// Result of an asynchronous channel operation
pub struct PendingFuture<V, A = ()> {
    inner: Arc<FutureInner<V, A>>,
}

impl<V, A> Clone for PendingFuture<V, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V, A> fmt::Debug for PendingFuture<V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        let slot = match state.slot {
            Slot::Pending => "pending",
            Slot::Ready(Ok(_)) => "ready",
            Slot::Ready(Err(_)) => "failed",
            Slot::Dispatched => "dispatched",
            Slot::Taken => "taken",
        };
        f.debug_struct("PendingFuture")
            .field("kind", &self.inner.kind)
            .field("state", &slot)
            .finish()
    }
}

impl<V, A> FutureInner<V, A>
where
    V: Send + 'static,
    A: Send + 'static,
{
    fn new(
        group: &ChannelGroup,
        channel: Option<Weak<dyn AsyncChannel>>,
        kind: OpKind,
        callback: Option<(Handler<V, A>, A)>,
    ) -> Self {
        Self {
            group: group.clone(),
            channel,
            kind,
            state: Mutex::new(FutureState {
                slot: Slot::Pending,
                callback,
                timer: None,
                cancelled: false,
            }),
            latch: OnceLock::new(),
        }
    }

    fn resolve(&self, outcome: Result<V>, cancelling: bool) -> Result<bool> {
        let dispatch = {
            let mut state = self.state.lock();
            if !matches!(state.slot, Slot::Pending) {
                return Ok(false);
            }
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.cancelled = cancelling;
            match state.callback.take() {
                Some((handler, attachment)) => {
                    state.slot = Slot::Dispatched;
                    Some((handler, attachment, outcome))
                }
                None => {
                    state.slot = Slot::Ready(outcome);
                    None
                }
            }
        };
        if let Some(latch) = self.latch.get() {
            latch.notify_all();
        }
        if let Some((handler, attachment, outcome)) = dispatch {
            invoker::invoke(&self.group, handler, outcome, attachment)?;
        }
        Ok(true)
    }
}

impl<V, A> Completion<V> for FutureInner<V, A>
where
    V: Send + 'static,
    A: Send + 'static,
{
    fn complete(&self, outcome: Result<V>) -> Result<bool> {
        self.resolve(outcome, false)
    }

    fn set_timeout(&self, handle: TimeoutHandle) {
        let mut state = self.state.lock();
        if matches!(state.slot, Slot::Pending) {
            state.timer = Some(handle);
        } else {
            drop(state);
            handle.cancel();
        }
    }

    fn is_done(&self) -> bool {
        !matches!(self.state.lock().slot, Slot::Pending)
    }
}

impl<V> PendingFuture<V, ()>
where
    V: Send + 'static,
{
    /// Future form: the outcome is stored for `wait`.
    pub fn new(group: &ChannelGroup, channel: Option<Weak<dyn AsyncChannel>>, kind: OpKind) -> Self {
        Self {
            inner: Arc::new(FutureInner::new(group, channel, kind, None)),
        }
    }

    /// Already resolved future (failure before the operation started).
    pub fn completed(group: &ChannelGroup, kind: OpKind, outcome: Result<V>) -> Self {
        let future = Self::new(group, None, kind);
        let _ = future.inner.resolve(outcome, false);
        future
    }
}

impl<V, A> PendingFuture<V, A>
where
    V: Send + 'static,
    A: Send + 'static,
{
    /// Handler form: the outcome goes to `handler` with `attachment`.
    pub fn with_handler<F>(
        group: &ChannelGroup,
        channel: Option<Weak<dyn AsyncChannel>>,
        kind: OpKind,
        attachment: A,
        handler: F,
    ) -> Self
    where
        F: FnOnce(Result<V>, A) + Send + 'static,
    {
        let callback: Handler<V, A> = Box::new(handler);
        Self {
            inner: Arc::new(FutureInner::new(
                group,
                channel,
                kind,
                Some((callback, attachment)),
            )),
        }
    }

    /// Resolve with `outcome`; see [`Completion::complete`].
    ///
    /// `Err(GroupShutdown)` means the handler could not be dispatched.
    pub fn complete(&self, outcome: Result<V>) -> Result<bool> {
        self.inner.resolve(outcome, false)
    }

    /// Type-erased handle for the channel's pending-operation slot
    pub fn completion(&self) -> Arc<dyn Completion<V>> {
        self.inner.clone()
    }

    pub fn set_timeout(&self, handle: TimeoutHandle) {
        self.inner.set_timeout(handle);
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.inner.kind
    }

    pub fn group(&self) -> &ChannelGroup {
        &self.inner.group
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// True if `cancel` won the race to resolve this future
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Cancel the operation.
    ///
    /// The owning channel is told first so the direction is killed
    /// (later attempts in that direction fail). With `force_close` the
    /// channel is closed as well. Returns true if this call resolved
    /// the future.
    pub fn cancel(&self, force_close: bool) -> bool {
        if self.is_done() {
            return false;
        }
        let channel = self.inner.channel.as_ref().and_then(Weak::upgrade);
        if let Some(channel) = &channel {
            channel.on_cancel(self.inner.kind);
        }
        let won = match self.inner.resolve(Err(ChannelError::Cancelled), true) {
            Ok(won) => won,
            Err(e) => {
                warn!("cancelled handler not dispatched: {}", e);
                true
            }
        };
        if force_close {
            if let Some(channel) = channel {
                if let Err(e) = channel.close() {
                    warn!("close after cancel failed: {}", e);
                }
            }
        }
        won
    }

    /// Block until resolved and take the outcome.
    pub fn wait(&self) -> Result<V> {
        self.take(None)
    }

    /// Like `wait`, but gives up with `TimedOut` after `timeout`.
    /// The operation keeps running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<V> {
        self.take(Some(Instant::now() + timeout))
    }

    fn take(&self, deadline: Option<Instant>) -> Result<V> {
        let mut state = self.inner.state.lock();
        loop {
            match state.slot {
                Slot::Pending => {}
                Slot::Ready(_) => {
                    return match std::mem::replace(&mut state.slot, Slot::Taken) {
                        Slot::Ready(outcome) => outcome,
                        _ => Err(ChannelError::IllegalState("future state changed")),
                    };
                }
                Slot::Dispatched => {
                    return Err(ChannelError::IllegalState(
                        "outcome was delivered to the completion handler",
                    ))
                }
                Slot::Taken => return Err(ChannelError::IllegalState("outcome already taken")),
            }
            let latch = self.inner.latch.get_or_init(Condvar::new);
            match deadline {
                None => latch.wait(&mut state),
                Some(deadline) => {
                    if latch.wait_until(&mut state, deadline).timed_out()
                        && matches!(state.slot, Slot::Pending)
                    {
                        return Err(ChannelError::TimedOut);
                    }
                }
            }
        }
    }
}
