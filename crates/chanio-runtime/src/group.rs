//! Channel groups
//!
//! A group owns the threads that poll for readiness and run
//! completion handlers, the timeout facility, and the registry of
//! member channels.
//!
//! # Lifecycle
//!
//! ```text
//!   running ──shutdown()──► shutdown ──last member leaves──► terminating ──threads gone──► terminated
//!      │                                                        ▲
//!      └──────────────shutdown_now(): close every member────────┘
//! ```
//!
//! Shutdown refuses new members but lets existing channels keep
//! working. Termination closes the port, the user pool and the
//! timeout thread; threads exit on their own and the last one marks
//! the group terminated. Threads are never joined.

use crate::config::{GroupConfig, ThreadModel};
use crate::invoker;
use crate::pool::TaskPool;
use crate::port::{PollableChannel, Port};
use crate::timer::{TimeoutHandle, TimeoutScheduler};
use crate::Task;

use chanio_core::{ChannelError, Events, OpKind, RawHandle, Result};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// A channel bound to a group
pub trait AsyncChannel: Send + Sync {
    /// The future of a `kind` operation was cancelled; fail that
    /// direction from now on.
    fn on_cancel(&self, kind: OpKind);

    /// Close the channel, failing its outstanding operations.
    fn close(&self) -> Result<()>;
}

/// Key of a registered member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberKey(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    /// Polls only (split groups)
    Internal,
    /// Polls and runs tasks (fixed groups)
    Pooled,
    /// Runs tasks only (split groups)
    User,
}

impl ThreadRole {
    fn tag(self) -> &'static str {
        match self {
            ThreadRole::Internal => "internal",
            ThreadRole::Pooled => "pool",
            ThreadRole::User => "user",
        }
    }
}

#[derive(Default)]
struct Members {
    next_key: u64,
    channels: HashMap<u64, Weak<dyn AsyncChannel>>,
}

struct GroupShared {
    id: u64,
    config: GroupConfig,
    port: Port,
    pool: Option<TaskPool>,
    timeouts: TimeoutScheduler,
    members: Mutex<Members>,
    shutdown: AtomicBool,
    terminate_initiated: AtomicBool,
    threads: AtomicUsize,
    thread_seq: AtomicUsize,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
}

/// Shared-ownership handle to a channel group
#[derive(Clone)]
pub struct ChannelGroup {
    shared: Arc<GroupShared>,
}

impl fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("id", &self.shared.id)
            .field("model", &self.shared.config.model)
            .field("threads", &self.thread_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl ChannelGroup {
    /// Create a group and start its threads.
    pub fn new(config: GroupConfig) -> Result<Self> {
        config.validate().map_err(ChannelError::InvalidArgument)?;

        let (task_capacity, pool) = match config.model {
            ThreadModel::Fixed(_) => (Some(config.task_queue_capacity), None),
            ThreadModel::Split { .. } => (None, Some(TaskPool::new())),
        };
        let port = Port::new(task_capacity, config.events_per_poll)?;
        let timeouts = TimeoutScheduler::start(&config.name).map_err(io_error)?;

        let shared = Arc::new(GroupShared {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            config,
            port,
            pool,
            timeouts,
            members: Mutex::new(Members::default()),
            shutdown: AtomicBool::new(false),
            terminate_initiated: AtomicBool::new(false),
            threads: AtomicUsize::new(0),
            thread_seq: AtomicUsize::new(0),
            terminated: Mutex::new(false),
            terminated_cv: Condvar::new(),
        });

        let roles: Vec<(ThreadRole, usize)> = match shared.config.model {
            ThreadModel::Fixed(n) => vec![(ThreadRole::Pooled, n)],
            ThreadModel::Split { internal, user } => {
                vec![(ThreadRole::Internal, internal), (ThreadRole::User, user)]
            }
        };
        for (role, n) in roles {
            for _ in 0..n {
                if let Err(e) = spawn_thread(&shared, role) {
                    shared.shutdown.store(true, Ordering::SeqCst);
                    shared.terminate();
                    return Err(e);
                }
            }
        }

        info!(
            "group {} started: {:?}, max {} handlers on stack",
            shared.id, shared.config.model, shared.config.max_handlers_on_stack
        );
        Ok(Self { shared })
    }

    /// Fixed group of `n` threads
    pub fn with_fixed_threads(n: usize) -> Result<Self> {
        Self::new(GroupConfig::fixed(n))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[inline]
    pub fn config(&self) -> &GroupConfig {
        &self.shared.config
    }

    /// Every thread polls and runs handlers
    #[inline]
    pub fn is_fixed_thread_pool(&self) -> bool {
        self.shared.config.model.is_fixed()
    }

    /// Run `task` on one of the group's handler threads.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_execute(Box::new(task))
            .map_err(|_| ChannelError::GroupShutdown)
    }

    /// Queue a task; hands it back if the group is terminating.
    pub fn try_execute(&self, task: Task) -> std::result::Result<(), Task> {
        if self.shared.terminate_initiated.load(Ordering::Acquire) {
            return Err(task);
        }
        match &self.shared.pool {
            Some(pool) => pool.submit(task),
            None => self.shared.port.offer_task(task),
        }
    }

    /// Run `task` on the timeout thread after `delay`.
    ///
    /// Returns `None` (and drops the task) once the group is terminating.
    pub fn schedule<F>(&self, task: F, delay: Duration) -> Option<TimeoutHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.terminate_initiated.load(Ordering::Acquire) {
            return None;
        }
        self.shared.timeouts.schedule(Box::new(task), delay)
    }

    // ── membership ──

    /// Add a channel. Fails with `GroupShutdown` after `shutdown`.
    pub fn register(&self, channel: Weak<dyn AsyncChannel>) -> Result<MemberKey> {
        let mut members = self.shared.members.lock();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(ChannelError::GroupShutdown);
        }
        let key = members.next_key;
        members.next_key += 1;
        members.channels.insert(key, channel);
        Ok(MemberKey(key))
    }

    /// Remove a channel; the last one out of a shut-down group
    /// starts termination.
    pub fn deregister(&self, key: MemberKey) {
        let empty = {
            let mut members = self.shared.members.lock();
            members.channels.remove(&key.0);
            members.channels.is_empty()
        };
        if empty && self.shared.shutdown.load(Ordering::Acquire) {
            self.shared.terminate();
        }
    }

    pub fn member_count(&self) -> usize {
        self.shared.members.lock().channels.len()
    }

    // ── readiness port ──

    /// Route events of `fd` to `channel`.
    pub fn register_pollable(&self, fd: RawHandle, channel: Weak<dyn PollableChannel>) {
        self.shared.port.register(fd, channel);
    }

    /// Stop routing events of `fd`. Call before closing the descriptor.
    pub fn unregister_pollable(&self, fd: RawHandle) {
        self.shared.port.unregister(fd);
    }

    /// Arm `fd` for one delivery of `events`.
    pub fn start_poll(&self, fd: RawHandle, events: Events) -> Result<()> {
        if self.shared.port.is_closed() {
            return Err(ChannelError::GroupShutdown);
        }
        self.shared.port.start_poll(fd, events)
    }

    // ── lifecycle ──

    /// Refuse new members; terminate once the current ones are closed.
    pub fn shutdown(&self) {
        let empty = {
            let members = self.shared.members.lock();
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            members.channels.is_empty()
        };
        info!("group {} shutting down", self.shared.id);
        if empty {
            self.shared.terminate();
        }
    }

    /// Shut down, close every member, and terminate.
    pub fn shutdown_now(&self) -> Result<()> {
        let members: Vec<Weak<dyn AsyncChannel>> = {
            let members = self.shared.members.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            members.channels.values().cloned().collect()
        };
        for channel in members.iter().filter_map(Weak::upgrade) {
            if let Err(e) = channel.close() {
                warn!("group {}: closing member failed: {}", self.shared.id, e);
            }
        }
        self.shared.terminate();
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        *self.shared.terminated.lock()
    }

    /// Wait for termination. Returns false on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut terminated = self.shared.terminated.lock();
        while !*terminated {
            if self
                .shared
                .terminated_cv
                .wait_until(&mut terminated, deadline)
                .timed_out()
            {
                return *terminated;
            }
        }
        true
    }

    /// Live group threads (timeout thread not included)
    pub fn thread_count(&self) -> usize {
        self.shared.threads.load(Ordering::Acquire)
    }

    /// True if the calling thread runs this group's handlers
    pub fn is_group_thread(&self) -> bool {
        invoker::is_group_thread(self)
    }
}

impl GroupShared {
    /// Stop all threads. Idempotent.
    fn terminate(&self) {
        if self.terminate_initiated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("group {} terminating", self.id);
        self.port.close();
        if let Some(pool) = &self.pool {
            pool.close();
        }
        self.timeouts.shutdown();
        if self.threads.load(Ordering::Acquire) == 0 {
            self.mark_terminated();
        }
    }

    fn thread_exited(&self) {
        if self.threads.fetch_sub(1, Ordering::AcqRel) == 1
            && self.terminate_initiated.load(Ordering::Acquire)
        {
            self.mark_terminated();
        }
    }

    fn mark_terminated(&self) {
        let mut terminated = self.terminated.lock();
        if !*terminated {
            *terminated = true;
            info!("group {} terminated", self.id);
        }
        self.terminated_cv.notify_all();
    }
}

fn io_error(e: std::io::Error) -> ChannelError {
    ChannelError::Os(e.raw_os_error().unwrap_or(libc::EIO))
}

fn spawn_thread(shared: &Arc<GroupShared>, role: ThreadRole) -> Result<()> {
    shared.threads.fetch_add(1, Ordering::AcqRel);
    let name = format!(
        "{}-{}-{}",
        shared.config.name,
        role.tag(),
        shared.thread_seq.fetch_add(1, Ordering::Relaxed)
    );
    let worker = shared.clone();
    match thread::Builder::new()
        .name(name)
        .spawn(move || run_thread(worker, role))
    {
        Ok(_) => Ok(()),
        Err(e) => {
            shared.thread_exited();
            Err(io_error(e))
        }
    }
}

fn run_thread(shared: Arc<GroupShared>, role: ThreadRole) {
    let _guard = ThreadGuard {
        shared: shared.clone(),
        role,
    };
    match role {
        ThreadRole::Internal => shared.port.run(false),
        ThreadRole::Pooled => {
            invoker::bind_thread(shared.id);
            shared.port.run(true);
        }
        ThreadRole::User => {
            invoker::bind_thread(shared.id);
            if let Some(pool) = &shared.pool {
                pool.run_worker();
            }
        }
    }
}

/// Replaces a thread killed by a panicking task, then accounts for its exit.
struct ThreadGuard {
    shared: Arc<GroupShared>,
    role: ThreadRole,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        if thread::panicking() && !self.shared.terminate_initiated.load(Ordering::Acquire) {
            warn!(
                "group {}: {} thread panicked, starting a replacement",
                self.shared.id,
                self.role.tag()
            );
            if let Err(e) = spawn_thread(&self.shared, self.role) {
                error!("group {}: replacement thread failed: {}", self.shared.id, e);
            }
        }
        self.shared.thread_exited();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::PendingFuture;
    use std::sync::mpsc;

    struct Member {
        group: ChannelGroup,
        key: Mutex<Option<MemberKey>>,
        closed: AtomicBool,
    }

    impl AsyncChannel for Member {
        fn on_cancel(&self, _kind: OpKind) {}

        fn close(&self) -> Result<()> {
            if !self.closed.swap(true, Ordering::SeqCst) {
                if let Some(key) = self.key.lock().take() {
                    self.group.deregister(key);
                }
            }
            Ok(())
        }
    }

    fn member(group: &ChannelGroup) -> Result<Arc<Member>> {
        let m = Arc::new(Member {
            group: group.clone(),
            key: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let weak: Weak<dyn AsyncChannel> = Arc::downgrade(&m) as Weak<dyn AsyncChannel>;
        *m.key.lock() = Some(group.register(weak)?);
        Ok(m)
    }

    #[test]
    fn test_execute_runs_on_group_thread() {
        let g = ChannelGroup::with_fixed_threads(2).unwrap();
        let g2 = g.clone();
        let (tx, rx) = mpsc::channel();
        g.execute(move || tx.send(g2.is_group_thread()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!g.is_group_thread());
        g.shutdown_now().unwrap();
        assert!(g.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_split_group_runs_tasks_on_user_threads() {
        let g = ChannelGroup::new(GroupConfig::split(1, 2)).unwrap();
        assert!(!g.is_fixed_thread_pool());
        let g2 = g.clone();
        let (tx, rx) = mpsc::channel();
        g.execute(move || tx.send(g2.is_group_thread()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        g.shutdown();
        assert!(g.await_termination(Duration::from_secs(5)));
        assert_eq!(g.thread_count(), 0);
    }

    #[test]
    fn test_shutdown_waits_for_members() {
        let g = ChannelGroup::with_fixed_threads(2).unwrap();
        let a = member(&g).unwrap();
        let b = member(&g).unwrap();
        g.shutdown();
        assert!(g.is_shutdown());
        assert!(matches!(member(&g), Err(ChannelError::GroupShutdown)));
        assert!(!g.await_termination(Duration::from_millis(50)));

        a.close().unwrap();
        assert!(!g.is_terminated());
        b.close().unwrap();
        assert!(g.await_termination(Duration::from_secs(5)));
        assert_eq!(g.thread_count(), 0);
        assert_eq!(g.execute(|| {}), Err(ChannelError::GroupShutdown));
        assert!(g.schedule(|| {}, Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_shutdown_now_closes_members() {
        let g = ChannelGroup::with_fixed_threads(1).unwrap();
        let a = member(&g).unwrap();
        g.shutdown_now().unwrap();
        assert!(a.closed.load(Ordering::SeqCst));
        assert_eq!(g.member_count(), 0);
        assert!(g.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_panicking_task_thread_is_replaced() {
        let g = ChannelGroup::with_fixed_threads(1).unwrap();
        g.execute(|| panic!("handler failure")).unwrap();
        let (tx, rx) = mpsc::channel();
        g.execute(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while g.thread_count() != 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(g.thread_count(), 1);
        g.shutdown_now().unwrap();
        assert!(g.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_nested_handlers_bounded_per_stack() {
        // Chain of handlers each completing the next future from inside
        // itself; the initiating task blocks, so after the ceiling the
        // chain must move to the other thread.
        let cfg = GroupConfig::fixed(2).max_handlers_on_stack(4);
        let g = ChannelGroup::new(cfg).unwrap();
        let (done_tx, done_rx) = mpsc::channel::<Vec<(thread::ThreadId, usize)>>();

        fn step(
            g: ChannelGroup,
            n: usize,
            trail: Vec<(thread::ThreadId, usize)>,
            done: mpsc::Sender<Vec<(thread::ThreadId, usize)>>,
        ) {
            let g2 = g.clone();
            let f = PendingFuture::with_handler(&g, None, OpKind::Read, trail, move |_r: Result<()>, mut trail| {
                trail.push((thread::current().id(), invoker::handler_depth()));
                if n == 0 {
                    done.send(trail).unwrap();
                } else {
                    step(g2, n - 1, trail, done);
                }
            });
            f.complete(Ok(())).unwrap();
        }

        let g2 = g.clone();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (origin_tx, origin_rx) = mpsc::channel();
        g.execute(move || {
            origin_tx.send(thread::current().id()).unwrap();
            step(g2, 9, Vec::new(), done_tx);
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
        })
        .unwrap();

        let origin = origin_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let trail = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx.send(()).unwrap();

        assert_eq!(trail.len(), 10);
        assert!(trail.iter().all(|(_, depth)| *depth <= 4));
        let on_origin = trail.iter().filter(|(t, _)| *t == origin).count();
        assert_eq!(on_origin, 4);
        assert!(trail[4..].iter().all(|(t, _)| *t != origin));
        g.shutdown_now().unwrap();
    }
}
