//! Multi-threaded readiness port (epoll)
//!
//! Every descriptor is armed one-shot: after an event is delivered to
//! one thread, the descriptor stays disarmed until its channel asks
//! for the next event with [`Port::start_poll`]. Two threads never see
//! the same readiness at once.
//!
//! The wakeup eventfd is armed one-shot as well. The thread it wakes
//! drains and re-arms it, then passes the wakeup along if queued work
//! or shutdown needs another thread.
//!
//! Fixed groups also funnel their task hand-off through the port: a
//! task goes into a bounded queue and the port is woken so a thread
//! parked in `epoll_wait` picks it up.

use crate::invoker;
use crate::notifier::EventFdNotifier;
use crate::Task;

use chanio_core::{ChannelError, Events, RawHandle, Result};

use crossbeam_queue::ArrayQueue;
use log::{error, trace};
use parking_lot::RwLock;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

/// epoll user data of the wakeup descriptor
const WAKEUP_TOKEN: u64 = u64::MAX;

/// A channel whose descriptor is registered with a port
pub trait PollableChannel: Send + Sync {
    /// Called on a group thread when the descriptor became ready.
    /// The descriptor stays disarmed until the next `start_poll`.
    fn on_event(&self, events: Events);
}

pub(crate) struct Port {
    epfd: RawHandle,
    wakeup: EventFdNotifier,
    channels: RwLock<HashMap<RawHandle, Weak<dyn PollableChannel>>>,
    tasks: Option<ArrayQueue<Task>>,
    closed: AtomicBool,
    events_per_poll: usize,
}

fn to_epoll(events: Events) -> u32 {
    let mut bits = 0u32;
    if events.intersects(Events::READABLE) {
        bits |= libc::EPOLLIN as u32;
    }
    if events.intersects(Events::WRITABLE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn from_epoll(bits: u32) -> Events {
    let mut events = Events::NONE;
    if bits & libc::EPOLLIN as u32 != 0 {
        events |= Events::READABLE;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        events |= Events::WRITABLE;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        events |= Events::ERROR;
    }
    if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        events |= Events::HANGUP;
    }
    events
}

impl Port {
    /// `task_capacity` is `Some` for fixed groups.
    pub fn new(task_capacity: Option<usize>, events_per_poll: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(ChannelError::last_os_error());
        }
        let port = Self {
            epfd,
            wakeup: EventFdNotifier::create()?,
            channels: RwLock::new(HashMap::new()),
            tasks: task_capacity.map(ArrayQueue::new),
            closed: AtomicBool::new(false),
            events_per_poll,
        };
        port.ctl(
            libc::EPOLL_CTL_ADD,
            port.wakeup.fd(),
            (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
            WAKEUP_TOKEN,
        )?;
        Ok(port)
    }

    fn ctl(&self, op: libc::c_int, fd: RawHandle, events: u32, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(ChannelError::last_os_error());
        }
        Ok(())
    }

    fn rearm_wakeup(&self) {
        if let Err(e) = self.ctl(
            libc::EPOLL_CTL_MOD,
            self.wakeup.fd(),
            (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
            WAKEUP_TOKEN,
        ) {
            error!("port: re-arming wakeup failed: {}", e);
        }
    }

    /// Associate `fd` with the channel that handles its events.
    pub fn register(&self, fd: RawHandle, channel: Weak<dyn PollableChannel>) {
        self.channels.write().insert(fd, channel);
    }

    /// Forget `fd`. Must happen before the descriptor is closed.
    pub fn unregister(&self, fd: RawHandle) {
        self.channels.write().remove(&fd);
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev);
        }
    }

    /// Arm `fd` for one delivery of `events`.
    pub fn start_poll(&self, fd: RawHandle, events: Events) -> Result<()> {
        let bits = to_epoll(events) | libc::EPOLLONESHOT as u32;
        match self.ctl(libc::EPOLL_CTL_MOD, fd, bits, fd as u64) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, bits, fd as u64)
            }
            other => other,
        }
    }

    /// Pull one thread out of `epoll_wait`.
    pub fn wakeup(&self) {
        if let Err(e) = self.wakeup.notify() {
            error!("port: wakeup failed: {}", e);
        }
    }

    /// Queue a task for a fixed-group thread. Hands it back once closed.
    pub fn offer_task(&self, task: Task) -> std::result::Result<(), Task> {
        let Some(queue) = self.tasks.as_ref() else {
            return Err(task);
        };
        let mut task = task;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(task);
            }
            match queue.push(task) {
                Ok(()) => break,
                Err(back) => {
                    task = back;
                    std::thread::yield_now();
                }
            }
        }
        self.wakeup();
        Ok(())
    }

    fn poll_task(&self) -> Option<Task> {
        let queue = self.tasks.as_ref()?;
        let task = queue.pop()?;
        if !queue.is_empty() {
            self.wakeup();
        }
        Some(task)
    }

    /// Stop the event loops; each thread wakes the next on its way out.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wakeup();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Event loop run by group threads. Returns once the port is closed
    /// and the task queue is empty.
    pub fn run(&self, pooled: bool) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.events_per_poll];
        loop {
            invoker::reset_depth();

            if pooled {
                if let Some(task) = self.poll_task() {
                    task();
                    continue;
                }
            }
            if self.is_closed() {
                self.wakeup();
                return;
            }

            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as libc::c_int, -1)
            };
            if n < 0 {
                let err = ChannelError::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!("port: epoll_wait failed: {}", err);
                return;
            }

            for ev in &events[..n as usize] {
                let token = ev.u64;
                let bits = ev.events;
                if token == WAKEUP_TOKEN {
                    self.wakeup.drain();
                    self.rearm_wakeup();
                    continue;
                }
                let fd = token as RawHandle;
                let channel = self.channels.read().get(&fd).and_then(Weak::upgrade);
                match channel {
                    Some(channel) => channel.on_event(from_epoll(bits)),
                    None => trace!("port: event for unregistered fd {}", fd),
                }
            }
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoll_translation() {
        let bits = to_epoll(Events::READABLE | Events::WRITABLE);
        assert_eq!(bits, (libc::EPOLLIN | libc::EPOLLOUT) as u32);
        let ev = from_epoll((libc::EPOLLIN | libc::EPOLLHUP) as u32);
        assert!(ev.contains(Events::READABLE | Events::HANGUP));
        assert!(!ev.intersects(Events::WRITABLE));
    }

    #[test]
    fn test_offer_rejected_without_queue_or_after_close() {
        let port = Port::new(None, 4).unwrap();
        assert!(port.offer_task(Box::new(|| {})).is_err());

        let port = Port::new(Some(2), 4).unwrap();
        assert!(port.offer_task(Box::new(|| {})).is_ok());
        port.close();
        assert!(port.offer_task(Box::new(|| {})).is_err());
    }
}
