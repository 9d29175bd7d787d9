// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: epoll-based readiness multiplexing.
//!
//! Owned by the scheduler thread. At most one task waits on a descriptor,
//! and every registration is single-shot: the descriptor is removed from
//! epoll as soon as its event fires. An eventfd (the [`Notifier`]) sits in
//! the same epoll set so other threads can interrupt a blocking wait.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::error::WaitError;
use crate::task::TaskId;

/// epoll user data for the notifier; descriptors never reach this value.
const WAKE_TOKEN: u64 = u64::MAX;

/// Readiness direction a task waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    task: TaskId,
    interest: Interest,
}

/// Eventfd used to kick the scheduler thread out of `epoll_wait`.
///
/// Shared with the scheduler handle; writing is safe from any thread.
#[derive(Debug)]
pub(crate) struct Notifier {
    fd: RawFd,
}

impl Notifier {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Make the next (or current) `epoll_wait` return.
    pub fn notify(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

pub(crate) struct Reactor {
    epoll_fd: RawFd,
    notifier: Arc<Notifier>,
    /// Descriptor → the single task parked on it.
    waiting: HashMap<RawFd, Waiter>,
    events: Vec<libc::epoll_event>,
}

impl Reactor {
    /// Create the epoll instance and register the notifier with it.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let notifier = match Notifier::new() {
            Ok(n) => Arc::new(n),
            Err(err) => {
                unsafe { libc::close(epoll_fd) };
                return Err(err);
            }
        };

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, notifier.fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            notifier,
            waiting: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Park `task` until `fd` is ready for `interest`.
    pub fn register(&mut self, fd: RawFd, interest: Interest, task: TaskId) -> Result<(), WaitError> {
        if self.waiting.contains_key(&fd) {
            return Err(WaitError::AlreadyWaiting(fd));
        }
        if fd < 0 {
            return Err(WaitError::Os(io::Error::from_raw_os_error(libc::EBADF)));
        }

        let mut ev = libc::epoll_event {
            events: interest.to_epoll_events(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(WaitError::Os(io::Error::last_os_error()));
        }

        trace!(fd, task.id = %task, ?interest, "registered readiness wait");
        self.waiting.insert(fd, Waiter { task, interest });
        Ok(())
    }

    /// Remove the waiter on `fd`, if any, and take it out of epoll.
    pub fn deregister(&mut self, fd: RawFd) -> Option<TaskId> {
        self.take(fd).map(|waiter| waiter.task)
    }

    fn take(&mut self, fd: RawFd) -> Option<Waiter> {
        let waiter = self.waiting.remove(&fd)?;
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF: the descriptor was closed while parked.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                warn!(fd, error = %err, "epoll_ctl(DEL) failed");
            }
        }
        Some(waiter)
    }

    /// Wait for readiness and return the tasks whose descriptors fired.
    ///
    /// `None` blocks until an event or a notification. Each returned task
    /// has already been deregistered.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<TaskId>> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let fired: Vec<u64> = self.events[..n as usize].iter().map(|ev| ev.u64).collect();
        let mut woken = Vec::with_capacity(fired.len());
        for token in fired {
            if token == WAKE_TOKEN {
                self.notifier.drain();
                continue;
            }
            let fd = token as RawFd;
            if let Some(waiter) = self.take(fd) {
                trace!(fd, task.id = %waiter.task, interest = ?waiter.interest, "descriptor ready");
                woken.push(waiter.task);
            }
        }
        Ok(woken)
    }

    pub fn is_waiting(&self, fd: RawFd) -> bool {
        self.waiting.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

/// Milliseconds for `epoll_wait`, rounded up so a timer never fires early.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn id(n: u64) -> TaskId {
        TaskId::from_raw(n)
    }

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(5))), 5);
        assert_eq!(timeout_ms(Some(Duration::MAX)), i32::MAX);
    }

    #[test]
    fn pipe_readiness_is_single_shot() {
        let mut reactor = Reactor::new(8).unwrap();
        let (read_fd, write_fd) = pipe();

        reactor.register(read_fd, Interest::Readable, id(2)).unwrap();
        assert!(reactor.poll(Some(Duration::ZERO)).unwrap().is_empty());

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

        let woken = reactor.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(woken, vec![id(2)]);
        assert!(!reactor.is_waiting(read_fd));

        // Still readable, but nobody is registered any more.
        assert!(reactor.poll(Some(Duration::ZERO)).unwrap().is_empty());

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn writable_pipe_fires_immediately() {
        let mut reactor = Reactor::new(8).unwrap();
        let (read_fd, write_fd) = pipe();

        reactor.register(write_fd, Interest::Writable, id(3)).unwrap();
        let woken = reactor.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(woken, vec![id(3)]);
        assert!(reactor.is_empty());

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn second_waiter_is_rejected() {
        let mut reactor = Reactor::new(8).unwrap();
        let (read_fd, write_fd) = pipe();

        reactor.register(read_fd, Interest::Readable, id(2)).unwrap();
        match reactor.register(read_fd, Interest::Readable, id(3)) {
            Err(WaitError::AlreadyWaiting(fd)) => assert_eq!(fd, read_fd),
            other => panic!("expected AlreadyWaiting, got {:?}", other),
        }
        assert_eq!(reactor.len(), 1);

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn bad_descriptor_is_an_os_error() {
        let mut reactor = Reactor::new(8).unwrap();
        assert!(matches!(
            reactor.register(-1, Interest::Readable, id(2)),
            Err(WaitError::Os(_))
        ));
        assert!(reactor.is_empty());
    }

    #[test]
    fn deregister_returns_waiter() {
        let mut reactor = Reactor::new(8).unwrap();
        let (read_fd, write_fd) = pipe();

        reactor.register(read_fd, Interest::Readable, id(5)).unwrap();
        assert_eq!(reactor.deregister(read_fd), Some(id(5)));
        assert_eq!(reactor.deregister(read_fd), None);

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn notifier_interrupts_blocking_wait() {
        let mut reactor = Reactor::new(8).unwrap();
        let notifier = reactor.notifier().clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });

        let woken = reactor.poll(None).unwrap();
        assert!(woken.is_empty());
        t.join().unwrap();

        // Drained: a zero-timeout poll reports nothing.
        assert!(reactor.poll(Some(Duration::ZERO)).unwrap().is_empty());
    }
}
