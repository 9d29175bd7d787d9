// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! System calls: the only channel between a task body and the scheduler.
//!
//! Awaiting one of the functions below stores a [`Request`] in the frame of
//! the task being polled and suspends the body. The scheduler handles the
//! request and, when the task is resumed, hands the reply back through the
//! same frame. A task has at most one request in flight; issuing a second
//! one in the same step (e.g. joining two sleeps) fails the task.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{TaskResult, WaitError};
use crate::task::{BoxFuture, TaskId};

/// A service request yielded by a task.
pub(crate) enum Request {
    SleepUntil(Duration),
    AwaitExit(TaskId),
    /// `AwaitExit` that also counts tasks parked on another task's exit as
    /// alive. Used by `join_all`.
    AwaitTermination(TaskId),
    AwaitReadable(RawFd),
    AwaitWritable(RawFd),
    Kill(TaskId),
    /// Admit a new task immediately, on the scheduler thread.
    Spawn(BoxFuture),
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::SleepUntil(d) => f.debug_tuple("SleepUntil").field(d).finish(),
            Request::AwaitExit(id) => f.debug_tuple("AwaitExit").field(id).finish(),
            Request::AwaitTermination(id) => f.debug_tuple("AwaitTermination").field(id).finish(),
            Request::AwaitReadable(fd) => f.debug_tuple("AwaitReadable").field(fd).finish(),
            Request::AwaitWritable(fd) => f.debug_tuple("AwaitWritable").field(fd).finish(),
            Request::Kill(id) => f.debug_tuple("Kill").field(id).finish(),
            Request::Spawn(_) => f.write_str("Spawn"),
        }
    }
}

/// Resume value delivered to a task after its request was handled.
#[derive(Debug)]
pub(crate) enum Reply {
    Woke,
    Joined(Joined),
    Ready(Result<(), WaitError>),
    Killed(Killed),
    Spawned(TaskId),
}

/// Result of [`await_exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joined {
    /// The target was alive and has since terminated.
    Exited,
    /// The target had already terminated, never existed, or is not joinable.
    NoSuchTask,
}

/// Result of [`kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Killed {
    Killed,
    NoSuchTask,
}

/// Per-step state of the task currently being polled.
#[derive(Debug)]
pub(crate) struct Frame {
    pub id: TaskId,
    pub reply: Option<Reply>,
    pub request: Option<Request>,
}

thread_local! {
    static CURRENT: RefCell<Option<Frame>> = const { RefCell::new(None) };
}

pub(crate) fn enter(id: TaskId, reply: Option<Reply>) {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        debug_assert!(slot.is_none(), "nested task poll");
        *slot = Some(Frame {
            id,
            reply,
            request: None,
        });
    });
}

pub(crate) fn leave() -> Option<Frame> {
    CURRENT.with(|cell| cell.borrow_mut().take())
}

fn with_frame<R>(f: impl FnOnce(&mut Frame) -> R) -> R {
    let result = CURRENT.with(|cell| cell.borrow_mut().as_mut().map(f));
    match result {
        Some(r) => r,
        None => panic!("corun system call used outside of a scheduler task"),
    }
}

/// Id of the task currently running on this thread, if any.
pub fn current() -> Option<TaskId> {
    CURRENT.with(|cell| {
        cell.try_borrow()
            .ok()
            .and_then(|frame| frame.as_ref().map(|f| f.id))
    })
}

/// Issues its request on first poll, completes with the reply on the next.
struct Syscall {
    request: Option<Request>,
}

impl Syscall {
    fn new(request: Request) -> Self {
        Self {
            request: Some(request),
        }
    }
}

impl Future for Syscall {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Reply> {
        if let Some(request) = self.request.take() {
            let clobbered = with_frame(|frame| frame.request.replace(request));
            if let Some(previous) = clobbered {
                panic!("task issued a second request while {:?} was in flight", previous);
            }
            return Poll::Pending;
        }
        match with_frame(|frame| frame.reply.take()) {
            Some(reply) => Poll::Ready(reply),
            None => Poll::Pending,
        }
    }
}

fn mismatched(call: &str, reply: Reply) -> ! {
    panic!("{} resumed with unexpected reply {:?}", call, reply)
}

/// Suspend the calling task for at least `duration`.
pub async fn sleep(duration: Duration) {
    match Syscall::new(Request::SleepUntil(duration)).await {
        Reply::Woke => {}
        other => mismatched("sleep", other),
    }
}

/// Park until `target` terminates. Returns immediately with
/// [`Joined::NoSuchTask`] if it is not alive.
pub async fn await_exit(target: TaskId) -> Joined {
    match Syscall::new(Request::AwaitExit(target)).await {
        Reply::Joined(joined) => joined,
        other => mismatched("await_exit", other),
    }
}

pub(crate) async fn await_termination(target: TaskId) -> Joined {
    match Syscall::new(Request::AwaitTermination(target)).await {
        Reply::Joined(joined) => joined,
        other => mismatched("await_termination", other),
    }
}

/// Park until `fd` is readable. Single-shot: call again to wait again.
pub async fn readable(fd: RawFd) -> Result<(), WaitError> {
    match Syscall::new(Request::AwaitReadable(fd)).await {
        Reply::Ready(result) => result,
        other => mismatched("readable", other),
    }
}

/// Park until `fd` is writable. Single-shot: call again to wait again.
pub async fn writable(fd: RawFd) -> Result<(), WaitError> {
    match Syscall::new(Request::AwaitWritable(fd)).await {
        Reply::Ready(result) => result,
        other => mismatched("writable", other),
    }
}

/// Force-terminate `target`, dropping its suspended computation.
pub async fn kill(target: TaskId) -> Killed {
    match Syscall::new(Request::Kill(target)).await {
        Reply::Killed(killed) => killed,
        other => mismatched("kill", other),
    }
}

/// Start a new task from inside a task. The child is registered before
/// this call returns, so it can be joined or killed right away.
pub async fn spawn<F>(fut: F) -> TaskId
where
    F: Future<Output = TaskResult> + Send + 'static,
{
    match Syscall::new(Request::Spawn(Box::pin(fut))).await {
        Reply::Spawned(id) => id,
        other => mismatched("spawn", other),
    }
}

/// Give up the rest of this tick; the task is re-queued at the back.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        Poll::Pending
    }
}
