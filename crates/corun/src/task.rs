// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation.
//!
//! A task owns one suspended computation and the reply to hand it on the
//! next resume. User bodies are boxed futures; the reactor and timer poll
//! loops are two built-in bodies driven through the same dispatch path.

use std::fmt;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Instant;

use crate::error::{TaskError, TaskResult};
use crate::syscall::{self, Reply, Request};

/// Type-erased task body.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

/// Unique task identifier. Assigned monotonically, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) const IO_POLL: TaskId = TaskId(0);
    pub(crate) const TIME_POLL: TaskId = TaskId(1);
    /// First id handed to a user task.
    pub(crate) const FIRST_USER: u64 = 2;

    pub(crate) fn from_raw(raw: u64) -> Self {
        TaskId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The reactor and timer poll tasks.
    pub(crate) fn is_background(self) -> bool {
        self.0 < Self::FIRST_USER
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a task runs when resumed.
pub(crate) enum Body {
    Future(BoxFuture),
    /// One reactor tick per resume.
    IoPoll,
    /// One timer-queue tick per resume.
    TimePoll,
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Future(_) => f.write_str("Future"),
            Body::IoPoll => f.write_str("IoPoll"),
            Body::TimePoll => f.write_str("TimePoll"),
        }
    }
}

/// Where a live task currently sits. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Ready,
    Running,
    Io(RawFd),
    Timer(Instant),
    ExitWait(TaskId),
}

/// Outcome of resuming a task once.
#[derive(Debug)]
pub(crate) enum Step {
    /// Suspended on a system call.
    Request(Request),
    /// Suspended without asking for anything; run again next tick.
    Yielded,
    Complete,
    Failed(TaskError),
}

#[derive(Debug)]
pub(crate) struct Task {
    pub id: TaskId,
    /// `None` only while the task is running.
    pub body: Option<Body>,
    /// Delivered into the body on the next resume.
    pub pending: Option<Reply>,
    pub placement: Placement,
}

impl Task {
    pub fn new(id: TaskId, body: Body) -> Self {
        Self {
            id,
            body: Some(body),
            pending: None,
            placement: Placement::Ready,
        }
    }
}

/// Poll a future body once with `reply` as its resume value.
///
/// Panics escaping the body are caught here and reported as failures of
/// this task alone.
pub(crate) fn resume_future(
    id: TaskId,
    fut: &mut BoxFuture,
    reply: Option<Reply>,
    waker: &Waker,
) -> Step {
    let mut cx = Context::from_waker(waker);

    syscall::enter(id, reply);
    let polled = panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)));
    let request = syscall::leave().and_then(|frame| frame.request);

    match polled {
        Ok(Poll::Ready(Ok(()))) => Step::Complete,
        Ok(Poll::Ready(Err(err))) => Step::Failed(err),
        Ok(Poll::Pending) => match request {
            Some(request) => Step::Request(request),
            None => Step::Yielded,
        },
        Err(payload) => Step::Failed(TaskError::Panicked(panic_message(payload))),
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Tasks are re-queued by the scheduler, never by wakers. Futures that
/// park on some other waker are simply polled again on the next tick.
struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

pub(crate) fn noop_waker() -> Waker {
    Waker::from(Arc::new(NoopWake))
}
