// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative task scheduler on a single thread.
//!
//! Tasks are futures that talk to the scheduler only through system calls:
//! sleeping, waiting for another task to exit, waiting for a descriptor to
//! become readable or writable, killing a task, and spawning one. One
//! scheduler thread owns all state; an epoll reactor and a timer queue are
//! driven by two built-in background tasks.
//!
//! Components:
//! - scheduler: loop, registry, `Scheduler` handle (submit/join_all/shutdown)
//! - syscall: the request/reply channel and the async functions over it
//! - reactor: epoll readiness, one waiter per descriptor, single-shot
//! - timer: deadline buckets on a fixed grid
//! - io: non-blocking read/write built on readiness waits

mod completion;
mod config;
mod error;
pub mod io;
mod reactor;
mod scheduler;
mod syscall;
mod task;
mod timer;

pub use config::{Config, FailureHook};
pub use error::{Error, TaskError, TaskResult, WaitError};
pub use scheduler::Scheduler;
pub use syscall::{
    await_exit, current, kill, readable, sleep, spawn, writable, yield_now, Joined, Killed, YieldNow,
};
pub use task::TaskId;
