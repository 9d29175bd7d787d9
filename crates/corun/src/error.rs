// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Errors surfaced by the scheduler handle.
#[derive(Debug, Error)]
pub enum Error {
    /// The epoll instance or its wake eventfd could not be created.
    #[error("failed to create reactor: {0}")]
    Reactor(#[source] io::Error),
    /// The scheduler thread could not be spawned.
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[source] io::Error),
    /// The scheduler stopped before the operation could finish.
    #[error("scheduler is shut down")]
    ShutDown,
    /// A blocking handle operation was called from inside a task.
    #[error("blocking on the scheduler from one of its own tasks would deadlock")]
    WouldDeadlock,
}

/// Failure of a single task body. Terminates that task only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn msg(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

impl From<io::Error> for TaskError {
    fn from(err: io::Error) -> Self {
        TaskError::Failed(err.to_string())
    }
}

impl From<WaitError> for TaskError {
    fn from(err: WaitError) -> Self {
        TaskError::Failed(err.to_string())
    }
}

/// Why a readiness wait could not be registered.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Another task is already parked on this descriptor.
    #[error("descriptor {0} already has a waiting task")]
    AlreadyWaiting(RawFd),
    /// epoll refused the descriptor (closed, regular file, ...).
    #[error("failed to register descriptor: {0}")]
    Os(#[from] io::Error),
}

impl From<WaitError> for io::Error {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Os(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Result type every task body produces.
pub type TaskResult = Result<(), TaskError>;
