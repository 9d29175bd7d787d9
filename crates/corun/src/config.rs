// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TaskError;
use crate::task::TaskId;

/// Called on the scheduler thread whenever a task body fails.
pub type FailureHook = Arc<dyn Fn(TaskId, &TaskError) + Send + Sync>;

const DEFAULT_THREAD_NAME: &str = "corun-scheduler";
const DEFAULT_TIMER_RESOLUTION: Duration = Duration::from_millis(1);
const DEFAULT_MAX_EVENTS: usize = 64;

/// Knobs for [`Scheduler::start`](crate::Scheduler::start).
///
/// ```ignore
/// let config = Config::default()
///     .timer_resolution(Duration::from_millis(5))
///     .on_failure(|id, err| eprintln!("{id} failed: {err}"));
/// ```
#[derive(Clone)]
pub struct Config {
    pub(crate) thread_name: String,
    pub(crate) timer_resolution: Duration,
    pub(crate) max_events: usize,
    pub(crate) on_failure: Option<FailureHook>,
}

impl Config {
    /// Name of the scheduler thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Grid that sleep deadlines are rounded up to. Zero disables rounding.
    pub fn timer_resolution(mut self, resolution: Duration) -> Self {
        self.timer_resolution = resolution;
        self
    }

    /// Maximum readiness events collected per `epoll_wait`.
    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n.max(1);
        self
    }

    /// Observer for task-body failures, in addition to the `tracing` error event.
    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(TaskId, &TaskError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            timer_resolution: DEFAULT_TIMER_RESOLUTION,
            max_events: DEFAULT_MAX_EVENTS,
            on_failure: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("thread_name", &self.thread_name)
            .field("timer_resolution", &self.timer_resolution)
            .field("max_events", &self.max_events)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}
