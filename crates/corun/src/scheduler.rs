// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded cooperative scheduler.
//!
//! One thread owns every piece of scheduling state (`Core`): the ready
//! queue, the registry, the exit-waiter index, the reactor and the timer
//! queue. Other threads only reach it through the submission channel and
//! the reactor's notifier. The reactor and timer queue are driven by two
//! background tasks that go through the same dispatch path as user tasks.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::completion::{Completion, Outcome};
use crate::config::Config;
use crate::error::{Error, TaskError, TaskResult};
use crate::reactor::{Interest, Notifier, Reactor};
use crate::syscall::{self, Joined, Killed, Reply, Request};
use crate::task::{self, Body, BoxFuture, Placement, Step, Task, TaskId};
use crate::timer::TimerQueue;

/// Cross-thread traffic into the scheduler thread.
enum Message {
    Submit(TaskId, BoxFuture),
    /// Nudge a scheduler blocked on an empty channel (shutdown).
    Wake,
}

/// State visible to the handle and the scheduler thread alike.
pub(crate) struct Shared {
    running: AtomicBool,
    next_id: AtomicU64,
    notifier: Arc<Notifier>,
}

impl Shared {
    fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(TaskId::FIRST_USER),
            notifier,
        }
    }

    fn allocate_id(&self) -> TaskId {
        TaskId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Handle to a running scheduler thread.
///
/// Dropping the handle shuts the scheduler down.
pub struct Scheduler {
    shared: Arc<Shared>,
    inbox: Sender<Message>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Scheduler {
    /// Start a scheduler with the default configuration.
    pub fn new() -> Result<Self, Error> {
        Self::start(Config::default())
    }

    /// Create the reactor and spawn the scheduler thread.
    pub fn start(config: Config) -> Result<Self, Error> {
        let reactor = Reactor::new(config.max_events).map_err(Error::Reactor)?;
        let shared = Arc::new(Shared::new(reactor.notifier().clone()));
        let (tx, rx) = channel::unbounded();

        let name = config.thread_name.clone();
        let core = Core::new(config, reactor, rx, shared.clone());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || core.run())
            .map_err(Error::Spawn)?;

        Ok(Self {
            shared,
            inbox: tx,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Hand a task body to the scheduler. The id is valid immediately; the
    /// task enters the registry when the scheduler thread admits it.
    pub fn submit<F>(&self, fut: F) -> Result<TaskId, Error>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        if !self.shared.is_running() {
            return Err(Error::ShutDown);
        }
        let id = self.shared.allocate_id();
        self.inbox
            .send(Message::Submit(id, Box::pin(fut)))
            .map_err(|_| Error::ShutDown)?;
        self.shared.notifier.notify();
        trace!(task.id = %id, "task submitted");
        Ok(id)
    }

    /// Block the calling thread until every task in `ids` has terminated.
    ///
    /// Runs as an ordinary task that awaits each id in turn. Ids that are
    /// already gone count as terminated; ids parked on another task's exit
    /// are waited for. Fails with [`Error::WouldDeadlock`] on the scheduler
    /// thread itself (task bodies and their destructors).
    pub fn join_all<I>(&self, ids: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = TaskId>,
    {
        if thread::current().id() == self.thread_id {
            return Err(Error::WouldDeadlock);
        }
        let ids: Vec<TaskId> = ids.into_iter().collect();
        let (completion, signal) = Completion::pair();

        self.submit(async move {
            for id in ids {
                syscall::await_termination(id).await;
            }
            signal.complete();
            Ok(())
        })?;

        match completion.wait() {
            Outcome::Done => Ok(()),
            Outcome::Abandoned => Err(Error::ShutDown),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Stop the scheduler thread and wait for it to exit. Tasks still
    /// alive are dropped on the scheduler thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            debug!("scheduler shutdown requested");
        }
        let _ = self.inbox.send(Message::Wake);
        self.shared.notifier.notify();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if self.thread_id == thread::current().id() {
            // Last handle dropped by one of our own tasks; the loop exits
            // on its next iteration.
            return;
        }
        if handle.join().is_err() {
            error!("scheduler thread panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears the running flag however the scheduler thread exits.
struct StopOnExit(Arc<Shared>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// Scheduler-thread state. Never shared.
pub(crate) struct Core {
    config: Config,
    ready: VecDeque<TaskId>,
    /// Every visible live task. Join-waiters live in `exit_waiters` instead.
    registry: HashMap<TaskId, Task>,
    exit_waiters: HashMap<TaskId, Vec<Task>>,
    reactor: Reactor,
    timers: TimerQueue,
    inbox: Receiver<Message>,
    shared: Arc<Shared>,
    waker: Waker,
}

impl Core {
    fn new(config: Config, reactor: Reactor, inbox: Receiver<Message>, shared: Arc<Shared>) -> Self {
        let timers = TimerQueue::new(config.timer_resolution);
        Self {
            config,
            ready: VecDeque::new(),
            registry: HashMap::new(),
            exit_waiters: HashMap::new(),
            reactor,
            timers,
            inbox,
            shared,
            waker: task::noop_waker(),
        }
    }

    fn run(mut self) {
        let _stopped = StopOnExit(self.shared.clone());
        debug!("scheduler started");
        self.admit_background();
        while self.shared.is_running() {
            self.tick();
        }
        self.teardown();
        debug!("scheduler stopped");
    }

    fn admit_background(&mut self) {
        self.admit(TaskId::IO_POLL, Body::IoPoll);
        self.admit(TaskId::TIME_POLL, Body::TimePoll);
    }

    /// One loop iteration: admit submissions, resume the head of the queue.
    fn tick(&mut self) {
        self.drain_inbox();
        let id = match self.ready.pop_front() {
            Some(id) => id,
            None => {
                match self.inbox.recv() {
                    Ok(msg) => self.accept(msg),
                    Err(_) => self.shared.running.store(false, Ordering::Release),
                }
                return;
            }
        };
        self.dispatch(id);
    }

    fn drain_inbox(&mut self) {
        while let Ok(msg) = self.inbox.try_recv() {
            self.accept(msg);
        }
    }

    fn accept(&mut self, msg: Message) {
        match msg {
            Message::Submit(id, body) => self.admit(id, Body::Future(body)),
            Message::Wake => {}
        }
    }

    /// Registry insertion happens here, on the scheduler thread only.
    fn admit(&mut self, id: TaskId, body: Body) {
        trace!(task.id = %id, ?body, "task admitted");
        self.registry.insert(id, Task::new(id, body));
        self.ready.push_back(id);
    }

    fn dispatch(&mut self, id: TaskId) {
        let Some(task) = self.registry.get_mut(&id) else {
            trace!(task.id = %id, "skipping stale ready entry");
            return;
        };
        let Some(mut body) = task.body.take() else {
            return;
        };
        let reply = task.pending.take();
        task.placement = Placement::Running;

        let step = match &mut body {
            Body::Future(fut) => task::resume_future(id, fut, reply, &self.waker),
            Body::IoPoll => {
                self.poll_io();
                Step::Yielded
            }
            Body::TimePoll => {
                self.poll_timers();
                Step::Yielded
            }
        };

        match step {
            Step::Request(request) => {
                self.restore(id, body);
                self.handle(id, request);
            }
            Step::Yielded => {
                self.restore(id, body);
                self.make_ready(id, None);
            }
            Step::Complete => match drop_body(body) {
                None => {
                    debug!(task.id = %id, "task completed");
                    self.terminate(id);
                }
                Some(err) => {
                    self.report_failure(id, &err);
                    self.terminate(id);
                }
            },
            Step::Failed(err) => {
                if let Some(drop_err) = drop_body(body) {
                    warn!(task.id = %id, error = %drop_err, "failed task panicked while being dropped");
                }
                self.report_failure(id, &err);
                self.terminate(id);
            }
        }
    }

    fn restore(&mut self, id: TaskId, body: Body) {
        if let Some(task) = self.registry.get_mut(&id) {
            task.body = Some(body);
        }
    }

    fn handle(&mut self, id: TaskId, request: Request) {
        trace!(task.id = %id, ?request, "handling request");
        match request {
            Request::SleepUntil(duration) => self.sleep_until(id, duration),
            Request::AwaitExit(target) => {
                let live = self.registry.contains_key(&target);
                self.await_exit(id, target, live);
            }
            Request::AwaitTermination(target) => {
                let live = self.registry.contains_key(&target) || self.is_join_parked(target);
                self.await_exit(id, target, live);
            }
            Request::AwaitReadable(fd) => self.await_io(id, fd, Interest::Readable),
            Request::AwaitWritable(fd) => self.await_io(id, fd, Interest::Writable),
            Request::Kill(target) => self.kill(id, target),
            Request::Spawn(body) => {
                let child = self.shared.allocate_id();
                self.admit(child, Body::Future(body));
                self.make_ready(id, Some(Reply::Spawned(child)));
            }
        }
    }

    fn make_ready(&mut self, id: TaskId, reply: Option<Reply>) {
        if let Some(task) = self.registry.get_mut(&id) {
            task.pending = reply;
            task.placement = Placement::Ready;
            self.ready.push_back(id);
        }
    }

    fn park(&mut self, id: TaskId, placement: Placement) {
        if let Some(task) = self.registry.get_mut(&id) {
            task.placement = placement;
        }
    }

    fn sleep_until(&mut self, id: TaskId, duration: Duration) {
        let deadline = self.timers.deadline_after(Instant::now(), duration);
        self.timers.insert(deadline, id);
        self.park(id, Placement::Timer(deadline));
    }

    /// Tasks parked on another task's exit are hidden from the registry but
    /// still alive.
    fn is_join_parked(&self, id: TaskId) -> bool {
        self.exit_waiters.values().flatten().any(|waiter| waiter.id == id)
    }

    fn await_exit(&mut self, id: TaskId, target: TaskId, live: bool) {
        let joinable = live && target != id && !target.is_background();
        if !joinable {
            self.make_ready(id, Some(Reply::Joined(Joined::NoSuchTask)));
            return;
        }
        let Some(mut waiter) = self.registry.remove(&id) else {
            return;
        };
        trace!(task.id = %id, target = %target, "waiting for exit");
        waiter.placement = Placement::ExitWait(target);
        self.exit_waiters.entry(target).or_default().push(waiter);
    }

    fn await_io(&mut self, id: TaskId, fd: RawFd, interest: Interest) {
        match self.reactor.register(fd, interest, id) {
            Ok(()) => self.park(id, Placement::Io(fd)),
            Err(err) => {
                debug!(task.id = %id, fd, error = %err, "readiness wait rejected");
                self.make_ready(id, Some(Reply::Ready(Err(err))));
            }
        }
    }

    fn kill(&mut self, id: TaskId, target: TaskId) {
        let outcome = if target.is_background() || !self.registry.contains_key(&target) {
            Killed::NoSuchTask
        } else {
            self.cancel(target);
            Killed::Killed
        };
        self.make_ready(id, Some(Reply::Killed(outcome)));
    }

    /// Pull `target` out of wherever it is parked and drop its computation.
    fn cancel(&mut self, target: TaskId) {
        let Some(task) = self.registry.remove(&target) else {
            return;
        };
        match task.placement {
            Placement::Ready => self.ready.retain(|&t| t != target),
            Placement::Io(fd) => {
                self.reactor.deregister(fd);
            }
            Placement::Timer(deadline) => {
                self.timers.remove(deadline, target);
            }
            Placement::Running | Placement::ExitWait(_) => {}
        }
        debug!(task.id = %target, "task killed");
        discard(task);
        self.release_waiters(target);
    }

    fn terminate(&mut self, id: TaskId) {
        if let Some(task) = self.registry.remove(&id) {
            discard(task);
        }
        self.release_waiters(id);
    }

    /// Put every task joined on `id` back into the registry and ready queue.
    fn release_waiters(&mut self, id: TaskId) {
        let Some(waiters) = self.exit_waiters.remove(&id) else {
            return;
        };
        for mut waiter in waiters {
            trace!(task.id = %waiter.id, target = %id, "join satisfied");
            waiter.pending = Some(Reply::Joined(Joined::Exited));
            waiter.placement = Placement::Ready;
            self.ready.push_back(waiter.id);
            self.registry.insert(waiter.id, waiter);
        }
    }

    fn report_failure(&self, id: TaskId, err: &TaskError) {
        error!(task.id = %id, error = %err, "task failed");
        if let Some(hook) = &self.config.on_failure {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(id, err))).is_err() {
                warn!(task.id = %id, "failure hook panicked");
            }
        }
    }

    /// Only user work counts; the two poll tasks are always queued.
    fn is_idle(&self) -> bool {
        self.inbox.is_empty() && self.ready.iter().all(|id| id.is_background())
    }

    /// I/O-poll tick. Blocks in `epoll_wait` only when nothing else can
    /// run, and then no longer than the next timer deadline.
    fn poll_io(&mut self) {
        let idle = self.is_idle();
        if self.reactor.is_empty() && !idle {
            return;
        }
        let timeout = if idle && self.shared.is_running() {
            self.timers
                .next_deadline()
                .map(|at| at.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::ZERO)
        };

        match self.reactor.poll(timeout) {
            Ok(woken) => {
                for id in woken {
                    self.make_ready(id, Some(Reply::Ready(Ok(()))));
                }
            }
            Err(err) => warn!(error = %err, "epoll_wait failed"),
        }
    }

    /// Time-poll tick: wake every task whose deadline has passed.
    fn poll_timers(&mut self) {
        if self.timers.is_empty() {
            return;
        }
        for id in self.timers.pop_expired(Instant::now()) {
            trace!(task.id = %id, "sleep elapsed");
            self.make_ready(id, Some(Reply::Woke));
        }
    }

    fn teardown(&mut self) {
        let parked: usize = self.exit_waiters.values().map(Vec::len).sum();
        debug!(
            live = self.registry.len() + parked,
            sleeping = self.timers.len(),
            io = self.reactor.len(),
            "dropping remaining tasks"
        );
        self.shared.running.store(false, Ordering::Release);
        self.ready.clear();
        for (_, task) in self.registry.drain() {
            discard(task);
        }
        for (_, waiters) in self.exit_waiters.drain() {
            waiters.into_iter().for_each(discard);
        }
        while let Ok(msg) = self.inbox.try_recv() {
            drop(msg);
        }
    }
}

/// Drop a finished body. A panicking destructor becomes the task's failure.
fn drop_body(body: Body) -> Option<TaskError> {
    panic::catch_unwind(AssertUnwindSafe(move || drop(body)))
        .err()
        .map(|payload| TaskError::Panicked(task::panic_message(payload)))
}

/// Drop a task's computation. Destructors in task bodies may panic; that
/// must not take the scheduler down.
fn discard(task: Task) {
    let id = task.id;
    if panic::catch_unwind(AssertUnwindSafe(move || drop(task))).is_err() {
        warn!(task.id = %id, "task panicked while being dropped");
    }
}
