//! Periodic frame transmission.
//!
//! Each scheduled message id owns one task thread with a monotonic
//! `next_fire`. Cadence advances by exactly one period per send and never
//! catches up after a stall, which keeps spacing smooth under jitter. A
//! burst overlay can interleave a short, tightly spaced salvo and then
//! hands control back to the periodic cadence.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::bus::BusAdapter;
use crate::{Frame, FrameId, IntoFrameId, Result};

/// Produces the payload for the next transmission. The scheduler never
/// owns signal state; it only invokes this.
pub type PayloadFn = Arc<dyn Fn() -> Result<Vec<u8>> + Send + Sync>;

/// Invoked after each successful send. Failures inside are swallowed.
pub type SentHook = Arc<dyn Fn(&Frame) + Send + Sync>;

const DEFAULT_BURST_COUNT: u32 = 3;
const DEFAULT_BURST_SPACING: Duration = Duration::from_millis(40);

/// Everything needed to schedule one message.
pub struct TaskSpec {
    pub id: FrameId,
    /// Zero means one-shot: fire once, then the task terminates.
    pub period: Duration,
    /// Wall-clock cap; the task terminates at the next scheduling point
    /// after this much time.
    pub duration: Option<Duration>,
    pub fd: bool,
    pub extended: bool,
    pub get_payload: PayloadFn,
    pub on_sent: Option<SentHook>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Paused,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
struct TaskState {
    running: bool,
    paused: bool,
    stop: bool,
    in_burst: bool,
    burst_count: u32,
    burst_spacing: Duration,
}

struct TaskShared {
    state: Mutex<TaskState>,
    cond: Condvar,
}

impl TaskShared {
    /// Sleep up to `timeout` unless the condition variable fires first.
    /// Returns true when the wait ran its full course.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.stop {
            return false;
        }
        self.cond.wait_for(&mut state, timeout).timed_out()
    }

    fn stopped(&self) -> bool {
        self.state.lock().stop
    }
}

struct MessageTask {
    id: FrameId,
    period: Duration,
    fd: bool,
    extended: bool,
    bus: Arc<dyn BusAdapter>,
    get_payload: PayloadFn,
    on_sent: Option<SentHook>,
    shared: Arc<TaskShared>,
    handle: Option<JoinHandle<()>>,
}

impl MessageTask {
    fn spawn(bus: Arc<dyn BusAdapter>, spec: TaskSpec) -> MessageTask {
        let shared = Arc::new(TaskShared {
            state: Mutex::new(TaskState {
                running: true,
                paused: false,
                stop: false,
                in_burst: false,
                burst_count: 0,
                burst_spacing: DEFAULT_BURST_SPACING,
            }),
            cond: Condvar::new(),
        });

        let mut task = MessageTask {
            id: spec.id,
            period: spec.period,
            fd: spec.fd,
            extended: spec.extended,
            bus: bus.clone(),
            get_payload: spec.get_payload.clone(),
            on_sent: spec.on_sent.clone(),
            shared: shared.clone(),
            handle: None,
        };

        let worker = TaskWorker {
            id: spec.id,
            period: spec.period,
            deadline: spec.duration.map(|d| Instant::now() + d),
            fd: spec.fd,
            extended: spec.extended,
            bus,
            get_payload: spec.get_payload,
            on_sent: spec.on_sent,
            shared,
        };
        task.handle = Some(
            std::thread::Builder::new()
                .name(format!("can-tx-{:X}", spec.id.as_u32()))
                .spawn(move || worker.run())
                .expect("spawn scheduler task"),
        );
        task
    }

    fn stop(mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            // Stop beats pause: a paused task must leave immediately.
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn pause(&self) {
        let mut state = self.shared.state.lock();
        state.paused = true;
        self.shared.cond.notify_all();
        info!(id = %self.id, "periodic task paused");
    }

    fn resume(&self) {
        let mut state = self.shared.state.lock();
        if !state.running {
            warn!(id = %self.id, "resume on a task that is not running");
        }
        state.paused = false;
        self.shared.cond.notify_all();
        info!(id = %self.id, "periodic task resumed");
    }

    /// Flag the running task for a burst, or hand back an [`InlineBurst`]
    /// when a finished one-shot should fire from the caller's thread.
    fn signal_burst(&self, count: u32, spacing: Duration) -> Option<InlineBurst> {
        let mut state = self.shared.state.lock();
        if state.running {
            state.in_burst = true;
            state.burst_count = count;
            state.burst_spacing = spacing;
            self.shared.cond.notify_all();
            None
        } else if self.period.is_zero() {
            // A finished one-shot never revives; the burst goes out from
            // the caller's thread instead.
            Some(InlineBurst {
                bus: self.bus.clone(),
                id: self.id,
                fd: self.fd,
                extended: self.extended,
                get_payload: self.get_payload.clone(),
                on_sent: self.on_sent.clone(),
            })
        } else {
            None
        }
    }

    fn status(&self) -> TaskStatus {
        let state = self.shared.state.lock();
        if !state.running {
            TaskStatus::Stopped
        } else if state.paused {
            TaskStatus::Paused
        } else {
            TaskStatus::Running
        }
    }
}

/// Burst salvo for a task whose thread has already exited.
struct InlineBurst {
    bus: Arc<dyn BusAdapter>,
    id: FrameId,
    fd: bool,
    extended: bool,
    get_payload: PayloadFn,
    on_sent: Option<SentHook>,
}

impl InlineBurst {
    fn fire(&self, count: u32, spacing: Duration) {
        for i in 0..count {
            send_frame(
                &*self.bus,
                self.id,
                self.fd,
                self.extended,
                &self.get_payload,
                self.on_sent.as_ref(),
            );
            if i + 1 < count {
                std::thread::sleep(spacing);
            }
        }
    }
}

struct TaskWorker {
    id: FrameId,
    period: Duration,
    deadline: Option<Instant>,
    fd: bool,
    extended: bool,
    bus: Arc<dyn BusAdapter>,
    get_payload: PayloadFn,
    on_sent: Option<SentHook>,
    shared: Arc<TaskShared>,
}

impl TaskWorker {
    fn run(self) {
        let mut next_fire = Instant::now();

        'task: loop {
            // Gate on stop/pause first. Stop wins over pause.
            {
                let mut state = self.shared.state.lock();
                loop {
                    if state.stop {
                        break 'task;
                    }
                    if !state.paused {
                        break;
                    }
                    self.shared.cond.wait(&mut state);
                }
            }

            if let Some(deadline) = self.deadline {
                if Instant::now() > deadline {
                    debug!(id = %self.id, "duration cap reached");
                    break;
                }
            }

            if self.period.is_zero() {
                self.send();
                break;
            }

            let burst = {
                let mut state = self.shared.state.lock();
                if state.in_burst {
                    state.in_burst = false;
                    Some((state.burst_count, state.burst_spacing))
                } else {
                    None
                }
            };
            if let Some((count, spacing)) = burst {
                for i in 0..count {
                    if self.shared.stopped() {
                        break 'task;
                    }
                    self.send();
                    if i + 1 < count && !self.shared.wait_timeout(spacing) {
                        // Woken early: only stop cuts a burst short.
                        if self.shared.stopped() {
                            break 'task;
                        }
                    }
                }
                next_fire += self.period;
                continue;
            }

            let now = Instant::now();
            if now < next_fire {
                if !self.shared.wait_timeout(next_fire - now) {
                    // Wake signal: re-evaluate stop/pause/burst from the top.
                    continue;
                }
            }

            self.send();
            next_fire += self.period;
        }

        self.shared.state.lock().running = false;
    }

    fn send(&self) {
        send_frame(
            &*self.bus,
            self.id,
            self.fd,
            self.extended,
            &self.get_payload,
            self.on_sent.as_ref(),
        );
    }
}

fn send_frame(
    bus: &dyn BusAdapter,
    id: FrameId,
    fd: bool,
    extended: bool,
    get_payload: &PayloadFn,
    on_sent: Option<&SentHook>,
) {
    let data = match get_payload() {
        Ok(data) => data,
        Err(e) => {
            error!(id = %id, error = %e, "payload evaluation failed");
            return;
        }
    };
    let frame = Frame { id, extended, fd, data, timestamp: None };
    match bus.send(&frame) {
        Ok(()) => {
            if let Some(hook) = on_sent {
                let hook = hook.clone();
                if catch_unwind(AssertUnwindSafe(|| hook(&frame))).is_err() {
                    error!(id = %id, "on_sent hook panicked");
                }
            }
        }
        Err(e) => error!(id = %id, error = %e, "send failed"),
    }
}

/// Owns all periodic tasks for one bus.
pub struct FrameScheduler {
    bus: Arc<dyn BusAdapter>,
    tasks: Mutex<HashMap<FrameId, MessageTask>>,
}

impl FrameScheduler {
    pub fn new(bus: Arc<dyn BusAdapter>) -> FrameScheduler {
        FrameScheduler { bus, tasks: Mutex::new(HashMap::new()) }
    }

    /// Schedule a message. Adding an id that is already scheduled is a
    /// logged no-op; stop it first.
    pub fn add_message(&self, spec: TaskSpec) {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&spec.id) {
            warn!(id = %spec.id, "message already scheduled, stop it first");
            return;
        }
        let id = spec.id;
        tasks.insert(id, MessageTask::spawn(self.bus.clone(), spec));
    }

    /// Stop one task and join it. Idempotent.
    pub fn stop_message(&self, id: impl IntoFrameId) -> Result<()> {
        let id = id.into_frame_id()?;
        let task = self.tasks.lock().remove(&id);
        if let Some(task) = task {
            task.stop();
        }
        Ok(())
    }

    /// Ask a task for an immediate salvo of `count` frames spaced by
    /// `spacing`, then return to the periodic cadence.
    pub fn trigger_burst(&self, id: impl IntoFrameId, count: u32, spacing: Duration) -> Result<()> {
        let id = id.into_frame_id()?;
        let inline = {
            let tasks = self.tasks.lock();
            match tasks.get(&id) {
                Some(task) => task.signal_burst(count, spacing),
                None => {
                    warn!(id = %id, "burst requested for unscheduled message");
                    None
                }
            }
        };
        // Fired outside the map lock so a long salvo cannot stall
        // add/stop/pause on other messages.
        if let Some(burst) = inline {
            burst.fire(count, spacing);
        }
        Ok(())
    }

    /// Burst with the conventional 3 × 40 ms profile.
    pub fn trigger_burst_default(&self, id: impl IntoFrameId) -> Result<()> {
        self.trigger_burst(id, DEFAULT_BURST_COUNT, DEFAULT_BURST_SPACING)
    }

    pub fn pause(&self, id: impl IntoFrameId) -> Result<()> {
        let id = id.into_frame_id()?;
        match self.tasks.lock().get(&id) {
            Some(task) => task.pause(),
            None => warn!(id = %id, "pause requested for unscheduled message"),
        }
        Ok(())
    }

    pub fn resume(&self, id: impl IntoFrameId) -> Result<()> {
        let id = id.into_frame_id()?;
        match self.tasks.lock().get(&id) {
            Some(task) => task.resume(),
            None => warn!(id = %id, "resume requested for unscheduled message"),
        }
        Ok(())
    }

    pub fn pause_all(&self) {
        for task in self.tasks.lock().values() {
            task.pause();
        }
    }

    pub fn resume_all(&self) {
        for task in self.tasks.lock().values() {
            task.resume();
        }
    }

    /// Stop every task and join them all.
    pub fn stop_all(&self) {
        let tasks: Vec<MessageTask> = {
            let mut map = self.tasks.lock();
            map.drain().map(|(_, task)| task).collect()
        };
        for task in tasks {
            task.stop();
        }
    }

    /// Per-task status snapshot.
    pub fn status(&self) -> HashMap<FrameId, TaskStatus> {
        self.tasks
            .lock()
            .iter()
            .map(|(id, task)| (*id, task.status()))
            .collect()
    }

    pub fn is_scheduled(&self, id: impl IntoFrameId) -> Result<bool> {
        let id = id.into_frame_id()?;
        Ok(self.tasks.lock().contains_key(&id))
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
