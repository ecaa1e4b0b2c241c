//! Receive-side frame demultiplexer.
//!
//! One reader task blocks on the bus and fans every inbound frame out to
//! the default stream, the per-ID queue, every named subscriber queue and
//! the registered callbacks. A companion reaper task drops state for ids
//! that went quiet, without ever pulling queues out from under an active
//! subscriber.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::bus::BusAdapter;
use crate::{Frame, FrameId, IntoFrameId, Result};

/// How long a single `bus.recv` may block before the loop re-checks the
/// stop flag.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
/// Sweep cadence of the reaper task.
const REAP_INTERVAL: Duration = Duration::from_secs(5);
/// Ids unseen for this long are considered stale.
pub const DEFAULT_ID_TIMEOUT_S: f64 = 30.0;

/// Callback fanout target. Errors inside are caught and logged, never
/// propagated into the reader.
pub type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Monotonic time source. The reaper goes through this so tests can
/// advance a fake clock instead of sleeping for real.
pub trait Clock: Send + Sync {
    /// Monotonic seconds since an arbitrary origin.
    fn now(&self) -> f64;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-cranked clock for tests.
pub struct ManualClock {
    seconds: Mutex<f64>,
}

impl ManualClock {
    pub fn new() -> Arc<ManualClock> {
        Arc::new(ManualClock { seconds: Mutex::new(0.0) })
    }

    pub fn advance(&self, seconds: f64) {
        *self.seconds.lock() += seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.seconds.lock()
    }
}

#[derive(Default)]
struct IdState {
    queue: VecDeque<Frame>,
    named: HashMap<String, VecDeque<Frame>>,
    latest: Option<Frame>,
    last_seen: f64,
    timeout_s: Option<f64>,
}

#[derive(Default)]
struct Inner {
    ids: HashMap<FrameId, IdState>,
    subscribers: HashSet<FrameId>,
    /// Callback plus the queue name it was registered alongside, so a
    /// named unsubscribe tears down exactly its own fanout.
    callbacks: HashMap<FrameId, Vec<(Option<String>, FrameCallback)>>,
}

pub struct FrameReader {
    bus: Arc<dyn BusAdapter>,
    inner: Mutex<Inner>,
    default_tx: Sender<Frame>,
    default_rx: Receiver<Frame>,
    rx_hook: Mutex<Option<FrameCallback>>,
    running: AtomicBool,
    poll_timeout: Mutex<Duration>,
    default_timeout_s: f64,
    clock: Arc<dyn Clock>,
    reap_gate: Mutex<bool>,
    reap_cond: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameReader {
    pub fn new(bus: Arc<dyn BusAdapter>) -> Arc<FrameReader> {
        FrameReader::with_clock(bus, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(bus: Arc<dyn BusAdapter>, clock: Arc<dyn Clock>) -> Arc<FrameReader> {
        let (default_tx, default_rx) = unbounded();
        Arc::new(FrameReader {
            bus,
            inner: Mutex::new(Inner::default()),
            default_tx,
            default_rx,
            rx_hook: Mutex::new(None),
            running: AtomicBool::new(false),
            poll_timeout: Mutex::new(DEFAULT_POLL_TIMEOUT),
            default_timeout_s: DEFAULT_ID_TIMEOUT_S,
            clock,
            reap_gate: Mutex::new(false),
            reap_cond: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Shorten the bus poll window (mainly for tests; stop latency is
    /// bounded by this).
    pub fn set_poll_timeout(self: &Arc<Self>, timeout: Duration) -> Arc<Self> {
        *self.poll_timeout.lock() = timeout;
        self.clone()
    }

    /// Spawn the receive loop and the stale-queue reaper.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        // The receive loop is detached: it re-checks the stop flag once
        // per bus poll and winds down on its own, so stop() never blocks
        // on a driver that is sitting in a long recv.
        let reader = self.clone();
        std::thread::Builder::new()
            .name("can-reader".into())
            .spawn(move || reader.recv_loop())
            .expect("spawn reader thread");

        let reaper = self.clone();
        let reap_handle = std::thread::Builder::new()
            .name("can-reaper".into())
            .spawn(move || reaper.reap_loop())
            .expect("spawn reaper thread");

        self.threads.lock().push(reap_handle);
    }

    /// Signal both tasks to stop and join the reaper. The receive loop
    /// exits within one bus poll window.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        {
            let mut gate = self.reap_gate.lock();
            *gate = true;
            self.reap_cond.notify_all();
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Hook invoked (outside the lock) for every received frame. The
    /// trace tap attaches here.
    pub fn set_rx_hook(&self, hook: Option<FrameCallback>) {
        *self.rx_hook.lock() = hook;
    }

    fn recv_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let poll = *self.poll_timeout.lock();
            match self.bus.recv(poll) {
                Ok(Some(frame)) => self.dispatch(frame),
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "bus receive failed");
                }
            }
        }
        debug!("reader loop exited");
    }

    /// Fan one frame out. Map mutation happens under a single lock; the
    /// default-queue push and all callback/hook invocations happen after
    /// it is released so a callback may subscribe or unsubscribe freely.
    fn dispatch(&self, frame: Frame) {
        let id = frame.id;
        let callbacks: Vec<FrameCallback> = {
            let mut inner = self.inner.lock();
            let state = inner.ids.entry(id).or_default();
            state.latest = Some(frame.clone());
            state.last_seen = self.clock.now();
            state.queue.push_back(frame.clone());
            for queue in state.named.values_mut() {
                queue.push_back(frame.clone());
            }
            if inner.subscribers.contains(&id) {
                inner
                    .callbacks
                    .get(&id)
                    .map(|cbs| cbs.iter().map(|(_, cb)| cb.clone()).collect())
                    .unwrap_or_default()
            } else {
                Vec::new()
            }
        };

        if let Some(hook) = self.rx_hook.lock().clone() {
            if catch_unwind(AssertUnwindSafe(|| hook(&frame))).is_err() {
                error!(id = %id, "rx hook panicked");
            }
        }

        let _ = self.default_tx.send(frame.clone());

        for cb in callbacks {
            if catch_unwind(AssertUnwindSafe(|| cb(&frame))).is_err() {
                error!(id = %id, "subscriber callback panicked");
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register interest in an id. An optional callback is invoked for
    /// every matching frame; an optional `queue_name` creates a private
    /// named buffer. Re-subscribing a name always yields a fresh, empty
    /// buffer.
    pub fn subscribe(
        &self,
        id: impl IntoFrameId,
        callback: Option<FrameCallback>,
        queue_name: Option<&str>,
    ) -> Result<()> {
        let id = id.into_frame_id()?;
        let mut inner = self.inner.lock();
        inner.subscribers.insert(id);
        if let Some(cb) = callback {
            inner
                .callbacks
                .entry(id)
                .or_default()
                .push((queue_name.map(str::to_string), cb));
        }
        if let Some(name) = queue_name {
            inner
                .ids
                .entry(id)
                .or_default()
                .named
                .insert(name.to_string(), VecDeque::new());
        }
        Ok(())
    }

    /// Remove a subscription. With a `queue_name` only that named buffer
    /// (and the callbacks registered with it) disappear; without one the
    /// plain per-ID buffer and untagged callbacks go. The latest-frame
    /// cache is dropped either way.
    pub fn unsubscribe(&self, id: impl IntoFrameId, queue_name: Option<&str>) -> Result<()> {
        let id = id.into_frame_id()?;
        let mut inner = self.inner.lock();
        match queue_name {
            Some(name) => {
                if let Some(state) = inner.ids.get_mut(&id) {
                    state.named.remove(name);
                    state.latest = None;
                }
                let emptied = inner
                    .callbacks
                    .get_mut(&id)
                    .map(|cbs| {
                        cbs.retain(|(tag, _)| tag.as_deref() != Some(name));
                        cbs.is_empty()
                    })
                    .unwrap_or(false);
                if emptied {
                    inner.callbacks.remove(&id);
                }
            }
            None => {
                if let Some(state) = inner.ids.get_mut(&id) {
                    state.queue.clear();
                    state.latest = None;
                }
                let emptied = inner
                    .callbacks
                    .get_mut(&id)
                    .map(|cbs| {
                        cbs.retain(|(tag, _)| tag.is_some());
                        cbs.is_empty()
                    })
                    .unwrap_or(false);
                if emptied {
                    inner.callbacks.remove(&id);
                }
            }
        }
        let keep = inner.callbacks.contains_key(&id)
            || inner.ids.get(&id).map(|s| !s.named.is_empty()).unwrap_or(false);
        if !keep {
            inner.subscribers.remove(&id);
        }
        Ok(())
    }

    pub fn is_subscribed(&self, id: impl IntoFrameId) -> Result<bool> {
        let id = id.into_frame_id()?;
        Ok(self.inner.lock().subscribers.contains(&id))
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Pop the next frame from the default stream without blocking.
    pub fn get_from_default(&self) -> Option<Frame> {
        self.default_rx.try_recv().ok()
    }

    /// Pop from the default stream, blocking up to `timeout`.
    pub fn get_from_default_blocking(&self, timeout: Duration) -> Option<Frame> {
        match self.default_rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pop (or peek at) the head of an id's queue. `queue_name` selects a
    /// named subscriber buffer instead of the plain per-ID queue.
    pub fn get_from_id(
        &self,
        id: impl IntoFrameId,
        queue_name: Option<&str>,
        peek: bool,
    ) -> Result<Option<Frame>> {
        let id = id.into_frame_id()?;
        let mut inner = self.inner.lock();
        let Some(state) = inner.ids.get_mut(&id) else {
            return Ok(None);
        };
        let queue = match queue_name {
            Some(name) => match state.named.get_mut(name) {
                Some(q) => q,
                None => return Ok(None),
            },
            None => &mut state.queue,
        };
        Ok(if peek { queue.front().cloned() } else { queue.pop_front() })
    }

    /// Most recent frame seen for an id, regardless of queue state.
    pub fn get_latest(&self, id: impl IntoFrameId) -> Result<Option<Frame>> {
        let id = id.into_frame_id()?;
        Ok(self.inner.lock().ids.get(&id).and_then(|s| s.latest.clone()))
    }

    /// Poll the plain per-ID queue until a frame shows up or `timeout`
    /// passes. The frame is left in the queue.
    pub fn wait_for(&self, id: impl IntoFrameId, timeout: Duration) -> Result<Option<Frame>> {
        let id = id.into_frame_id()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.get_from_id(id, None, true)? {
                return Ok(Some(frame));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Override the stale timeout for one id.
    pub fn set_id_timeout(&self, id: impl IntoFrameId, timeout: Duration) -> Result<()> {
        let id = id.into_frame_id()?;
        let mut inner = self.inner.lock();
        inner.ids.entry(id).or_default().timeout_s = Some(timeout.as_secs_f64());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stale-queue reaping
    // ------------------------------------------------------------------

    fn reap_loop(self: Arc<Self>) {
        loop {
            {
                let mut gate = self.reap_gate.lock();
                if !*gate {
                    self.reap_cond.wait_for(&mut gate, REAP_INTERVAL);
                }
                if *gate {
                    break;
                }
            }
            self.reap_stale();
        }
        debug!("reaper loop exited");
    }

    /// One reap sweep. Ids with subscribers keep their (cleared) buffers;
    /// everything else is dropped wholesale.
    pub fn reap_stale(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let default_timeout = self.default_timeout_s;
        let subscribers = inner.subscribers.clone();
        inner.ids.retain(|id, state| {
            let timeout = state.timeout_s.unwrap_or(default_timeout);
            if now - state.last_seen <= timeout {
                return true;
            }
            if subscribers.contains(id) {
                state.queue.clear();
                for queue in state.named.values_mut() {
                    queue.clear();
                }
                state.latest = None;
                true
            } else {
                debug!(id = %id, "dropping stale id state");
                false
            }
        });
    }

    #[cfg(test)]
    fn queue_len(&self, id: FrameId, queue_name: Option<&str>) -> usize {
        let inner = self.inner.lock();
        inner
            .ids
            .get(&id)
            .map(|s| match queue_name {
                Some(name) => s.named.get(name).map(VecDeque::len).unwrap_or(0),
                None => s.queue.len(),
            })
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn has_id_state(&self, id: FrameId) -> bool {
        self.inner.lock().ids.contains_key(&id)
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
