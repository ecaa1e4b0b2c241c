//! Bounded fanout of TX/RX traffic for logging and UIs.
//!
//! The tap observes transmissions through the interface's TX hook and
//! arrivals through the reader's RX hook. Records go into a bounded main
//! queue and a mirrored UI queue; on overflow the oldest entry is evicted
//! and a dropped counter ticks up. An external writer task drains the
//! queues and serializes one JSON record per line.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::cast::{bytes_to_hex, id_to_hex};
use crate::interface::CanInterface;
use crate::reader::FrameCallback;
use crate::Frame;

/// Default bound of the trace queues.
pub const DEFAULT_TRACE_CAPACITY: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

/// One traced frame, serialized one record per line.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceRecord {
    #[serde(rename = "ts")]
    pub timestamp_s: f64,
    #[serde(rename = "id")]
    pub id_hex: String,
    pub direction: Direction,
    /// Payload as `"HH HH …"`.
    pub data: String,
    pub is_fd: bool,
    pub is_extended: bool,
}

impl TraceRecord {
    pub fn from_frame(frame: &Frame, direction: Direction) -> TraceRecord {
        let timestamp_s = frame.timestamp.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        });
        TraceRecord {
            timestamp_s,
            id_hex: id_to_hex(frame.id.as_u32()),
            direction,
            data: bytes_to_hex(&frame.data),
            is_fd: frame.fd,
            is_extended: frame.extended,
        }
    }

    /// The line an external trace writer appends to its file.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).expect("trace record serializes")
    }
}

struct TapInner {
    main: VecDeque<TraceRecord>,
    ui: VecDeque<TraceRecord>,
    dropped: u64,
}

/// Bounded (message, direction) sequence for external consumption.
pub struct TraceTap {
    inner: Mutex<TapInner>,
    capacity: usize,
}

impl TraceTap {
    pub fn new() -> Arc<TraceTap> {
        TraceTap::with_capacity(DEFAULT_TRACE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<TraceTap> {
        Arc::new(TraceTap {
            inner: Mutex::new(TapInner {
                main: VecDeque::with_capacity(capacity),
                ui: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            capacity: capacity.max(1),
        })
    }

    /// Enqueue one observation into both queues.
    pub fn record(&self, frame: &Frame, direction: Direction) {
        let record = TraceRecord::from_frame(frame, direction);
        let mut inner = self.inner.lock();
        if inner.main.len() >= self.capacity {
            inner.main.pop_front();
            inner.dropped += 1;
        }
        inner.main.push_back(record.clone());
        if inner.ui.len() >= self.capacity {
            inner.ui.pop_front();
        }
        inner.ui.push_back(record);
    }

    pub fn pop(&self) -> Option<TraceRecord> {
        self.inner.lock().main.pop_front()
    }

    pub fn pop_ui(&self) -> Option<TraceRecord> {
        self.inner.lock().ui.pop_front()
    }

    pub fn drain(&self) -> Vec<TraceRecord> {
        self.inner.lock().main.drain(..).collect()
    }

    pub fn drain_ui(&self) -> Vec<TraceRecord> {
        self.inner.lock().ui.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().main.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().main.is_empty()
    }

    /// Frames evicted from the main queue so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Callback recording transmissions; hand this to
    /// [`CanInterface::set_tx_hook`].
    pub fn tx_hook(self: &Arc<Self>) -> FrameCallback {
        let tap = self.clone();
        Arc::new(move |frame: &Frame| tap.record(frame, Direction::Tx))
    }

    /// Callback recording arrivals; hand this to the reader's RX hook.
    pub fn rx_hook(self: &Arc<Self>) -> FrameCallback {
        let tap = self.clone();
        Arc::new(move |frame: &Frame| tap.record(frame, Direction::Rx))
    }

    /// Wire both hooks of an interface to this tap.
    pub fn attach(self: &Arc<Self>, canif: &CanInterface) {
        canif.set_tx_hook(Some(self.tx_hook()));
        canif.reader().set_rx_hook(Some(self.rx_hook()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockCan;
    use crate::interface::InterfaceOptions;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn frame(id: u32, data: &[u8]) -> Frame {
        Frame::new(id, data).unwrap()
    }

    #[test]
    fn record_shape_matches_the_wire_contract() {
        let record = TraceRecord {
            timestamp_s: 1.5,
            id_hex: "07 B3".into(),
            direction: Direction::Tx,
            data: "22 F1 87".into(),
            is_fd: false,
            is_extended: false,
        };
        assert_eq!(
            record.to_json_line(),
            r#"{"ts":1.5,"id":"07 B3","direction":"tx","data":"22 F1 87","is_fd":false,"is_extended":false}"#
        );
    }

    #[test]
    fn from_frame_formats_id_and_data() {
        let record = TraceRecord::from_frame(
            &frame(0x7BB, &[0x62, 0x01]).with_timestamp(42.0),
            Direction::Rx,
        );
        assert_eq!(record.timestamp_s, 42.0);
        assert_eq!(record.id_hex, "07 BB");
        assert_eq!(record.data, "62 01");
        assert_eq!(record.direction, Direction::Rx);
    }

    #[test]
    fn overflow_evicts_oldest_and_counts_drops() {
        let tap = TraceTap::with_capacity(3);
        for i in 0..5u8 {
            tap.record(&frame(0x100, &[i]), Direction::Tx);
        }
        assert_eq!(tap.len(), 3);
        assert_eq!(tap.dropped(), 2);

        let records = tap.drain();
        let payloads: Vec<String> = records.into_iter().map(|r| r.data).collect();
        assert_eq!(payloads, vec!["02", "03", "04"]);
    }

    #[test]
    fn ui_queue_mirrors_the_main_queue() {
        let tap = TraceTap::with_capacity(2);
        for i in 0..3u8 {
            tap.record(&frame(0x100, &[i]), Direction::Rx);
        }
        let main: Vec<String> = tap.drain().into_iter().map(|r| r.data).collect();
        let ui: Vec<String> = tap.drain_ui().into_iter().map(|r| r.data).collect();
        assert_eq!(main, ui);
    }

    #[test]
    fn attached_tap_sees_both_directions() {
        let bus = MockCan::new();
        let canif = CanInterface::with_bus(bus.clone(), InterfaceOptions::default());
        let tap = TraceTap::new();
        tap.attach(&canif);

        canif.write(0x7B3u32, "22 F1 87").unwrap();
        // The mock loops the send back, so the reader records an RX too.
        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while tap.len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let records = tap.drain();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.direction == Direction::Tx));
        assert!(records.iter().any(|r| r.direction == Direction::Rx));
        assert!(records.iter().all(|r| r.data == "22 F1 87"));
        canif.shutdown();
    }
}
