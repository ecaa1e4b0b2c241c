//! ISO 15765-2 transport sessions.
//!
//! A session is keyed by (ECU id, tester id). On creation it subscribes
//! to the tester id with a private named queue whose callback feeds the
//! session's own condvar-guarded FIFO, so two concurrent diagnostic
//! sessions never consume each other's frames. Sending segments a PDU
//! into SF/FF/CF frames under flow control; receiving reassembles one.

pub mod frame;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::cast::{dlc_pad, hex_to_bytes};
use crate::interface::CanInterface;
use crate::{Error, Frame, FrameId, IntoFrameId, Result};

use frame::{
    build_consecutive, build_first_frame, build_flow_control, build_single_frame, increase_sn,
    is_consecutive, is_flow_control, is_transport_start, parse_first_frame, parse_flow_control,
    pci_type, sf_capacity, sf_payload, st_min_delay, FC_OVFLW, FC_WAIT, PCI_FF, PCI_SF,
};

/// Default window to wait for a Flow Control frame during a send.
pub const DEFAULT_FC_TIMEOUT: Duration = Duration::from_millis(1000);

/// Parameters carried by (and sent in) Flow Control frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowControlSettings {
    pub block_size: u8,
    pub st_min: u8,
    /// 0 = CTS, 1 = WAIT, 2 = OVFLW.
    pub flow_status: u8,
}

impl Default for FlowControlSettings {
    fn default() -> Self {
        FlowControlSettings { block_size: 0, st_min: 0x14, flow_status: 0 }
    }
}

struct RxInner {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

struct RxBuffer {
    inner: Mutex<RxInner>,
    cond: Condvar,
}

/// One logical CAN-TP channel between a tester and an ECU.
pub struct TpSession {
    canif: Arc<CanInterface>,
    ecu_id: FrameId,
    tester_id: FrameId,
    chunk_length: usize,
    padding: u8,
    rx_flow: Mutex<FlowControlSettings>,
    fc_timeout: Duration,
    rx: Arc<RxBuffer>,
    queue_name: String,
    rx_lock: Mutex<()>,
    tx_lock: Mutex<()>,
}

impl TpSession {
    fn open(
        canif: Arc<CanInterface>,
        ecu_id: FrameId,
        tester_id: FrameId,
        chunk_length: usize,
        padding: u8,
        rx_flow: FlowControlSettings,
        fc_timeout: Duration,
    ) -> Result<Arc<TpSession>> {
        // A per-process sequence keeps queue names unique even when two
        // stacks open the same (ECU, tester) pair on one interface.
        static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

        let rx = Arc::new(RxBuffer {
            inner: Mutex::new(RxInner { frames: VecDeque::new(), closed: false }),
            cond: Condvar::new(),
        });
        let queue_name = format!(
            "cantp-{:X}-{:X}-{}",
            ecu_id.as_u32(),
            tester_id.as_u32(),
            SESSION_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        let buffer = rx.clone();
        canif.subscribe_id_queue(
            tester_id,
            Some(Arc::new(move |frame: &Frame| {
                let mut inner = buffer.inner.lock();
                if inner.closed {
                    return;
                }
                inner.frames.push_back(frame.data.clone());
                buffer.cond.notify_all();
            })),
            Some(&queue_name),
        )?;

        Ok(Arc::new(TpSession {
            canif,
            ecu_id,
            tester_id,
            chunk_length,
            padding,
            rx_flow: Mutex::new(rx_flow),
            fc_timeout,
            rx,
            queue_name,
            rx_lock: Mutex::new(()),
            tx_lock: Mutex::new(()),
        }))
    }

    /// Stop feeding the session and drop its subscription. Safe to call
    /// more than once.
    pub fn close(&self) {
        {
            let mut inner = self.rx.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            self.rx.cond.notify_all();
        }
        if let Err(e) = self.canif.unsubscribe_id_queue(self.tester_id, Some(&self.queue_name)) {
            warn!(tester = %self.tester_id, error = %e, "unsubscribe on close failed");
        }
    }

    /// Replace the FC parameters this session advertises to the ECU.
    pub fn set_rx_flow_control(&self, settings: FlowControlSettings) {
        *self.rx_flow.lock() = settings;
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// Receive one PDU. Every wait inherits the remaining deadline from
    /// `timeout`; a timeout, malformed opener or mid-PDU stall yields an
    /// empty result.
    pub fn receive(&self, timeout: Duration) -> Vec<u8> {
        let _rx_guard = self.rx_lock.lock();
        let deadline = Instant::now() + timeout;

        let Some(first) = self.pop_matching(is_transport_start, deadline) else {
            debug!(tester = %self.tester_id, "timeout waiting for first frame");
            return Vec::new();
        };

        match pci_type(&first) {
            Some(PCI_SF) => sf_payload(&first),
            Some(PCI_FF) => self.receive_segmented(&first, deadline),
            other => {
                warn!(pci = ?other, "unexpected PCI while waiting for a PDU opener");
                Vec::new()
            }
        }
    }

    fn receive_segmented(&self, first: &[u8], deadline: Instant) -> Vec<u8> {
        let Some(ff) = parse_first_frame(first) else {
            warn!(tester = %self.tester_id, "malformed first frame");
            return Vec::new();
        };
        let total = ff.total_len;
        let mut data = ff.initial;
        debug!(tester = %self.tester_id, total, carried = data.len(), "first frame received");

        if self.send_flow_control().is_err() {
            error!(ecu = %self.ecu_id, "failed to transmit flow control");
            return Vec::new();
        }

        while data.len() < total {
            if Instant::now() >= deadline {
                warn!(tester = %self.tester_id, "timeout while collecting consecutive frames");
                return Vec::new();
            }
            let Some(cf) = self.pop_matching(is_consecutive, deadline) else {
                warn!(tester = %self.tester_id, "no valid consecutive frame before deadline");
                return Vec::new();
            };
            data.extend_from_slice(&cf[1..]);
        }

        data.truncate(total);
        data
    }

    fn send_flow_control(&self) -> Result<()> {
        let settings = *self.rx_flow.lock();
        let fc = build_flow_control(settings.flow_status, settings.block_size, settings.st_min);
        debug!(ecu = %self.ecu_id, "sending flow control");
        self.write_tp(fc, None)
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Transmit one PDU given as a hex string (`"22 F1 87"`).
    pub fn send(&self, data: &str, padding: Option<u8>) -> Result<()> {
        let _tx_guard = self.tx_lock.lock();
        let payload = hex_to_bytes(data)?;

        if payload.len() <= sf_capacity(self.chunk_length) {
            return self.write_tp(build_single_frame(&payload), padding);
        }

        let (ff, consumed) = build_first_frame(&payload, self.chunk_length);
        self.write_tp(ff, padding)?;
        let mut remaining = &payload[consumed..];

        let fc = self.wait_for_flow_control()?;
        let mut block_size = fc.block_size;
        let mut st_min = st_min_delay(fc.st_min);
        let mut frames_in_block = 0u32;
        let mut sn = 0u8;

        while !remaining.is_empty() {
            sn = increase_sn(sn);
            let (cf, used) = build_consecutive(sn, remaining, self.chunk_length);
            self.write_tp(cf, padding)?;
            remaining = &remaining[used..];
            frames_in_block += 1;

            if !st_min.is_zero() {
                std::thread::sleep(st_min);
            }

            if block_size != 0 && frames_in_block >= block_size as u32 && !remaining.is_empty() {
                let fc = self.wait_for_flow_control()?;
                block_size = fc.block_size;
                st_min = st_min_delay(fc.st_min);
                frames_in_block = 0;
            }
        }

        Ok(())
    }

    /// Wait for the next Flow Control frame. WAIT keeps waiting within
    /// the same window, OVFLW aborts, CTS hands back the new parameters.
    fn wait_for_flow_control(&self) -> Result<FlowControlSettings> {
        let deadline = Instant::now() + self.fc_timeout;
        loop {
            let Some(fc) = self.pop_matching(is_flow_control, deadline) else {
                warn!(tester = %self.tester_id, "no flow control before deadline");
                return Err(Error::FlowControlTimeout);
            };
            let Some((status, block_size, st_min)) = parse_flow_control(&fc) else {
                continue;
            };
            match status {
                FC_WAIT => {
                    debug!("flow control WAIT, staying in the window");
                    continue;
                }
                FC_OVFLW => {
                    error!(tester = %self.tester_id, "flow control overflow");
                    return Err(Error::FlowControlOverflow);
                }
                _ => {
                    return Ok(FlowControlSettings { block_size, st_min, flow_status: status });
                }
            }
        }
    }

    // ------------------------------------------------------------------

    /// Pop the first buffered frame matching `predicate`, waiting on the
    /// buffer's condvar until `deadline`.
    fn pop_matching(
        &self,
        predicate: impl Fn(&[u8]) -> bool,
        deadline: Instant,
    ) -> Option<Vec<u8>> {
        let mut inner = self.rx.inner.lock();
        loop {
            if let Some(idx) = inner.frames.iter().position(|f| predicate(f)) {
                return inner.frames.remove(idx);
            }
            if inner.closed || Instant::now() >= deadline {
                return None;
            }
            self.rx.cond.wait_until(&mut inner, deadline);
        }
    }

    /// Pad a PCI frame out to its wire length and hand it to the bus.
    fn write_tp(&self, pci_frame: Vec<u8>, padding: Option<u8>) -> Result<()> {
        let pad = padding.unwrap_or(self.padding);
        let mut data = pci_frame;
        if self.chunk_length <= 8 {
            data.resize(8, pad);
        } else {
            data = dlc_pad(&data, pad);
            if data.len() < 8 {
                data.resize(8, pad);
            }
        }
        let frame = Frame {
            id: self.ecu_id,
            extended: self.ecu_id.needs_extended(),
            fd: self.chunk_length > 8,
            data,
            timestamp: None,
        };
        self.canif.send_frame(frame)
    }
}

/// Lazily creates and tracks sessions per (ECU, tester) pair.
pub struct SessionManager {
    canif: Arc<CanInterface>,
    chunk_length: usize,
    padding: u8,
    default_rx_flow: FlowControlSettings,
    fc_timeout: Duration,
    sessions: Mutex<HashMap<(FrameId, FrameId), Arc<TpSession>>>,
}

impl SessionManager {
    fn new(
        canif: Arc<CanInterface>,
        chunk_length: usize,
        padding: u8,
        default_rx_flow: FlowControlSettings,
        fc_timeout: Duration,
    ) -> SessionManager {
        SessionManager {
            canif,
            chunk_length,
            padding,
            default_rx_flow,
            fc_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_session(
        &self,
        ecu_id: impl IntoFrameId,
        tester_id: impl IntoFrameId,
    ) -> Result<Arc<TpSession>> {
        let ecu_id = ecu_id.into_frame_id()?;
        let tester_id = tester_id.into_frame_id()?;
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&(ecu_id, tester_id)) {
            return Ok(session.clone());
        }
        let session = TpSession::open(
            self.canif.clone(),
            ecu_id,
            tester_id,
            self.chunk_length,
            self.padding,
            self.default_rx_flow,
            self.fc_timeout,
        )?;
        sessions.insert((ecu_id, tester_id), session.clone());
        Ok(session)
    }

    /// Close every session and forget them.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut map = self.sessions.lock();
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close();
        }
    }
}

/// Entry point for ISO-TP send/receive on one interface.
pub struct CanTp {
    manager: SessionManager,
    chunk_length: usize,
}

impl CanTp {
    /// Chunk length follows the interface: 8 for classical CAN, 64 for
    /// CAN-FD.
    pub fn new(canif: Arc<CanInterface>) -> CanTp {
        CanTp::with_config(canif, FlowControlSettings::default(), DEFAULT_FC_TIMEOUT)
    }

    pub fn with_config(
        canif: Arc<CanInterface>,
        default_rx_flow: FlowControlSettings,
        fc_timeout: Duration,
    ) -> CanTp {
        let chunk_length = if canif.is_fd() { 64 } else { 8 };
        let padding = canif.padding();
        CanTp {
            manager: SessionManager::new(canif, chunk_length, padding, default_rx_flow, fc_timeout),
            chunk_length,
        }
    }

    pub fn chunk_length(&self) -> usize {
        self.chunk_length
    }

    /// Receive a PDU from `ecu_id` addressed to `tester_id`.
    pub fn receive(
        &self,
        ecu_id: impl IntoFrameId,
        tester_id: impl IntoFrameId,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let session = self.manager.get_session(ecu_id, tester_id)?;
        Ok(session.receive(timeout))
    }

    /// Send a hex PDU to `ecu_id`, awaiting flow control on `tester_id`.
    pub fn send(
        &self,
        ecu_id: impl IntoFrameId,
        tester_id: impl IntoFrameId,
        data: &str,
    ) -> Result<()> {
        let session = self.manager.get_session(ecu_id, tester_id)?;
        session.send(data, None)
    }

    /// Override the advertised RX flow-control profile of one session.
    pub fn configure_rx_flow_control(
        &self,
        ecu_id: impl IntoFrameId,
        tester_id: impl IntoFrameId,
        settings: FlowControlSettings,
    ) -> Result<()> {
        let session = self.manager.get_session(ecu_id, tester_id)?;
        session.set_rx_flow_control(settings);
        Ok(())
    }

    pub fn session(
        &self,
        ecu_id: impl IntoFrameId,
        tester_id: impl IntoFrameId,
    ) -> Result<Arc<TpSession>> {
        self.manager.get_session(ecu_id, tester_id)
    }

    /// Close all sessions.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockCan;
    use crate::interface::InterfaceOptions;
    use pretty_assertions::assert_eq;

    fn stack(fd: bool) -> (Arc<MockCan>, Arc<CanInterface>, CanTp) {
        let bus = MockCan::new();
        let canif = CanInterface::with_bus(
            bus.clone(),
            InterfaceOptions { fd, ..InterfaceOptions::default() },
        );
        let tp = CanTp::with_config(
            canif.clone(),
            FlowControlSettings::default(),
            Duration::from_millis(400),
        );
        (bus, canif, tp)
    }

    fn inject(bus: &MockCan, id: u32, data: &[u8]) {
        bus.inject(Frame::new(id, data).unwrap());
    }

    #[test]
    fn single_frame_request_hits_the_wire_padded() {
        let (bus, canif, tp) = stack(false);
        tp.send("7B3", "7BB", "22 F1 87").unwrap();

        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id.as_u32(), 0x7B3);
        assert_eq!(sent[0].data, vec![0x03, 0x22, 0xF1, 0x87, 0x00, 0x00, 0x00, 0x00]);
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn multi_frame_receive_reassembles_and_acknowledges() {
        let (bus, canif, tp) = stack(false);
        // Touch the session first so its subscription exists.
        let session = tp.session("7B3", "7BB").unwrap();

        inject(&bus, 0x7BB, &[0x10, 0x0A, 0x62, 0xF1, 0x87, 0x39, 0x37, 0x32]);
        inject(&bus, 0x7BB, &[0x21, 0x35, 0x35, 0x44, 0x43, 0x30, 0x31]);

        let pdu = session.receive(Duration::from_millis(800));
        assert_eq!(
            pdu,
            vec![0x62, 0xF1, 0x87, 0x39, 0x37, 0x32, 0x35, 0x35, 0x44, 0x43]
        );

        // Exactly one FC frame went back to the ECU with the default
        // profile.
        let fc_frames: Vec<_> = bus
            .sent()
            .into_iter()
            .filter(|f| f.id.as_u32() == 0x7B3)
            .collect();
        assert_eq!(fc_frames.len(), 1);
        assert_eq!(fc_frames[0].data, vec![0x30, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00]);
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn escape_first_frame_is_understood() {
        let (bus, canif, tp) = stack(false);
        let session = tp.session("7B3", "7BB").unwrap();

        inject(&bus, 0x7BB, &[0x10, 0x00, 0x00, 0x00, 0x00, 0x08, 0xAA, 0xBB]);
        inject(&bus, 0x7BB, &[0x21, 0xCC, 0xDD, 0xEE, 0xFF, 0x11, 0x22, 0x33]);

        let pdu = session.receive(Duration::from_millis(800));
        assert_eq!(pdu, vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x11, 0x22]);
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn segmented_send_honors_block_size_windows() {
        let (bus, canif, tp) = stack(false);
        let _session = tp.session("7B3", "7BB").unwrap();

        // 30 bytes: FF carries 6, then 4 CFs of up to 7 bytes.
        let data = (0u8..30).map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");

        let bus_resp = bus.clone();
        let responder = std::thread::spawn(move || {
            // CTS with BS=2, then a second CTS for the rest of the block.
            std::thread::sleep(Duration::from_millis(30));
            inject(&bus_resp, 0x7BB, &[0x30, 0x02, 0x00, 0, 0, 0, 0, 0]);
            std::thread::sleep(Duration::from_millis(80));
            inject(&bus_resp, 0x7BB, &[0x30, 0x00, 0x00, 0, 0, 0, 0, 0]);
        });

        tp.send("7B3", "7BB", &data).unwrap();
        responder.join().unwrap();

        let tx: Vec<_> = bus.sent().into_iter().filter(|f| f.id.as_u32() == 0x7B3).collect();
        assert_eq!(tx.len(), 5, "FF plus four CFs");
        assert_eq!(tx[0].data[0], 0x10);
        assert_eq!(tx[0].data[1], 30);
        assert_eq!(tx[1].data[0], 0x21);
        assert_eq!(tx[2].data[0], 0x22);
        assert_eq!(tx[3].data[0], 0x23);
        assert_eq!(tx[4].data[0], 0x24);

        // Reassemble what went out and compare against the input.
        let mut payload = tx[0].data[2..].to_vec();
        for cf in &tx[1..] {
            payload.extend_from_slice(&cf.data[1..]);
        }
        payload.truncate(30);
        assert_eq!(payload, (0u8..30).collect::<Vec<_>>());
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn st_min_microsecond_encoding_paces_consecutive_frames() {
        let (bus, canif, tp) = stack(false);
        let _session = tp.session("7B3", "7BB").unwrap();

        let data = (0u8..20).map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");
        let bus_resp = bus.clone();
        let responder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            inject(&bus_resp, 0x7BB, &[0x30, 0x00, 0xF1, 0, 0, 0, 0, 0]);
        });

        tp.send("7B3", "7BB", &data).unwrap();
        responder.join().unwrap();

        let tx: Vec<_> = bus.sent().into_iter().filter(|f| f.data[0] & 0xF0 == 0x20).collect();
        assert_eq!(tx.len(), 2);
        let gap = tx[1].timestamp.unwrap() - tx[0].timestamp.unwrap();
        assert!(gap >= 0.0001, "CF spacing {gap}s below STmin of 100us");
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn wait_flow_status_extends_the_window() {
        let (bus, canif, tp) = stack(false);
        let _session = tp.session("7B3", "7BB").unwrap();

        let data = (0u8..20).map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");
        let bus_resp = bus.clone();
        let responder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            inject(&bus_resp, 0x7BB, &[0x31, 0x00, 0x00, 0, 0, 0, 0, 0]);
            std::thread::sleep(Duration::from_millis(50));
            inject(&bus_resp, 0x7BB, &[0x30, 0x00, 0x00, 0, 0, 0, 0, 0]);
        });

        tp.send("7B3", "7BB", &data).unwrap();
        responder.join().unwrap();
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn overflow_aborts_the_send() {
        let (bus, canif, tp) = stack(false);
        let _session = tp.session("7B3", "7BB").unwrap();

        let data = (0u8..20).map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");
        let bus_resp = bus.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            inject(&bus_resp, 0x7BB, &[0x32, 0x00, 0x00, 0, 0, 0, 0, 0]);
        });

        assert!(matches!(
            tp.send("7B3", "7BB", &data),
            Err(Error::FlowControlOverflow)
        ));
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn missing_flow_control_times_out() {
        let (_bus, canif, tp) = stack(false);
        let _session = tp.session("7B3", "7BB").unwrap();
        let data = (0u8..20).map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");
        let started = Instant::now();
        assert!(matches!(
            tp.send("7B3", "7BB", &data),
            Err(Error::FlowControlTimeout)
        ));
        assert!(started.elapsed() >= Duration::from_millis(300));
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn receive_timeout_is_empty_and_session_stays_usable() {
        let (bus, canif, tp) = stack(false);
        let session = tp.session("7B3", "7BB").unwrap();
        assert!(session.receive(Duration::from_millis(50)).is_empty());

        inject(&bus, 0x7BB, &[0x02, 0x50, 0x01, 0, 0, 0, 0, 0]);
        assert_eq!(session.receive(Duration::from_millis(500)), vec![0x50, 0x01]);
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn sessions_with_different_testers_stay_isolated() {
        let (bus, canif, tp) = stack(false);
        let a = tp.session("7B3", "7BB").unwrap();
        let b = tp.session("7B4", "7BC").unwrap();

        inject(&bus, 0x7BB, &[0x02, 0x62, 0x01, 0, 0, 0, 0, 0]);
        inject(&bus, 0x7BC, &[0x02, 0x62, 0x02, 0, 0, 0, 0, 0]);

        assert_eq!(a.receive(Duration::from_millis(500)), vec![0x62, 0x01]);
        assert_eq!(b.receive(Duration::from_millis(500)), vec![0x62, 0x02]);
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn loopback_round_trip_between_two_sessions() {
        let (_bus, canif, tp) = stack(false);
        // A talks to ECU 0x7B3 and listens on 0x7BB; B mirrors the pair,
        // so each one's transmissions land in the other's buffer.
        let a = tp.session("7B3", "7BB").unwrap();
        let b = tp.session("7BB", "7B3").unwrap();

        let payload: Vec<u8> = (0u8..=99).collect();
        let hex = payload.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");

        let receiver = std::thread::spawn(move || b.receive(Duration::from_secs(3)));
        std::thread::sleep(Duration::from_millis(30));
        a.send(&hex, None).unwrap();
        let received = receiver.join().unwrap();
        assert_eq!(received, payload);
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn fd_sessions_segment_with_64_byte_chunks() {
        let (_bus, canif, tp) = stack(true);
        assert_eq!(tp.chunk_length(), 64);
        let a = tp.session("7B3", "7BB").unwrap();
        let b = tp.session("7BB", "7B3").unwrap();

        let payload: Vec<u8> = (0..200u16).map(|v| (v & 0xFF) as u8).collect();
        let hex = payload.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");

        let receiver = std::thread::spawn(move || b.receive(Duration::from_secs(3)));
        std::thread::sleep(Duration::from_millis(30));
        a.send(&hex, None).unwrap();
        assert_eq!(receiver.join().unwrap(), payload);
        tp.shutdown();
        canif.shutdown();
    }

    #[test]
    fn double_close_is_a_no_op() {
        let (_bus, canif, tp) = stack(false);
        let session = tp.session("7B3", "7BB").unwrap();
        session.close();
        session.close();
        tp.shutdown();
        canif.shutdown();
    }
}
