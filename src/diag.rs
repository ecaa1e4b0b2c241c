//! UDS-style diagnostic helpers on top of the transport layer.
//!
//! Covers request/response matching (positive replies echo SID + 0x40),
//! the NRC 0x78 "response pending" rewait, a Tester Present keep-alive
//! loop and the Seed-and-Key unlock of service 0x27. The seed-to-key
//! computation lives in an external vendor library and is reached
//! through [`KeyProvider`]; the production implementation shells out to
//! a helper executable.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::cast::{bytes_to_hex, hex_to_bytes};
use crate::interface::CanInterface;
use crate::tp::{CanTp, FlowControlSettings, DEFAULT_FC_TIMEOUT};
use crate::{Error, FrameId, IntoFrameId, Result};

/// Default window for a single diagnostic response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(300);
/// Default cadence of the Tester Present keep-alive.
pub const DEFAULT_TESTER_PRESENT_INTERVAL: Duration = Duration::from_millis(2000);

const NRC: u8 = 0x7F;
const NRC_RESPONSE_PENDING: u8 = 0x78;
const TESTER_PRESENT: &str = "3E 80";

/// Negative response: first byte 0x7F.
pub fn is_nrc(response: &[u8]) -> bool {
    response.first() == Some(&NRC)
}

/// NRC 0x78 is not an error, it is a "keep waiting" signal.
fn is_response_pending(response: &[u8]) -> bool {
    response.len() > 2 && response[0] == NRC && response[2] == NRC_RESPONSE_PENDING
}

/// Maps a seed to the security key. The real computation sits in a
/// vendor library outside this crate.
pub trait KeyProvider: Send + Sync {
    fn key_for(&self, seed: u64) -> Result<String>;
}

/// Invokes the external helper as a subprocess:
/// `helper <library_path> <SEED_HEX_16>` → uppercase hex key on stdout,
/// exit code 0.
pub struct SubprocessKeyGenerator {
    helper: PathBuf,
    library: PathBuf,
}

impl SubprocessKeyGenerator {
    pub fn new(helper: impl Into<PathBuf>, library: impl Into<PathBuf>) -> SubprocessKeyGenerator {
        SubprocessKeyGenerator { helper: helper.into(), library: library.into() }
    }
}

impl KeyProvider for SubprocessKeyGenerator {
    fn key_for(&self, seed: u64) -> Result<String> {
        let seed_hex = format!("{seed:016X}");
        let output = Command::new(&self.helper)
            .arg(&self.library)
            .arg(&seed_hex)
            .output()
            .map_err(|e| Error::KeyGenerator(format!("spawning {:?}: {e}", self.helper)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::KeyGenerator(format!(
                "helper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let key = String::from_utf8_lossy(&output.stdout).trim().to_uppercase();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::KeyGenerator(format!("unparseable key {key:?}")));
        }
        Ok(key)
    }
}

struct KeepAliveGate {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// High-level diagnostic channel bound to one (ECU, tester) pair.
pub struct Diag {
    canif: Arc<CanInterface>,
    tp: Arc<CanTp>,
    ecu_id: FrameId,
    tester_id: FrameId,
    key_provider: Mutex<Option<Arc<dyn KeyProvider>>>,
    keep_alive: Arc<AtomicBool>,
    gate: Arc<KeepAliveGate>,
    keep_alive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Diag {
    pub fn new(
        canif: Arc<CanInterface>,
        ecu_id: impl IntoFrameId,
        tester_id: impl IntoFrameId,
    ) -> Result<Diag> {
        Diag::with_flow_control(canif, ecu_id, tester_id, FlowControlSettings::default())
    }

    pub fn with_flow_control(
        canif: Arc<CanInterface>,
        ecu_id: impl IntoFrameId,
        tester_id: impl IntoFrameId,
        rx_flow: FlowControlSettings,
    ) -> Result<Diag> {
        let ecu_id = ecu_id.into_frame_id()?;
        let tester_id = tester_id.into_frame_id()?;
        let tp = Arc::new(CanTp::with_config(canif.clone(), rx_flow, DEFAULT_FC_TIMEOUT));
        Ok(Diag {
            canif,
            tp,
            ecu_id,
            tester_id,
            key_provider: Mutex::new(None),
            keep_alive: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(KeepAliveGate { stopped: Mutex::new(false), cond: Condvar::new() }),
            keep_alive_thread: Mutex::new(None),
        })
    }

    pub fn set_key_provider(&self, provider: Arc<dyn KeyProvider>) {
        *self.key_provider.lock() = Some(provider);
    }

    /// Override the RX flow-control profile of this pair's session.
    pub fn configure_rx_flow_control(&self, settings: FlowControlSettings) -> Result<()> {
        self.tp
            .configure_rx_flow_control(self.ecu_id, self.tester_id, settings)
    }

    // ------------------------------------------------------------------
    // Core operations
    // ------------------------------------------------------------------

    /// Send a hex PDU to the (optionally overridden) ECU.
    pub fn send(&self, msg: &str, ecu_id: Option<FrameId>) -> Result<()> {
        let ecu = ecu_id.unwrap_or(self.ecu_id);
        self.tp.send(ecu, self.tester_id, msg)
    }

    /// Receive one response. NRC 0x78 means the ECU is still working on
    /// it, so the wait restarts with the same timeout until a real
    /// answer (or a real timeout) arrives.
    pub fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        loop {
            let response = self.tp.receive(self.ecu_id, self.tester_id, timeout)?;
            if is_response_pending(&response) {
                debug!("response pending, rewaiting");
                continue;
            }
            return Ok(response);
        }
    }

    /// Like [`Diag::receive`], but every wait — including the 0x78
    /// rewaits — draws on the time left until `deadline`, so the caller's
    /// overall budget is a hard cap.
    fn receive_until(&self, deadline: Instant) -> Result<Vec<u8>> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let response = self.tp.receive(self.ecu_id, self.tester_id, remaining)?;
            if is_response_pending(&response) {
                debug!("response pending, rewaiting");
                continue;
            }
            return Ok(response);
        }
    }

    /// Send a request and wait for the response whose SID matches it
    /// (directly, as positive reply SID + 0x40, or echoed inside an
    /// NRC, which is returned verbatim for the caller to inspect). The
    /// whole poll, rewaits included, is bounded by `timeout`.
    pub fn send_and_received(
        &self,
        raw_msg: &str,
        ecu_id: Option<FrameId>,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let request = hex_to_bytes(raw_msg)?;
        let Some(&sid) = request.first() else {
            return Err(Error::InvalidHex(raw_msg.to_string()));
        };

        self.send(raw_msg, ecu_id)?;
        let deadline = Instant::now() + timeout;
        loop {
            let response = self.receive_until(deadline)?;
            if !response.is_empty() && sid_matches(&response, sid) {
                debug!(response = %bytes_to_hex(&response), "matched response");
                return Ok(Some(response));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    // ------------------------------------------------------------------
    // Tester Present keep-alive
    // ------------------------------------------------------------------

    pub fn send_tester_present(&self, ecu_id: Option<FrameId>) -> Result<()> {
        self.send(TESTER_PRESENT, ecu_id)
    }

    /// Keep-alive with the conventional 2 s cadence.
    pub fn start_tester_present_default(&self) {
        self.start_tester_present(DEFAULT_TESTER_PRESENT_INTERVAL, None);
    }

    /// Spawn the keep-alive loop emitting `3E 80` every `interval`.
    pub fn start_tester_present(&self, interval: Duration, ecu_id: Option<FrameId>) {
        let mut slot = self.keep_alive_thread.lock();
        if slot.is_some() {
            warn!("tester present loop is already running");
            return;
        }

        self.keep_alive.store(true, Ordering::SeqCst);
        *self.gate.stopped.lock() = false;

        let tp = self.tp.clone();
        let tester_id = self.tester_id;
        let ecu = ecu_id.unwrap_or(self.ecu_id);
        let keep_alive = self.keep_alive.clone();
        let gate = self.gate.clone();

        *slot = Some(
            std::thread::Builder::new()
                .name("tester-present".into())
                .spawn(move || {
                    while keep_alive.load(Ordering::SeqCst) {
                        if let Err(e) = tp.send(ecu, tester_id, TESTER_PRESENT) {
                            warn!(error = %e, "tester present send failed");
                        }
                        let mut stopped = gate.stopped.lock();
                        if !*stopped {
                            gate.cond.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    info!("tester present loop stopped");
                })
                .expect("spawn tester present thread"),
        );
    }

    /// Stop the keep-alive loop and join it.
    pub fn stop_tester_present(&self) {
        let handle = self.keep_alive_thread.lock().take();
        let Some(handle) = handle else {
            debug!("tester present loop is not running");
            return;
        };
        self.keep_alive.store(false, Ordering::SeqCst);
        {
            let mut stopped = self.gate.stopped.lock();
            *stopped = true;
            self.gate.cond.notify_all();
        }
        let _ = handle.join();
    }

    // ------------------------------------------------------------------
    // Seed and Key
    // ------------------------------------------------------------------

    /// Unlock security access: request the seed with `27 11`, map it to
    /// a key through the external generator, send `27 12` plus the key.
    /// Any NRC or timeout along the way yields `false` without retry.
    pub fn unlock_security(&self, ecu_id: Option<FrameId>) -> Result<bool> {
        let Some(seed_response) =
            self.send_and_received("27 11", ecu_id, DEFAULT_RESPONSE_TIMEOUT)?
        else {
            warn!("seed request timed out");
            return Ok(false);
        };
        if is_nrc(&seed_response) {
            warn!(response = %bytes_to_hex(&seed_response), "seed request rejected");
            return Ok(false);
        }
        if seed_response.len() <= 2 {
            warn!("seed response carries no seed bytes");
            return Ok(false);
        }

        let seed = fold_seed(&seed_response[2..]);
        let key = {
            let provider = self.key_provider.lock().clone();
            let Some(provider) = provider else {
                return Err(Error::KeyGenerator("no key provider configured".into()));
            };
            match provider.key_for(seed) {
                Ok(key) => key,
                Err(e) => {
                    error!(error = %e, "key generation failed");
                    return Ok(false);
                }
            }
        };

        let request = format!("27 12 {key}");
        let Some(key_response) = self.send_and_received(&request, ecu_id, DEFAULT_RESPONSE_TIMEOUT)?
        else {
            warn!("key request timed out");
            return Ok(false);
        };
        if is_nrc(&key_response) {
            warn!(response = %bytes_to_hex(&key_response), "key rejected");
            return Ok(false);
        }
        info!("security access unlocked");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Passthroughs
    // ------------------------------------------------------------------

    /// Schedule a raw periodic message through the interface.
    pub fn send_periodic(
        &self,
        id: impl IntoFrameId,
        raw_data: &str,
        period: Duration,
        duration: Option<Duration>,
    ) -> Result<()> {
        self.canif.write_periodic(id, raw_data, period, duration)
    }

    pub fn stop_all_periodic(&self) {
        self.canif.stop_all_periodic();
    }

    /// Stop the keep-alive loop and close the TP sessions.
    pub fn shutdown(&self) {
        self.stop_tester_present();
        self.tp.shutdown();
    }
}

impl Drop for Diag {
    fn drop(&mut self) {
        self.stop_tester_present();
    }
}

fn sid_matches(response: &[u8], sid: u8) -> bool {
    let positive = sid.wrapping_add(0x40);
    if response[0] == sid || response[0] == positive {
        return true;
    }
    response.len() > 1 && (response[1] == sid || response[1] == positive)
}

/// Big-endian fold of the seed bytes into the 64-bit value the external
/// generator expects.
fn fold_seed(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockCan;
    use crate::interface::InterfaceOptions;
    use crate::Frame;
    use pretty_assertions::assert_eq;

    fn stack() -> (Arc<MockCan>, Arc<CanInterface>, Diag) {
        let bus = MockCan::new();
        let canif = CanInterface::with_bus(bus.clone(), InterfaceOptions::default());
        let diag = Diag::new(canif.clone(), "7B3", "7BB").unwrap();
        (bus, canif, diag)
    }

    fn inject(bus: &MockCan, id: u32, data: &[u8]) {
        bus.inject(Frame::new(id, data).unwrap());
    }

    struct StubKeys {
        key: String,
        seen: Mutex<Vec<u64>>,
    }

    impl KeyProvider for StubKeys {
        fn key_for(&self, seed: u64) -> Result<String> {
            self.seen.lock().push(seed);
            Ok(self.key.clone())
        }
    }

    #[test]
    fn pending_nrc_rewaits_until_the_real_answer() {
        let (bus, canif, diag) = stack();
        inject(&bus, 0x7BB, &[0x03, 0x7F, 0x22, 0x78, 0, 0, 0, 0]);
        inject(&bus, 0x7BB, &[0x03, 0x7F, 0x22, 0x78, 0, 0, 0, 0]);
        inject(&bus, 0x7BB, &[0x03, 0x62, 0xF1, 0x87, 0, 0, 0, 0]);

        let response = diag
            .send_and_received("22 F1 87", None, Duration::from_millis(500))
            .unwrap()
            .unwrap();
        assert_eq!(response, vec![0x62, 0xF1, 0x87]);
        diag.shutdown();
        canif.shutdown();
    }

    #[test]
    fn non_pending_nrc_is_returned_verbatim() {
        let (bus, canif, diag) = stack();
        inject(&bus, 0x7BB, &[0x03, 0x7F, 0x22, 0x31, 0, 0, 0, 0]);

        let response = diag
            .send_and_received("22 F1 87", None, Duration::from_millis(500))
            .unwrap()
            .unwrap();
        assert_eq!(response, vec![0x7F, 0x22, 0x31]);
        diag.shutdown();
        canif.shutdown();
    }

    #[test]
    fn overall_timeout_caps_a_stream_of_pending_responses() {
        let (bus, canif, diag) = stack();
        // An ECU that keeps answering "pending" faster than the window
        // closes must not extend the poll past its overall budget.
        let bus_resp = bus.clone();
        let responder = std::thread::spawn(move || {
            for _ in 0..10 {
                inject(&bus_resp, 0x7BB, &[0x03, 0x7F, 0x22, 0x78, 0, 0, 0, 0]);
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        let started = Instant::now();
        let response = diag
            .send_and_received("22 F1 87", None, Duration::from_millis(150))
            .unwrap();
        assert!(response.is_none());
        assert!(
            started.elapsed() < Duration::from_millis(600),
            "poll ran past its overall budget"
        );
        responder.join().unwrap();
        diag.shutdown();
        canif.shutdown();
    }

    #[test]
    fn request_times_out_without_a_response() {
        let (_bus, canif, diag) = stack();
        let response = diag
            .send_and_received("22 F1 87", None, Duration::from_millis(80))
            .unwrap();
        assert!(response.is_none());
        diag.shutdown();
        canif.shutdown();
    }

    #[test]
    fn unlock_walks_seed_and_key_happy_path() {
        let (bus, canif, diag) = stack();
        let keys = Arc::new(StubKeys { key: "AABBCCDD".into(), seen: Mutex::new(Vec::new()) });
        diag.set_key_provider(keys.clone());

        // 67 11 + 6 seed bytes spans two frames.
        inject(&bus, 0x7BB, &[0x10, 0x08, 0x67, 0x11, 0x75, 0x0D, 0x4C, 0x77]);
        inject(&bus, 0x7BB, &[0x21, 0x99, 0xB5, 0x00, 0x00, 0x00, 0x00, 0x00]);
        // Positive reply to 27 12.
        inject(&bus, 0x7BB, &[0x02, 0x67, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00]);

        assert!(diag.unlock_security(None).unwrap());
        assert_eq!(keys.seen.lock().as_slice(), &[0x750D_4C77_99B5]);

        // The key request carried the generated key bytes.
        let key_request = bus
            .sent()
            .into_iter()
            .find(|f| f.data.starts_with(&[0x06, 0x27, 0x12]))
            .expect("27 12 request on the bus");
        assert_eq!(&key_request.data[3..7], &[0xAA, 0xBB, 0xCC, 0xDD]);
        diag.shutdown();
        canif.shutdown();
    }

    #[test]
    fn unlock_fails_on_rejected_key_without_retry() {
        let (bus, canif, diag) = stack();
        let keys = Arc::new(StubKeys { key: "00".into(), seen: Mutex::new(Vec::new()) });
        diag.set_key_provider(keys);

        inject(&bus, 0x7BB, &[0x04, 0x67, 0x11, 0xAA, 0xBB, 0x00, 0x00, 0x00]);
        inject(&bus, 0x7BB, &[0x03, 0x7F, 0x27, 0x35, 0x00, 0x00, 0x00, 0x00]);

        assert!(!diag.unlock_security(None).unwrap());
        // One seed request, one key request, nothing more.
        let requests: Vec<_> = bus
            .sent()
            .into_iter()
            .filter(|f| f.id.as_u32() == 0x7B3 && f.data[1] == 0x27)
            .collect();
        assert_eq!(requests.len(), 2);
        diag.shutdown();
        canif.shutdown();
    }

    #[test]
    fn unlock_fails_on_seed_nrc() {
        let (bus, canif, diag) = stack();
        inject(&bus, 0x7BB, &[0x03, 0x7F, 0x27, 0x33, 0x00, 0x00, 0x00, 0x00]);
        assert!(!diag.unlock_security(None).unwrap());
        diag.shutdown();
        canif.shutdown();
    }

    #[test]
    fn tester_present_loops_until_stopped() {
        let (bus, canif, diag) = stack();
        diag.start_tester_present(Duration::from_millis(40), None);
        std::thread::sleep(Duration::from_millis(150));
        diag.stop_tester_present();

        let keep_alives: Vec<_> = bus
            .sent()
            .into_iter()
            .filter(|f| f.data.starts_with(&[0x02, 0x3E, 0x80]))
            .collect();
        assert!(keep_alives.len() >= 2, "saw {} keep-alives", keep_alives.len());

        let count = keep_alives.len();
        std::thread::sleep(Duration::from_millis(100));
        let after: usize = bus
            .sent()
            .into_iter()
            .filter(|f| f.data.starts_with(&[0x02, 0x3E, 0x80]))
            .count();
        assert_eq!(after, count, "keep-alive kept running after stop");
        diag.shutdown();
        canif.shutdown();
    }

    #[test]
    fn subprocess_generator_reports_missing_helper() {
        let gen = SubprocessKeyGenerator::new("/definitely/not/here", "lib.dll");
        assert!(matches!(gen.key_for(0x1234), Err(Error::KeyGenerator(_))));
    }
}
