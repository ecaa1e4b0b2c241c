//! Bus adapter contract and the adapters that ship with the crate.
//!
//! The stack only ever talks to [`BusAdapter`]; hardware backends plug in
//! behind it. Vendor devices (PCAN, the Vector family) are recognized by
//! name but their drivers live outside this crate, so opening them on an
//! unsupported platform fails with a configuration error instead of
//! pretending to work.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{Error, Frame, Result};

#[cfg(target_os = "linux")]
pub mod socketcan;

/// Contract every bus backend satisfies. The driver is assumed
/// thread-safe for independent sends; `recv` is only ever driven by the
/// reader task.
pub trait BusAdapter: Send + Sync {
    fn send(&self, frame: &Frame) -> Result<()>;

    /// Block up to `timeout` for one frame. `Ok(None)` means the window
    /// elapsed quietly.
    fn recv(&self, timeout: Duration) -> Result<Option<Frame>>;

    fn shutdown(&self);
}

/// Adapter names recognized by [`open_device`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Pcan,
    Canalyzer,
    Canoe,
    Canape,
    VirtualCan,
    MockCan,
}

impl Device {
    pub fn name(self) -> &'static str {
        match self {
            Device::Pcan => "PCAN",
            Device::Canalyzer => "CANalyzer",
            Device::Canoe => "CANoe",
            Device::Canape => "CANape",
            Device::VirtualCan => "VirtualCAN",
            Device::MockCan => "MockCAN",
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Device> {
        match s {
            "PCAN" => Ok(Device::Pcan),
            "CANalyzer" => Ok(Device::Canalyzer),
            "CANoe" => Ok(Device::Canoe),
            "CANape" => Ok(Device::Canape),
            "VirtualCAN" => Ok(Device::VirtualCan),
            "MockCAN" => Ok(Device::MockCan),
            other => Err(Error::UnsupportedDevice(other.to_string())),
        }
    }
}

/// Open a bus by device name. `channel` names the interface for backends
/// that have one (e.g. `vcan0` for `VirtualCAN`); `fd` asks for CAN-FD
/// frames where the backend supports the switch.
pub fn open_device(device: &str, channel: &str, fd: bool) -> Result<Arc<dyn BusAdapter>> {
    let device: Device = device.parse()?;
    match device {
        Device::MockCan => {
            info!("using in-process mock CAN bus");
            Ok(MockCan::new())
        }
        #[cfg(target_os = "linux")]
        Device::VirtualCan => {
            info!(interface = channel, "opening SocketCAN interface");
            let iface = if channel.is_empty() { "vcan0" } else { channel };
            Ok(Arc::new(socketcan::CanSocket::open(iface, fd)?))
        }
        #[cfg(not(target_os = "linux"))]
        Device::VirtualCan => {
            let _ = (channel, fd);
            Err(Error::DeviceUnavailable(device.name()))
        }
        Device::Pcan | Device::Canalyzer | Device::Canoe | Device::Canape => {
            // Vendor driver stacks are external collaborators.
            Err(Error::DeviceUnavailable(device.name()))
        }
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// In-process bus that loops every `send` back into its own receive
/// queue, so a stack under test observes its own traffic.
pub struct MockCan {
    rx_tx: Mutex<Option<Sender<Frame>>>,
    rx: Receiver<Frame>,
    sent: Mutex<Vec<Frame>>,
}

impl MockCan {
    pub fn new() -> Arc<MockCan> {
        let (rx_tx, rx) = unbounded();
        Arc::new(MockCan { rx_tx: Mutex::new(Some(rx_tx)), rx, sent: Mutex::new(Vec::new()) })
    }

    /// Push a frame into the receive queue without the loopback, as if a
    /// remote node had transmitted it.
    pub fn inject(&self, mut frame: Frame) {
        if frame.timestamp.is_none() {
            frame.timestamp = Some(epoch_seconds());
        }
        if let Some(tx) = self.rx_tx.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Snapshot of everything sent through this bus, in order.
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    /// Drain the sent log.
    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl BusAdapter for MockCan {
    fn send(&self, frame: &Frame) -> Result<()> {
        let mut stamped = frame.clone();
        if stamped.timestamp.is_none() {
            stamped.timestamp = Some(epoch_seconds());
        }
        debug!(id = %stamped.id, len = stamped.data.len(), "mock bus send");
        self.sent.lock().push(stamped.clone());
        if let Some(tx) = self.rx_tx.lock().as_ref() {
            let _ = tx.send(stamped);
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                // Closed: keep the caller's pacing instead of spinning.
                std::thread::sleep(timeout.min(Duration::from_millis(50)));
                Ok(None)
            }
        }
    }

    fn shutdown(&self) {
        // Dropping the sender wakes any receive blocked in the queue.
        self.rx_tx.lock().take();
        info!("mock bus closed");
    }
}
