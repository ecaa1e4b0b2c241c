//! CAN / CAN-FD diagnostic stack.
//!
//! The crate layers four subsystems on top of a pluggable bus adapter:
//!
//! * [`reader`] — a receive loop that demultiplexes inbound frames into a
//!   default stream, per-ID queues, named subscriber queues and callbacks.
//! * [`scheduler`] — periodic transmission tasks with pause/resume,
//!   duration caps and event-driven bursts.
//! * [`dbc`] — a DBC-backed signal runtime that encodes payloads on
//!   demand, refreshes alive counters and stamps E2E CRCs.
//! * [`tp`] / [`diag`] — ISO 15765-2 segmented transport and UDS-style
//!   diagnostic helpers (Tester Present, Seed-and-Key, NRC handling).
//!
//! [`interface::CanInterface`] wires bus, reader, scheduler and DBC
//! runtime together; [`trace::TraceTap`] observes traffic in both
//! directions through the reader's RX hook and the interface's TX hook.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub mod bus;
pub mod cast;
pub mod crc;
pub mod dbc;
pub mod diag;
pub mod interface;
pub mod reader;
pub mod scheduler;
pub mod tp;
pub mod trace;

pub use bus::{BusAdapter, MockCan};
pub use interface::CanInterface;
pub use reader::FrameReader;
pub use scheduler::FrameScheduler;
pub use tp::{CanTp, FlowControlSettings};
pub use trace::TraceTap;

/// Maximum payload of a classical CAN frame.
pub const CAN_MAX_DLEN: usize = 8;
/// Maximum payload of a CAN-FD frame.
pub const CANFD_MAX_DLEN: usize = 64;

/// Highest valid 11-bit identifier.
pub const STANDARD_ID_MAX: u32 = 0x7FF;
/// Highest valid 29-bit identifier.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The given value could not be normalized into a CAN identifier.
    #[error("invalid CAN id {0:?}")]
    InvalidId(String),

    /// A hex payload string contained something other than hex digits.
    #[error("invalid hex payload {0:?}")]
    InvalidHex(String),

    /// An operation was attempted before the required resource existed.
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    /// The device name is not one of the recognized adapters.
    #[error("unsupported device {0:?}")]
    UnsupportedDevice(String),

    /// The device is recognized but has no backend on this platform.
    #[error("device {0} is not available on this platform")]
    DeviceUnavailable(&'static str),

    /// The DBC file could not be read or parsed.
    #[error("failed to load DBC: {0}")]
    DbcLoad(String),

    /// The message name or frame id is not present in the loaded DBC.
    #[error("unknown message {0:?}")]
    UnknownMessage(String),

    /// A periodic start had neither an explicit period nor a DBC cycle
    /// time to fall back on.
    #[error("message {0:?} has no cycle time")]
    MissingCycleTime(String),

    /// Payload longer than the frame kind allows.
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLong { len: usize, max: usize },

    /// The bus driver rejected a send or receive.
    #[error("bus error: {0}")]
    Bus(String),

    /// No Flow Control frame arrived within the configured window.
    #[error("timed out waiting for flow control")]
    FlowControlTimeout,

    /// The peer reported a Flow Control overflow.
    #[error("flow control overflow reported by peer")]
    FlowControlOverflow,

    /// The external seed-to-key helper failed or returned garbage.
    #[error("key generator: {0}")]
    KeyGenerator(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A CAN identifier, normalized from the mixed inputs callers pass around
/// (integers, decimal strings like `"291"`, hex strings like `"7B3"` and
/// `"0x7B3"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u32);

impl FrameId {
    pub fn new(raw: u32) -> Result<FrameId> {
        if raw > EXTENDED_ID_MAX {
            return Err(Error::InvalidId(format!("{raw:#x}")));
        }
        Ok(FrameId(raw))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether the identifier only fits the 29-bit extended format.
    pub fn needs_extended(self) -> bool {
        self.0 > STANDARD_ID_MAX
    }
}

impl From<FrameId> for u32 {
    fn from(id: FrameId) -> u32 {
        id.0
    }
}

impl FromStr for FrameId {
    type Err = Error;

    /// Ids arrive interchangeably as decimal strings, hex strings or
    /// `0x`-prefixed hex. A `0x` prefix forces hex; bare strings parse
    /// as decimal first and fall back to hex, so `"291"` is 291 while
    /// `"7B3"` is 0x7B3.
    fn from_str(s: &str) -> Result<FrameId> {
        let token = s.trim();
        let raw = if let Some(digits) = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
        {
            u32::from_str_radix(digits, 16)
        } else {
            token
                .parse::<u32>()
                .or_else(|_| u32::from_str_radix(token, 16))
        }
        .map_err(|_| Error::InvalidId(token.to_string()))?;
        FrameId::new(raw).map_err(|_| Error::InvalidId(token.to_string()))
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl fmt::UpperHex for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

/// Accepted id inputs for the public API surface.
///
/// Every entry point funnels through this so an unparseable id surfaces as
/// exactly one error kind.
pub trait IntoFrameId {
    fn into_frame_id(self) -> Result<FrameId>;
}

impl IntoFrameId for FrameId {
    fn into_frame_id(self) -> Result<FrameId> {
        Ok(self)
    }
}

impl IntoFrameId for u32 {
    fn into_frame_id(self) -> Result<FrameId> {
        FrameId::new(self)
    }
}

impl IntoFrameId for &str {
    fn into_frame_id(self) -> Result<FrameId> {
        self.parse()
    }
}

impl IntoFrameId for &String {
    fn into_frame_id(self) -> Result<FrameId> {
        self.as_str().parse()
    }
}

impl IntoFrameId for String {
    fn into_frame_id(self) -> Result<FrameId> {
        self.as_str().parse()
    }
}

/// A single CAN or CAN-FD frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub id: FrameId,
    pub extended: bool,
    pub fd: bool,
    pub data: Vec<u8>,
    /// Seconds since the UNIX epoch, when the adapter provides one.
    pub timestamp: Option<f64>,
}

impl Frame {
    /// Build a classical CAN frame. Fails if the payload exceeds 8 bytes.
    pub fn new(id: impl IntoFrameId, data: &[u8]) -> Result<Frame> {
        let id = id.into_frame_id()?;
        if data.len() > CAN_MAX_DLEN {
            return Err(Error::PayloadTooLong { len: data.len(), max: CAN_MAX_DLEN });
        }
        Ok(Frame {
            extended: id.needs_extended(),
            id,
            fd: false,
            data: data.to_vec(),
            timestamp: None,
        })
    }

    /// Build a CAN-FD frame. Fails if the payload exceeds 64 bytes.
    pub fn new_fd(id: impl IntoFrameId, data: &[u8]) -> Result<Frame> {
        let id = id.into_frame_id()?;
        if data.len() > CANFD_MAX_DLEN {
            return Err(Error::PayloadTooLong { len: data.len(), max: CANFD_MAX_DLEN });
        }
        Ok(Frame {
            extended: id.needs_extended(),
            id,
            fd: true,
            data: data.to_vec(),
            timestamp: None,
        })
    }

    pub fn with_extended(mut self, extended: bool) -> Frame {
        self.extended = extended;
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Frame {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
