//! DBC-backed signal runtime.
//!
//! Loads a Vector DBC once at construction and keeps per-message signal
//! state: a current value map seeded from each signal's start value, a
//! length-one pending slot for incoming writes, alive-counter refresh and
//! E2E CRC stamping during encode. Parsing is delegated to the `can-dbc`
//! library; everything on top of the parsed model lives here.

pub mod codec;

use std::collections::HashMap;
use std::path::Path;

use can_dbc::DBC;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::crc::e2e_checksum;
use crate::{Error, FrameId, IntoFrameId, Result};

pub use codec::{ByteOrder, SignalSpec};

/// DBC transmission type of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendType {
    Cyclic,
    Event,
    Other,
}

/// Derived attributes steering the encode pipeline.
#[derive(Clone, Debug, Default)]
pub struct MessageAttrs {
    /// `GenMsgSendType == Cyclic`.
    pub periodic: bool,
    /// Message comment contains "Event".
    pub on_event: bool,
    /// Some signal name contains "AlvCnt".
    pub group: bool,
    pub alv_cnt_signal: Option<String>,
    /// Wrap modulus of the alive counter, `1 << bit_length`.
    pub alv_modulus: u64,
    pub crc_signal: Option<String>,
}

/// Static description of one DBC message.
#[derive(Clone, Debug)]
pub struct MessageSpec {
    pub frame_id: FrameId,
    pub name: String,
    pub length: usize,
    pub extended: bool,
    pub cycle_time_ms: Option<u64>,
    pub send_type: SendType,
    pub senders: Vec<String>,
    pub receivers: Vec<String>,
    pub signals: Vec<SignalSpec>,
    pub comment: String,
    pub attrs: MessageAttrs,
}

impl MessageSpec {
    pub fn signal(&self, name: &str) -> Option<&SignalSpec> {
        self.signals.iter().find(|s| s.name == name)
    }
}

#[derive(Default)]
struct RuntimeState {
    current: HashMap<String, HashMap<String, f64>>,
    /// Length-one pending slot per message; a push overwrites whatever
    /// was queued before.
    pending: HashMap<String, Option<HashMap<String, f64>>>,
}

/// Thread-safe signal-level view over one loaded DBC.
pub struct DbcRuntime {
    messages: HashMap<String, MessageSpec>,
    by_id: HashMap<FrameId, String>,
    nodes: HashMap<String, Vec<String>>,
    receivers: HashMap<String, Vec<String>>,
    initial: HashMap<String, HashMap<String, f64>>,
    state: Mutex<RuntimeState>,
}

impl DbcRuntime {
    pub fn from_path(path: impl AsRef<Path>) -> Result<DbcRuntime> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|e| Error::DbcLoad(format!("{}: {e}", path.as_ref().display())))?;
        DbcRuntime::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DbcRuntime> {
        let dbc = DBC::from_slice(bytes).map_err(|e| Error::DbcLoad(format!("{e:?}")))?;
        Ok(DbcRuntime::from_model(&dbc))
    }

    fn from_model(dbc: &DBC) -> DbcRuntime {
        let mut messages = HashMap::new();
        let mut by_id = HashMap::new();
        let mut nodes: HashMap<String, Vec<String>> = HashMap::new();
        let mut receivers: HashMap<String, Vec<String>> = HashMap::new();
        let mut initial = HashMap::new();
        let mut state = RuntimeState::default();

        for msg in dbc.messages() {
            let (raw_id, extended) = match msg.message_id() {
                can_dbc::MessageId::Standard(id) => (*id as u32, false),
                can_dbc::MessageId::Extended(id) => (*id, true),
            };
            let Ok(frame_id) = FrameId::new(raw_id) else {
                warn!(id = raw_id, "skipping message with out-of-range id");
                continue;
            };
            let name = msg.message_name().clone();

            let mut signals = Vec::new();
            let mut msg_receivers: Vec<String> = Vec::new();
            for sig in msg.signals() {
                let spec = SignalSpec {
                    name: sig.name().clone(),
                    start_bit: *sig.start_bit() as u16,
                    length: *sig.signal_size() as u16,
                    byte_order: match sig.byte_order() {
                        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
                        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
                    },
                    signed: matches!(sig.value_type(), can_dbc::ValueType::Signed),
                    float: is_float_signal(dbc, msg.message_id(), sig.name()),
                    factor: *sig.factor(),
                    offset: *sig.offset(),
                    minimum: bound(*sig.min(), *sig.max()).0,
                    maximum: bound(*sig.min(), *sig.max()).1,
                    unit: sig.unit().clone(),
                    initial_raw: signal_start_value(dbc, msg.message_id(), sig.name()),
                };
                for receiver in sig.receivers() {
                    if receiver != "Vector__XXX" && !msg_receivers.contains(receiver) {
                        msg_receivers.push(receiver.clone());
                    }
                }
                signals.push(spec);
            }

            // Group membership and CRC marking follow signal naming: an
            // "AlvCnt" signal makes the message a grouped one, a "Crc"
            // signal receives the E2E checksum.
            let mut attrs = MessageAttrs::default();
            for sig in &signals {
                if sig.name.contains("AlvCnt") {
                    attrs.group = true;
                    attrs.alv_cnt_signal = Some(sig.name.clone());
                    attrs.alv_modulus = 1u64 << sig.length.min(63);
                } else if sig.name.contains("Crc") {
                    attrs.crc_signal = Some(sig.name.clone());
                }
            }

            let comment = message_comment(dbc, msg.message_id());
            attrs.on_event = comment.contains("Event");

            let send_type = message_send_type(dbc, msg.message_id());
            attrs.periodic = send_type == SendType::Cyclic;

            let senders = match msg.transmitter() {
                can_dbc::Transmitter::NodeName(node) => vec![node.clone()],
                can_dbc::Transmitter::VectorXXX => Vec::new(),
            };
            for sender in &senders {
                nodes.entry(sender.clone()).or_default().push(name.clone());
            }
            for receiver in &msg_receivers {
                receivers.entry(receiver.clone()).or_default().push(name.clone());
            }

            let mut initial_signals = HashMap::new();
            for sig in &signals {
                initial_signals.insert(sig.name.clone(), sig.initial_physical());
            }
            initial.insert(name.clone(), initial_signals.clone());
            state.current.insert(name.clone(), initial_signals);
            state.pending.insert(name.clone(), None);

            let spec = MessageSpec {
                frame_id,
                name: name.clone(),
                length: *msg.message_size() as usize,
                extended,
                cycle_time_ms: message_cycle_time(dbc, msg.message_id()),
                send_type,
                senders,
                receivers: msg_receivers,
                signals,
                comment,
                attrs,
            };
            by_id.insert(frame_id, name.clone());
            messages.insert(name, spec);
        }

        DbcRuntime {
            messages,
            by_id,
            nodes,
            receivers,
            initial,
            state: Mutex::new(state),
        }
    }

    // ------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------

    /// Encode the current payload for a message id: apply the pending
    /// signal record, refresh the alive counter, encode, then stamp the
    /// CRC signal and re-encode. Deterministic for fixed signal state.
    pub fn get_payload(&self, id: impl IntoFrameId) -> Result<Vec<u8>> {
        let id = id.into_frame_id()?;
        let name = self
            .by_id
            .get(&id)
            .ok_or_else(|| Error::UnknownMessage(id.to_string()))?;
        let spec = &self.messages[name];

        let mut snapshot = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut alv_update = spec.attrs.group && !spec.attrs.on_event;
            if let Some(slot) = state.pending.get_mut(name) {
                if let Some(updates) = slot.take() {
                    if spec.attrs.group {
                        alv_update = true;
                    }
                    let current = state.current.get_mut(name).expect("message state");
                    current.extend(updates);
                }
            }
            if alv_update {
                if let Some(alv) = &spec.attrs.alv_cnt_signal {
                    let current = state.current.get_mut(name).expect("message state");
                    let next = ((current.get(alv).copied().unwrap_or(0.0) as u64 + 1)
                        % spec.attrs.alv_modulus) as f64;
                    current.insert(alv.clone(), next);
                }
            }
            state.current.get(name).expect("message state").clone()
        };

        // Encode outside the lock; the snapshot is ours.
        let mut payload = encode_signals(spec, &snapshot);

        if let Some(crc_name) = &spec.attrs.crc_signal {
            let crc = e2e_checksum(id.as_u32(), &payload) as f64;
            {
                let mut state = self.state.lock();
                if let Some(current) = state.current.get_mut(name) {
                    current.insert(crc_name.clone(), crc);
                }
            }
            snapshot.insert(crc_name.clone(), crc);
            payload = encode_signals(spec, &snapshot);
        }

        Ok(payload)
    }

    /// Queue a batch of signal writes for a message. Each value is
    /// clamped into the signal's bounds; unknown or non-finite entries
    /// are logged and skipped, the rest of the batch still applies. The
    /// batch replaces any previously queued one.
    pub fn push_signals(&self, message: &str, updates: &HashMap<String, f64>) -> Result<()> {
        let spec = self
            .messages
            .get(message)
            .ok_or_else(|| Error::UnknownMessage(message.to_string()))?;

        let mut record = HashMap::new();
        for (sig_name, value) in updates {
            match spec.signal(sig_name) {
                Some(sig) if value.is_finite() => {
                    record.insert(sig_name.clone(), sig.clamp_physical(*value));
                }
                Some(_) => {
                    error!(message, signal = %sig_name, "non-finite signal value skipped");
                }
                None => {
                    error!(message, signal = %sig_name, "unknown signal skipped");
                }
            }
        }

        let mut state = self.state.lock();
        state.pending.insert(message.to_string(), Some(record));
        Ok(())
    }

    /// Restore one message (or, without a name, every message) to its
    /// initial signal values and drop pending writes.
    pub fn reset_message(&self, message: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        match message {
            Some(name) => {
                let initial = self
                    .initial
                    .get(name)
                    .ok_or_else(|| Error::UnknownMessage(name.to_string()))?;
                state.current.insert(name.to_string(), initial.clone());
                state.pending.insert(name.to_string(), None);
            }
            None => {
                for (name, initial) in &self.initial {
                    state.current.insert(name.clone(), initial.clone());
                    state.pending.insert(name.clone(), None);
                }
            }
        }
        Ok(())
    }

    /// Decode a raw payload into physical signal values. Unknown ids and
    /// decode problems yield an empty map.
    pub fn decode_message(&self, id: impl IntoFrameId, data: &[u8]) -> HashMap<String, f64> {
        let Ok(id) = id.into_frame_id() else {
            return HashMap::new();
        };
        let Some(name) = self.by_id.get(&id) else {
            debug!(id = %id, "decode for id not in DBC");
            return HashMap::new();
        };
        let spec = &self.messages[name];
        spec.signals
            .iter()
            .map(|sig| (sig.name.clone(), sig.decode_from(data)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Model accessors
    // ------------------------------------------------------------------

    pub fn message_names(&self) -> Vec<String> {
        self.messages.keys().cloned().collect()
    }

    pub fn message_by_name(&self, name: &str) -> Option<&MessageSpec> {
        self.messages.get(name)
    }

    pub fn message_by_id(&self, id: impl IntoFrameId) -> Result<Option<&MessageSpec>> {
        let id = id.into_frame_id()?;
        Ok(self.by_id.get(&id).and_then(|name| self.messages.get(name)))
    }

    pub fn message_id_by_name(&self, name: &str) -> Result<FrameId> {
        self.messages
            .get(name)
            .map(|m| m.frame_id)
            .ok_or_else(|| Error::UnknownMessage(name.to_string()))
    }

    /// Current physical signal values of one message.
    pub fn current_signals(&self, name: &str) -> Result<HashMap<String, f64>> {
        let state = self.state.lock();
        state
            .current
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownMessage(name.to_string()))
    }

    /// Messages grouped by sending node.
    pub fn nodes(&self) -> &HashMap<String, Vec<String>> {
        &self.nodes
    }

    /// Messages grouped by receiving node.
    pub fn receivers(&self) -> &HashMap<String, Vec<String>> {
        &self.receivers
    }

    pub fn is_on_event(&self, name: &str) -> Result<bool> {
        self.messages
            .get(name)
            .map(|m| m.attrs.on_event)
            .ok_or_else(|| Error::UnknownMessage(name.to_string()))
    }
}

fn encode_signals(spec: &MessageSpec, signals: &HashMap<String, f64>) -> Vec<u8> {
    let mut payload = vec![0u8; spec.length];
    for sig in &spec.signals {
        let value = signals
            .get(&sig.name)
            .copied()
            .unwrap_or_else(|| sig.initial_physical());
        sig.encode_into(&mut payload, value);
    }
    payload
}

/// Vector DBC writes `[0|0]` when a signal carries no meaningful range.
fn bound(min: f64, max: f64) -> (Option<f64>, Option<f64>) {
    if min == 0.0 && max == 0.0 {
        (None, None)
    } else {
        (Some(min), Some(max))
    }
}

fn message_comment(dbc: &DBC, id: &can_dbc::MessageId) -> String {
    for comment in dbc.comments() {
        if let can_dbc::Comment::Message { message_id, comment } = comment {
            if message_id == id {
                return comment.clone();
            }
        }
    }
    String::new()
}

fn attribute_u64(value: &can_dbc::AttributeValue) -> Option<u64> {
    match value {
        can_dbc::AttributeValue::AttributeValueU64(v) => Some(*v),
        can_dbc::AttributeValue::AttributeValueI64(v) => u64::try_from(*v).ok(),
        can_dbc::AttributeValue::AttributeValueF64(v) if *v >= 0.0 => Some(*v as u64),
        _ => None,
    }
}

fn attribute_f64(value: &can_dbc::AttributeValue) -> Option<f64> {
    match value {
        can_dbc::AttributeValue::AttributeValueU64(v) => Some(*v as f64),
        can_dbc::AttributeValue::AttributeValueI64(v) => Some(*v as f64),
        can_dbc::AttributeValue::AttributeValueF64(v) => Some(*v),
        can_dbc::AttributeValue::AttributeValueCharString(_) => None,
    }
}

fn message_attribute<'a>(
    dbc: &'a DBC,
    id: &can_dbc::MessageId,
    name: &str,
) -> Option<&'a can_dbc::AttributeValue> {
    for attr in dbc.attribute_values() {
        if attr.attribute_name() != name {
            continue;
        }
        if let can_dbc::AttributeValuedForObjectType::MessageDefinitionAttributeValue(
            message_id,
            value,
        ) = attr.attribute_value()
        {
            if message_id == id {
                return value.as_ref();
            }
        }
    }
    attribute_default(dbc, name)
}

fn attribute_default<'a>(dbc: &'a DBC, name: &str) -> Option<&'a can_dbc::AttributeValue> {
    dbc.attribute_defaults()
        .iter()
        .find(|d| d.attribute_name() == name)
        .map(|d| d.attribute_value())
}

fn signal_start_value(dbc: &DBC, id: &can_dbc::MessageId, signal: &str) -> Option<f64> {
    for attr in dbc.attribute_values() {
        if attr.attribute_name() != "GenSigStartValue" {
            continue;
        }
        if let can_dbc::AttributeValuedForObjectType::SignalAttributeValue(
            message_id,
            signal_name,
            value,
        ) = attr.attribute_value()
        {
            if message_id == id && signal_name == signal {
                return attribute_f64(value);
            }
        }
    }
    None
}

fn message_cycle_time(dbc: &DBC, id: &can_dbc::MessageId) -> Option<u64> {
    message_attribute(dbc, id, "GenMsgCycleTime")
        .and_then(attribute_u64)
        .filter(|ms| *ms > 0)
}

fn message_send_type(dbc: &DBC, id: &can_dbc::MessageId) -> SendType {
    match message_attribute(dbc, id, "GenMsgSendType") {
        Some(can_dbc::AttributeValue::AttributeValueCharString(s)) => {
            if s.eq_ignore_ascii_case("cyclic") {
                SendType::Cyclic
            } else if s.to_ascii_lowercase().contains("event") {
                SendType::Event
            } else {
                SendType::Other
            }
        }
        Some(_) => {
            debug!("non-string GenMsgSendType encoding, treating as Other");
            SendType::Other
        }
        None => SendType::Other,
    }
}

fn is_float_signal(dbc: &DBC, id: &can_dbc::MessageId, signal: &str) -> bool {
    dbc.signal_extended_value_type_list().iter().any(|entry| {
        entry.message_id() == id
            && entry.signal_name() == signal
            && !matches!(
                entry.signal_extended_value_type(),
                can_dbc::SignalExtendedValueType::SignedOrUnsignedInteger
            )
    })
}

#[cfg(test)]
pub(crate) mod testdbc {
    // 0x7B3 == 1971, 0x123 == 291, 0x321 == 801.
    pub(crate) const SAMPLE_DBC: &str = r#"VERSION ""


NS_ :

BS_:

BU_: ECU TESTER

BO_ 1971 EngineData: 8 ECU
 SG_ EngCrc : 0|16@1+ (1,0) [0|65535] ""  TESTER
 SG_ EngSpeed : 16|16@1+ (0.25,0) [0|8000] "rpm"  TESTER
 SG_ EngTemp : 32|8@1+ (1,-40) [-40|215] "degC"  TESTER
 SG_ EngAlvCnt : 40|8@1+ (1,0) [0|255] ""  TESTER

BO_ 291 ClimateCmd: 8 TESTER
 SG_ FanLevel : 0|4@1+ (1,0) [0|7] ""  ECU

BO_ 801 ChassisStatus: 8 ECU
 SG_ ChsCrc : 0|16@1+ (1,0) [0|65535] ""  TESTER
 SG_ WheelSpeed : 16|16@1+ (0.01,0) [0|655.35] "kph"  TESTER

CM_ BO_ 291 "Event triggered fan command";
BA_DEF_ BO_  "GenMsgCycleTime" INT 0 10000;
BA_DEF_ BO_  "GenMsgSendType" STRING ;
BA_DEF_ SG_  "GenSigStartValue" INT 0 100000;
BA_DEF_DEF_  "GenMsgCycleTime" 100;
BA_DEF_DEF_  "GenMsgSendType" "Cyclic";
BA_DEF_DEF_  "GenSigStartValue" 0;
BA_ "GenMsgCycleTime" BO_ 1971 50;
BA_ "GenSigStartValue" SG_ 1971 EngSpeed 400;
"#;
}
