//! # Frame Codec
//!
//! Stateless translation between reader bytes and typed messages.
//!
//! ## Wire Frame
//! ```text
//! ┌──────┬──────┬─────────┬─────────┬──────────────────┬──────────┐
//! │ sync │ len  │ address │ command │ data (len-3 B)   │ checksum │
//! │ 0xA0 │  1B  │   1B    │   1B    │                  │    1B    │
//! └──────┴──────┴─────────┴─────────┴──────────────────┴──────────┘
//!          │                                                 ▲
//!          └─ bytes after `len`, checksum included            │
//!                                                             │
//!   checksum = two's complement of the byte sum sync..data ───┘
//! ```
//!
//! ## Inbound Messages
//! ```text
//! ┌──────────┬─────────────────────────────────────┬──────────────────────┐
//! │ Command  │ Data                                │ Message              │
//! ├──────────┼─────────────────────────────────────┼──────────────────────┤
//! │ 0x8A     │ [status]                            │ CommandAck           │
//! │ 0x8A     │ [antenna][error code]               │ Error (ReaderFault)  │
//! │ 0x8A     │ [reads: u24][duration ms: u32]      │ InventoryRound       │
//! │ 0x8A     │ [freq<<2|ant][PC:2][EPC...][RSSI]   │ TagRead              │
//! │ 0x62     │ [sensor 1|2][edge 1=rising 0=fall]  │ SensorEdge           │
//! │ others   │ [status]                            │ CommandAck           │
//! └──────────┴─────────────────────────────────────┴──────────────────────┘
//! ```
//!
//! ## Resync
//! `decode` never fails hard. A framing error (bad length, bad checksum)
//! consumes exactly one byte so the caller can retry from the next candidate
//! sync byte; noise before a sync byte is skipped in one step.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, ValidationError};
use crate::types::{
    AntennaId, AntennaMask, Edge, FrequencyRegion, GpioPin, PowerDbm, RfProfile, Rssi, SensorEdge,
    SensorId, Session, TagIdentity, Target,
};
use crate::{validation, MAX_EPC_BYTES, STATUS_SUCCESS};

// =============================================================================
// Command Codes
// =============================================================================

/// Command bytes understood by the codec.
///
/// `SET_SESSION`, `SET_TARGET` and `STOP_INVENTORY` are vendor assignments
/// that should be confirmed against the datasheet of the target reader.
pub mod opcode {
    pub const WRITE_GPIO: u8 = 0x61;
    pub const SENSOR_REPORT: u8 = 0x62;
    pub const SET_RF_PROFILE: u8 = 0x69;
    pub const SET_SESSION: u8 = 0x6C;
    pub const SET_TARGET: u8 = 0x6D;
    pub const SET_OUTPUT_POWER: u8 = 0x76;
    pub const SET_FREQUENCY_REGION: u8 = 0x78;
    pub const FAST_SWITCH_INVENTORY: u8 = 0x8A;
    pub const STOP_INVENTORY: u8 = 0x8C;

    /// Commands the reader answers with a single status byte.
    pub const ACKNOWLEDGED: [u8; 8] = [
        WRITE_GPIO,
        SET_RF_PROFILE,
        SET_SESSION,
        SET_TARGET,
        SET_OUTPUT_POWER,
        SET_FREQUENCY_REGION,
        FAST_SWITCH_INVENTORY,
        STOP_INVENTORY,
    ];
}

/// Frame overhead outside `data`: sync, len, address, command, checksum.
const FRAME_OVERHEAD: usize = 5;

/// Largest `data` that fits a one-byte length field.
pub const MAX_DATA_LEN: usize = u8::MAX as usize - 3;

/// Length byte of the longest modelled frame: a tag read carrying a
/// full-size EPC (address, command, antenna/frequency, PC, EPC, RSSI, checksum).
pub const MAX_FRAME_LENGTH: u8 = (MAX_EPC_BYTES + 7) as u8;

// =============================================================================
// Frame Format
// =============================================================================

/// Checksum algorithm over `sync..data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// `(!sum).wrapping_add(1)`, the R2000-family default.
    #[default]
    TwosComplement,
    /// Plain 8-bit sum.
    Sum,
    /// XOR of every byte.
    Xor,
}

impl ChecksumKind {
    pub fn compute(self, bytes: &[u8]) -> u8 {
        match self {
            ChecksumKind::TwosComplement => {
                let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
                (!sum).wrapping_add(1)
            }
            ChecksumKind::Sum => bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)),
            ChecksumKind::Xor => bytes.iter().fold(0u8, |acc, b| acc ^ b),
        }
    }
}

/// Framing parameters. Readers outside the R2000 family differ in sync byte
/// and checksum, so neither is hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    #[serde(default = "default_sync_byte")]
    pub sync_byte: u8,
    #[serde(default)]
    pub checksum: ChecksumKind,
    /// Largest length byte accepted. A stray sync byte followed by a larger
    /// value is rejected at once instead of stalling the decoder until that
    /// many bytes have arrived.
    #[serde(default = "default_max_length")]
    pub max_length: u8,
}

fn default_sync_byte() -> u8 {
    0xA0
}

fn default_max_length() -> u8 {
    MAX_FRAME_LENGTH
}

impl Default for FrameFormat {
    fn default() -> Self {
        FrameFormat {
            sync_byte: default_sync_byte(),
            checksum: ChecksumKind::default(),
            max_length: default_max_length(),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// One tag observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRead {
    pub antenna: AntennaId,
    /// Protocol-control word; the top five bits give the EPC length in words.
    pub pc: u16,
    pub epc: TagIdentity,
    pub rssi: Rssi,
    /// Hopping channel index (0..=63).
    pub frequency_code: u8,
}

/// Summary closing one fast-switch inventory round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryRound {
    /// Tag reads during the round (24-bit on the wire).
    pub total_reads: u32,
    pub duration_ms: u32,
}

/// Status reply to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub command: u8,
    pub status: u8,
}

impl CommandAck {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Error reported by the reader while running a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderFault {
    pub command: u8,
    pub antenna: AntennaId,
    pub code: u8,
}

/// Typed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    TagRead(TagRead),
    SensorEdge(SensorEdge),
    CommandAck(CommandAck),
    InventoryRound(InventoryRound),
    Error(ReaderFault),
}

impl Message {
    /// Only tag reads may be discarded under back-pressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Message::TagRead(_))
    }

    /// Command this message answers, if it is a command reply.
    pub fn reply_to(&self) -> Option<u8> {
        match self {
            Message::CommandAck(ack) => Some(ack.command),
            Message::InventoryRound(_) => Some(opcode::FAST_SWITCH_INVENTORY),
            Message::Error(fault) => Some(fault.command),
            Message::TagRead(_) | Message::SensorEdge(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::TagRead(_) => "tag_read",
            Message::SensorEdge(_) => "sensor_edge",
            Message::CommandAck(_) => "command_ack",
            Message::InventoryRound(_) => "inventory_round",
            Message::Error(_) => "error",
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Outbound reader command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetPower(PowerDbm),
    /// Per-antenna power, antennas 1..4 in order.
    SetAntennaPower([PowerDbm; 4]),
    SetRegion(FrequencyRegion),
    SetProfile(RfProfile),
    SetSession(Session),
    SetTarget(Target),
    /// Runs one fast-switch round over the enabled antennas.
    StartInventory(AntennaMask),
    StopInventory,
    GpioWrite { pin: GpioPin, level: bool },
}

impl Command {
    /// Command byte on the wire.
    pub fn code(&self) -> u8 {
        match self {
            Command::SetPower(_) | Command::SetAntennaPower(_) => opcode::SET_OUTPUT_POWER,
            Command::SetRegion(_) => opcode::SET_FREQUENCY_REGION,
            Command::SetProfile(_) => opcode::SET_RF_PROFILE,
            Command::SetSession(_) => opcode::SET_SESSION,
            Command::SetTarget(_) => opcode::SET_TARGET,
            Command::StartInventory(_) => opcode::FAST_SWITCH_INVENTORY,
            Command::StopInventory => opcode::STOP_INVENTORY,
            Command::GpioWrite { .. } => opcode::WRITE_GPIO,
        }
    }

    /// Command data bytes.
    pub fn payload(&self) -> Result<Vec<u8>, ValidationError> {
        let data = match self {
            Command::SetPower(dbm) => vec![dbm.get()],
            Command::SetAntennaPower(levels) => levels.iter().map(|p| p.get()).collect(),
            Command::SetRegion(region) => {
                if let FrequencyRegion::Manual { start, end } = region {
                    validation::validate_channel_range(*start, *end)?;
                }
                let (code, start, end) = region.wire_params();
                vec![code, start, end]
            }
            Command::SetProfile(profile) => vec![profile.wire_code()],
            Command::SetSession(session) => vec![session.code()],
            Command::SetTarget(target) => vec![target.code()],
            Command::StartInventory(mask) => {
                // [antenna index, enabled] for all four ports, then two reserved bytes.
                let mut data = Vec::with_capacity(10);
                for ant in AntennaId::ALL {
                    data.push(ant.index() as u8);
                    data.push(mask.contains(ant) as u8);
                }
                data.extend_from_slice(&[0x00, 0x00]);
                data
            }
            Command::StopInventory => Vec::new(),
            Command::GpioWrite { pin, level } => vec![pin.get(), *level as u8],
        };
        Ok(data)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetPower(p) => write!(f, "SetPower({} dBm)", p.get()),
            Command::SetAntennaPower(p) => write!(
                f,
                "SetAntennaPower({}/{}/{}/{} dBm)",
                p[0].get(),
                p[1].get(),
                p[2].get(),
                p[3].get()
            ),
            Command::SetRegion(r) => write!(f, "SetRegion({})", r),
            Command::SetProfile(p) => write!(f, "SetProfile({})", p.get()),
            Command::SetSession(s) => write!(f, "SetSession({})", s),
            Command::SetTarget(t) => write!(f, "SetTarget({})", t),
            Command::StartInventory(mask) => write!(f, "StartInventory({})", mask),
            Command::StopInventory => write!(f, "StopInventory"),
            Command::GpioWrite { pin, level } => {
                write!(f, "GpioWrite(pin {} = {})", pin.get(), *level as u8)
            }
        }
    }
}

// =============================================================================
// Decode Result
// =============================================================================

/// Outcome of one `decode` call: the typed form of
/// `(Option<Message>, consumed_bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame carrying a modelled message.
    Frame { message: Message, consumed: usize },
    /// A complete, valid frame for a command the codec does not model.
    Unsupported { command: u8, consumed: usize },
    /// More bytes are needed. Nothing is consumed.
    Incomplete,
    /// Bytes that do not form a valid frame.
    Invalid { error: DecodeError, consumed: usize },
}

impl Decoded {
    pub fn message(&self) -> Option<&Message> {
        match self {
            Decoded::Frame { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Decoded::Frame { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Bytes the caller should drop from the front of its buffer.
    pub fn consumed(&self) -> usize {
        match self {
            Decoded::Frame { consumed, .. }
            | Decoded::Unsupported { consumed, .. }
            | Decoded::Invalid { consumed, .. } => *consumed,
            Decoded::Incomplete => 0,
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Encoder/decoder for one frame format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCodec {
    format: FrameFormat,
}

impl FrameCodec {
    pub fn new(format: FrameFormat) -> Self {
        FrameCodec { format }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Decodes at most one frame from the front of `buffer`.
    pub fn decode(&self, buffer: &[u8]) -> Decoded {
        let sync = self.format.sync_byte;

        let Some(&first) = buffer.first() else {
            return Decoded::Incomplete;
        };
        if first != sync {
            let skipped = buffer
                .iter()
                .position(|b| *b == sync)
                .unwrap_or(buffer.len());
            return Decoded::Invalid {
                error: DecodeError::MissingSync { skipped },
                consumed: skipped,
            };
        }

        let Some(&len) = buffer.get(1) else {
            return Decoded::Incomplete;
        };
        if len < 3 || len > self.format.max_length {
            return Decoded::Invalid {
                error: DecodeError::BadLength { declared: len },
                consumed: 1,
            };
        }

        let total = len as usize + 2;
        if buffer.len() < total {
            return Decoded::Incomplete;
        }

        let frame = &buffer[..total];
        let expected = self.format.checksum.compute(&frame[..total - 1]);
        let actual = frame[total - 1];
        if expected != actual {
            return Decoded::Invalid {
                error: DecodeError::ChecksumMismatch { expected, actual },
                consumed: 1,
            };
        }

        let command = frame[3];
        let data = &frame[4..total - 1];
        match parse_message(command, data) {
            Ok(Some(message)) => Decoded::Frame {
                message,
                consumed: total,
            },
            Ok(None) => Decoded::Unsupported {
                command,
                consumed: total,
            },
            Err(error) => Decoded::Invalid {
                error,
                consumed: total,
            },
        }
    }

    /// Serialises an outbound command.
    pub fn encode(&self, command: &Command, address: u8) -> Result<Vec<u8>, ValidationError> {
        let data = command.payload()?;
        self.frame(address, command.code(), &data)
    }

    /// Serialises an inbound message the way a reader would send it.
    pub fn encode_message(&self, message: &Message, address: u8) -> Result<Vec<u8>, ValidationError> {
        let (command, data) = message_payload(message)?;
        self.frame(address, command, &data)
    }

    /// Wraps `data` in sync, length, address, command and checksum.
    pub fn frame(&self, address: u8, command: u8, data: &[u8]) -> Result<Vec<u8>, ValidationError> {
        if data.len() > MAX_DATA_LEN {
            return Err(ValidationError::out_of_range(
                "frame data length",
                0,
                MAX_DATA_LEN as i64,
                data.len() as i64,
            ));
        }
        let mut bytes = Vec::with_capacity(data.len() + FRAME_OVERHEAD);
        bytes.push(self.format.sync_byte);
        bytes.push((data.len() + 3) as u8);
        bytes.push(address);
        bytes.push(command);
        bytes.extend_from_slice(data);
        bytes.push(self.format.checksum.compute(&bytes));
        Ok(bytes)
    }
}

// =============================================================================
// Payload Layouts
// =============================================================================

fn malformed(command: u8, reason: impl Into<String>) -> DecodeError {
    DecodeError::Malformed {
        command,
        reason: reason.into(),
    }
}

fn parse_message(command: u8, data: &[u8]) -> Result<Option<Message>, DecodeError> {
    match command {
        opcode::FAST_SWITCH_INVENTORY => parse_inventory(command, data).map(Some),
        opcode::SENSOR_REPORT => parse_sensor_edge(command, data).map(Some),
        c if opcode::ACKNOWLEDGED.contains(&c) && data.len() == 1 => {
            Ok(Some(Message::CommandAck(CommandAck {
                command,
                status: data[0],
            })))
        }
        _ => Ok(None),
    }
}

fn parse_inventory(command: u8, data: &[u8]) -> Result<Message, DecodeError> {
    match data.len() {
        1 => Ok(Message::CommandAck(CommandAck {
            command,
            status: data[0],
        })),
        2 => {
            let antenna = AntennaId::from_index(data[0])
                .map_err(|e| malformed(command, format!("fault antenna: {}", e)))?;
            Ok(Message::Error(ReaderFault {
                command,
                antenna,
                code: data[1],
            }))
        }
        7 => Ok(Message::InventoryRound(InventoryRound {
            total_reads: u32::from_be_bytes([0, data[0], data[1], data[2]]),
            duration_ms: u32::from_be_bytes([data[3], data[4], data[5], data[6]]),
        })),
        n if n >= 5 => parse_tag(command, data),
        n => Err(malformed(command, format!("unexpected data length {}", n))),
    }
}

fn parse_tag(command: u8, data: &[u8]) -> Result<Message, DecodeError> {
    let last = data.len() - 1;
    let epc = &data[3..last];
    if epc.len() % 2 != 0 {
        return Err(malformed(command, "EPC is not word aligned"));
    }
    let epc = TagIdentity::new(epc.to_vec()).map_err(|e| malformed(command, e.to_string()))?;
    let antenna =
        AntennaId::from_index(data[0] & 0x03).map_err(|e| malformed(command, e.to_string()))?;

    Ok(Message::TagRead(TagRead {
        antenna,
        pc: u16::from_be_bytes([data[1], data[2]]),
        epc,
        rssi: Rssi::from_raw(data[last]),
        frequency_code: data[0] >> 2,
    }))
}

fn parse_sensor_edge(command: u8, data: &[u8]) -> Result<Message, DecodeError> {
    if data.len() != 2 {
        return Err(malformed(
            command,
            format!("sensor report needs 2 bytes, got {}", data.len()),
        ));
    }
    let sensor = SensorId::try_from(data[0]).map_err(|e| malformed(command, e.to_string()))?;
    let edge = match data[1] {
        0 => Edge::Falling,
        1 => Edge::Rising,
        other => return Err(malformed(command, format!("unknown edge code {}", other))),
    };
    Ok(Message::SensorEdge(SensorEdge { sensor, edge }))
}

fn message_payload(message: &Message) -> Result<(u8, Vec<u8>), ValidationError> {
    match message {
        Message::TagRead(tag) => {
            if tag.epc.len() % 2 != 0 {
                return Err(ValidationError::InvalidFormat {
                    field: "epc".into(),
                    reason: "EPC must be a whole number of 16-bit words".into(),
                });
            }
            if tag.frequency_code > 0x3F {
                return Err(ValidationError::out_of_range(
                    "frequency_code",
                    0,
                    0x3F,
                    tag.frequency_code as i64,
                ));
            }
            let mut data = Vec::with_capacity(tag.epc.len() + 4);
            data.push((tag.frequency_code << 2) | tag.antenna.index() as u8);
            data.extend_from_slice(&tag.pc.to_be_bytes());
            data.extend_from_slice(tag.epc.as_bytes());
            data.push(tag.rssi.raw());
            Ok((opcode::FAST_SWITCH_INVENTORY, data))
        }
        Message::SensorEdge(edge) => {
            let level = matches!(edge.edge, Edge::Rising) as u8;
            Ok((opcode::SENSOR_REPORT, vec![edge.sensor.number(), level]))
        }
        Message::CommandAck(ack) => {
            if !opcode::ACKNOWLEDGED.contains(&ack.command) {
                return Err(ValidationError::InvalidFormat {
                    field: "command".into(),
                    reason: format!("0x{:02X} has no status reply", ack.command),
                });
            }
            Ok((ack.command, vec![ack.status]))
        }
        Message::InventoryRound(round) => {
            if round.total_reads > 0x00FF_FFFF {
                return Err(ValidationError::out_of_range(
                    "total_reads",
                    0,
                    0x00FF_FFFF,
                    round.total_reads as i64,
                ));
            }
            let mut data = round.total_reads.to_be_bytes()[1..].to_vec();
            data.extend_from_slice(&round.duration_ms.to_be_bytes());
            Ok((opcode::FAST_SWITCH_INVENTORY, data))
        }
        Message::Error(fault) => {
            if fault.command != opcode::FAST_SWITCH_INVENTORY {
                return Err(ValidationError::InvalidFormat {
                    field: "command".into(),
                    reason: format!("0x{:02X} does not report faults", fault.command),
                });
            }
            Ok((fault.command, vec![fault.antenna.index() as u8, fault.code]))
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: u8 = 0x01;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    fn sample_tag() -> TagRead {
        TagRead {
            antenna: AntennaId::TWO,
            pc: 0x3000,
            epc: "E28011606000020A1B2C3D4E".parse().unwrap(),
            rssi: Rssi::from_dbm(-49),
            frequency_code: 17,
        }
    }

    fn all_messages() -> Vec<Message> {
        vec![
            Message::TagRead(sample_tag()),
            Message::SensorEdge(SensorEdge::rising(SensorId::One)),
            Message::SensorEdge(SensorEdge::falling(SensorId::Two)),
            Message::CommandAck(CommandAck {
                command: opcode::SET_OUTPUT_POWER,
                status: STATUS_SUCCESS,
            }),
            Message::CommandAck(CommandAck {
                command: opcode::FAST_SWITCH_INVENTORY,
                status: 0x22,
            }),
            Message::InventoryRound(InventoryRound {
                total_reads: 0x01_02_03,
                duration_ms: 57,
            }),
            Message::Error(ReaderFault {
                command: opcode::FAST_SWITCH_INVENTORY,
                antenna: AntennaId::FOUR,
                code: 0x22,
            }),
        ]
    }

    #[test]
    fn test_checksum_matches_reader_example() {
        // Datasheet example: real-time inventory "A0 04 01 89 01 D1".
        let frame = codec().frame(0x01, 0x89, &[0x01]).unwrap();
        assert_eq!(frame, vec![0xA0, 0x04, 0x01, 0x89, 0x01, 0xD1]);
    }

    #[test]
    fn test_checksum_kinds() {
        let bytes = [0xA0, 0x03, 0x01, 0x72];
        assert_eq!(ChecksumKind::TwosComplement.compute(&bytes), 0xEA);
        assert_eq!(ChecksumKind::Sum.compute(&bytes), 0x16);
        assert_eq!(ChecksumKind::Xor.compute(&bytes), 0xA0 ^ 0x03 ^ 0x01 ^ 0x72);
    }

    #[test]
    fn test_round_trip_every_message() {
        let codec = codec();
        for message in all_messages() {
            let bytes = codec.encode_message(&message, ADDR).unwrap();
            match codec.decode(&bytes) {
                Decoded::Frame {
                    message: decoded,
                    consumed,
                } => {
                    assert_eq!(decoded, message);
                    assert_eq!(consumed, bytes.len());
                }
                other => panic!("{:?} decoded as {:?}", message, other),
            }
        }
    }

    #[test]
    fn test_round_trip_with_alternate_format() {
        let codec = FrameCodec::new(FrameFormat {
            sync_byte: 0xBB,
            checksum: ChecksumKind::Xor,
            ..FrameFormat::default()
        });
        let message = Message::TagRead(sample_tag());
        let bytes = codec.encode_message(&message, ADDR).unwrap();
        assert_eq!(bytes[0], 0xBB);
        assert_eq!(codec.decode(&bytes).into_message(), Some(message));
    }

    #[test]
    fn test_corrupted_payload_consumes_one_byte() {
        let codec = codec();
        for message in all_messages() {
            let mut bytes = codec.encode_message(&message, ADDR).unwrap();
            let payload_index = 4;
            bytes[payload_index] ^= 0x5A;

            let decoded = codec.decode(&bytes);
            assert!(decoded.message().is_none());
            assert_eq!(decoded.consumed(), 1);
            assert!(matches!(
                decoded,
                Decoded::Invalid {
                    error: DecodeError::ChecksumMismatch { .. },
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_tag_read_layout() {
        let mut data = vec![(17 << 2) | 0x01, 0x30, 0x00];
        data.extend_from_slice(&[0xE2, 0x80, 0x11, 0x60, 0x60, 0x00, 0x02, 0x0A, 0x1B, 0x2C, 0x3D, 0x4E]);
        data.push(80);
        let frame = codec()
            .frame(ADDR, opcode::FAST_SWITCH_INVENTORY, &data)
            .unwrap();

        let Some(Message::TagRead(tag)) = codec().decode(&frame).into_message() else {
            panic!("expected tag read");
        };
        assert_eq!(tag.antenna, AntennaId::TWO);
        assert_eq!(tag.frequency_code, 17);
        assert_eq!(tag.epc.to_string(), "E28011606000020A1B2C3D4E");
        assert_eq!(tag.rssi.dbm(), -49);
    }

    #[test]
    fn test_incomplete_consumes_nothing() {
        let codec = codec();
        let bytes = codec
            .encode_message(&Message::TagRead(sample_tag()), ADDR)
            .unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(codec.decode(&bytes[..cut]), Decoded::Incomplete, "cut {}", cut);
        }
    }

    #[test]
    fn test_leading_garbage_is_skipped() {
        let codec = codec();
        let mut bytes = vec![0x00, 0x13, 0x37];
        let frame = codec
            .encode_message(&Message::SensorEdge(SensorEdge::rising(SensorId::One)), ADDR)
            .unwrap();
        bytes.extend_from_slice(&frame);

        let first = codec.decode(&bytes);
        assert_eq!(
            first,
            Decoded::Invalid {
                error: DecodeError::MissingSync { skipped: 3 },
                consumed: 3
            }
        );
        let second = codec.decode(&bytes[first.consumed()..]);
        assert_eq!(
            second.message(),
            Some(&Message::SensorEdge(SensorEdge::rising(SensorId::One)))
        );
    }

    #[test]
    fn test_bad_length_consumes_one_byte() {
        let decoded = codec().decode(&[0xA0, 0x02, 0x01, 0x8A, 0x00]);
        assert_eq!(
            decoded,
            Decoded::Invalid {
                error: DecodeError::BadLength { declared: 2 },
                consumed: 1
            }
        );
    }

    #[test]
    fn test_oversized_length_does_not_stall_reply() {
        let codec = codec();
        // Line noise: a stray sync byte with a huge length, then a real ack.
        let mut bytes = vec![0xA0, 0xF0];
        let ack = Message::CommandAck(CommandAck {
            command: opcode::SET_OUTPUT_POWER,
            status: STATUS_SUCCESS,
        });
        bytes.extend(codec.encode_message(&ack, ADDR).unwrap());

        let first = codec.decode(&bytes);
        assert_eq!(
            first,
            Decoded::Invalid {
                error: DecodeError::BadLength { declared: 0xF0 },
                consumed: 1
            }
        );
        let second = codec.decode(&bytes[1..]);
        assert_eq!(second.consumed(), 1);
        assert_eq!(codec.decode(&bytes[2..]).into_message(), Some(ack));
    }

    #[test]
    fn test_longest_tag_read_fits_length_cap() {
        let codec = codec();
        let mut tag = sample_tag();
        tag.epc = TagIdentity::new(vec![0xAB; MAX_EPC_BYTES]).unwrap();
        let bytes = codec.encode_message(&Message::TagRead(tag.clone()), ADDR).unwrap();
        assert_eq!(bytes[1], MAX_FRAME_LENGTH);
        assert_eq!(codec.decode(&bytes).into_message(), Some(Message::TagRead(tag)));
    }

    #[test]
    fn test_back_to_back_frames() {
        let codec = codec();
        let mut stream = Vec::new();
        for message in all_messages() {
            stream.extend(codec.encode_message(&message, ADDR).unwrap());
        }

        let mut decoded = Vec::new();
        let mut offset = 0;
        while offset < stream.len() {
            let result = codec.decode(&stream[offset..]);
            assert!(result.consumed() > 0);
            offset += result.consumed();
            decoded.extend(result.into_message());
        }
        assert_eq!(decoded, all_messages());
    }

    #[test]
    fn test_unsupported_frame_is_consumed_whole() {
        let codec = codec();
        let firmware_reply = codec.frame(ADDR, 0x72, &[0x01, 0x07]).unwrap();
        assert_eq!(
            codec.decode(&firmware_reply),
            Decoded::Unsupported {
                command: 0x72,
                consumed: firmware_reply.len()
            }
        );
    }

    #[test]
    fn test_out_of_range_ids_are_malformed() {
        let codec = codec();
        for data in [[3u8, 1u8], [0, 1], [1, 7]] {
            let frame = codec.frame(ADDR, opcode::SENSOR_REPORT, &data).unwrap();
            let decoded = codec.decode(&frame);
            assert!(matches!(
                decoded,
                Decoded::Invalid {
                    error: DecodeError::Malformed { .. },
                    ..
                }
            ));
            assert_eq!(decoded.consumed(), frame.len());
        }

        let fault = codec
            .frame(ADDR, opcode::FAST_SWITCH_INVENTORY, &[0x09, 0x22])
            .unwrap();
        assert!(codec.decode(&fault).message().is_none());
    }

    #[test]
    fn test_encode_commands() {
        let codec = codec();
        let power = codec
            .encode(&Command::SetPower(PowerDbm::try_from(30).unwrap()), 0xFF)
            .unwrap();
        assert_eq!(&power[..5], &[0xA0, 0x04, 0xFF, 0x76, 30]);

        let region = codec.encode(&Command::SetRegion(FrequencyRegion::Us), 0xFF).unwrap();
        assert_eq!(&region[3..7], &[0x78, 0x01, 0x07, 0x3B]);

        let profile = codec
            .encode(&Command::SetProfile(RfProfile::try_from(2).unwrap()), 0xFF)
            .unwrap();
        assert_eq!(profile[4], 0xD2);

        let stop = codec.encode(&Command::StopInventory, 0xFF).unwrap();
        assert_eq!(stop.len(), 5);
        assert_eq!(stop[1], 0x03);
    }

    #[test]
    fn test_start_inventory_payload() {
        let mask = AntennaMask::new([AntennaId::ONE, AntennaId::TWO]).unwrap();
        let data = Command::StartInventory(mask).payload().unwrap();
        assert_eq!(data, vec![0, 1, 1, 1, 2, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn test_invalid_manual_region_is_rejected() {
        let cmd = Command::SetRegion(FrequencyRegion::Manual { start: 9, end: 3 });
        assert!(codec().encode(&cmd, 0xFF).is_err());
    }

    #[test]
    fn test_unencodable_messages() {
        let codec = codec();
        let ack = Message::CommandAck(CommandAck {
            command: 0x72,
            status: STATUS_SUCCESS,
        });
        assert!(codec.encode_message(&ack, ADDR).is_err());

        let mut tag = sample_tag();
        tag.epc = TagIdentity::new(vec![1, 2, 3]).unwrap();
        assert!(codec.encode_message(&Message::TagRead(tag), ADDR).is_err());
    }

    #[test]
    fn test_reply_routing() {
        let round = Message::InventoryRound(InventoryRound {
            total_reads: 1,
            duration_ms: 1,
        });
        assert_eq!(round.reply_to(), Some(opcode::FAST_SWITCH_INVENTORY));
        assert!(Message::TagRead(sample_tag()).is_droppable());
        assert!(!round.is_droppable());
        assert_eq!(Message::TagRead(sample_tag()).reply_to(), None);
    }
}
