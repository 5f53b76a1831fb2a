//! Decoded frame and marker types for the Luos bus
//!
//! A [`Frame`] is the unit of decoded output: one protocol field, its raw
//! integer value and the sample span it was read from. [`Marker`]s are a
//! visualization side channel (per-bit dots, error overlays, ack-window
//! brackets) and are never read back by the decoder.

use crate::error::{DecodeError, Result};

/// Monitored line a marker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelId {
    /// Tx line (the only line in one-wire mode)
    Tx,
    /// Rx line (dual-channel mode only)
    Rx,
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelId::Tx => write!(f, "Tx"),
            ChannelId::Rx => write!(f, "Rx"),
        }
    }
}

/// Field a decoded frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldKind {
    /// 4-bit protocol revision nibble
    Protocol,
    /// 12-bit target id
    Target,
    /// 4-bit addressing mode
    TargetMode,
    /// 12-bit source id
    Source,
    /// 8-bit command
    Cmd,
    /// 16-bit payload size in bytes
    Size,
    /// One 8-bit payload byte, with its 0-based index
    Data(u16),
    /// 16-bit checksum matching the running computation
    Crc,
    /// 16-bit checksum that failed verification
    CrcInvalid,
    /// 8-bit acknowledgement byte
    Ack,
}

impl FieldKind {
    /// Number of wire bits the field occupies
    pub fn bit_width(&self) -> u32 {
        match self {
            FieldKind::Protocol | FieldKind::TargetMode => 4,
            FieldKind::Target | FieldKind::Source => 12,
            FieldKind::Cmd | FieldKind::Data(_) | FieldKind::Ack => 8,
            FieldKind::Size | FieldKind::Crc | FieldKind::CrcInvalid => 16,
        }
    }

    /// Display name of the field
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Protocol => "PROTOCOL",
            FieldKind::Target => "TARGET",
            FieldKind::TargetMode => "TARGET MODE",
            FieldKind::Source => "SOURCE",
            FieldKind::Cmd => "CMD",
            FieldKind::Size => "SIZE",
            FieldKind::Data(_) => "DATA",
            FieldKind::Crc | FieldKind::CrcInvalid => "CRC",
            FieldKind::Ack => "ACK",
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One decoded protocol field
///
/// Constructed once per completed state-machine step and appended to the
/// output sequence immediately; never mutated after emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// Which field this is
    pub kind: FieldKind,
    /// Raw field value, LSB-first reassembled (4 to 16 significant bits)
    pub value: u32,
    /// First sample of the field on the controlling channel, inclusive
    pub start_sample: u64,
    /// Last sample of the field on the controlling channel, inclusive
    pub end_sample: u64,
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FieldKind::Data(idx) => write!(f, "DATA[{}] = {}", idx, self.value),
            FieldKind::Crc => write!(f, "CRC = {:#06X} - GOOD", self.value),
            FieldKind::CrcInvalid => write!(f, "CRC = {:#06X} - NOT GOOD", self.value),
            FieldKind::TargetMode => match TargetMode::try_from(self.value) {
                Ok(mode) => write!(f, "TARGET MODE = {} {}", self.value, mode.name()),
                Err(_) => write!(f, "TARGET MODE = {}", self.value),
            },
            FieldKind::Cmd => match command_name(self.value) {
                Some(name) => write!(f, "CMD = {} {}", self.value, name),
                None => write!(f, "CMD = {}", self.value),
            },
            FieldKind::Ack => match AckCode::try_from(self.value) {
                Ok(code) => write!(f, "{} = {:#04X}", code.name(), self.value),
                Err(_) => write!(f, "ACK = {:#04X}", self.value),
            },
            _ => write!(f, "{} = {}", self.kind, self.value),
        }
    }
}

/// Kind of visualization marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MarkerKind {
    /// Dot at a bit sampling point
    Sample,
    /// Error overlay (framing timeout, collision loser, missed ack)
    Error,
    /// Opening bracket of the ack timeout window
    TimeoutStart,
    /// Closing bracket of the ack timeout window
    TimeoutStop,
    /// Square at a bit observed on the mirrored receive line
    AckSquare,
}

/// Lightweight annotation attached to one sample of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Marker {
    /// Sample the marker sits on
    pub sample: u64,
    /// What the marker depicts
    pub kind: MarkerKind,
    /// Channel the marker is drawn on
    pub channel: ChannelId,
}

/// Addressing mode carried by the TARGET MODE field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TargetMode {
    /// Single service by id
    Id = 0,
    /// Single service by id, acknowledgement required
    IdAck = 1,
    /// All services of a type
    Type = 2,
    /// Every service on the bus
    Broadcast = 3,
    /// Multicast group
    Multicast = 4,
    /// Single node by id
    NodeId = 5,
    /// Single node by id, acknowledgement required
    NodeIdAck = 6,
}

impl TargetMode {
    /// True for the modes that demand an acknowledgement byte after the CRC
    pub fn expects_ack(&self) -> bool {
        matches!(self, TargetMode::IdAck | TargetMode::NodeIdAck)
    }

    /// Display name of the mode
    pub fn name(&self) -> &'static str {
        match self {
            TargetMode::Id => "ID",
            TargetMode::IdAck => "IDACK",
            TargetMode::Type => "TYPE",
            TargetMode::Broadcast => "BROADCAST",
            TargetMode::Multicast => "MULTICAST",
            TargetMode::NodeId => "NODEID",
            TargetMode::NodeIdAck => "NODEIDACK",
        }
    }
}

impl TryFrom<u32> for TargetMode {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(TargetMode::Id),
            1 => Ok(TargetMode::IdAck),
            2 => Ok(TargetMode::Type),
            3 => Ok(TargetMode::Broadcast),
            4 => Ok(TargetMode::Multicast),
            5 => Ok(TargetMode::NodeId),
            6 => Ok(TargetMode::NodeIdAck),
            _ => Err(DecodeError::invalid_field_value(format!(
                "Unknown target mode: {}",
                value
            ))),
        }
    }
}

/// Conventional acknowledgement byte values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AckCode {
    /// Message accepted
    Ack = 0x0F,
    /// Message rejected
    Nak = 0x1F,
    /// Receiver signalled an ack timeout
    AckTimeout = 0x2F,
    /// Receiver signalled a framing error
    AckFramingError = 0x3F,
}

impl AckCode {
    /// Display name of the code
    pub fn name(&self) -> &'static str {
        match self {
            AckCode::Ack => "ACK",
            AckCode::Nak => "NAK",
            AckCode::AckTimeout => "ACK TIMEOUT",
            AckCode::AckFramingError => "ACK FRAMING ERROR",
        }
    }
}

impl TryFrom<u32> for AckCode {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0x0F => Ok(AckCode::Ack),
            0x1F => Ok(AckCode::Nak),
            0x2F => Ok(AckCode::AckTimeout),
            0x3F => Ok(AckCode::AckFramingError),
            _ => Err(DecodeError::invalid_field_value(format!(
                "Unknown ack code: {:#04X}",
                value
            ))),
        }
    }
}

/// Human-readable name of a command byte, for the values the bus reserves
pub fn command_name(cmd: u32) -> Option<&'static str> {
    let name = match cmd {
        0 => "WRITE_NODE_ID",
        1 => "RESET_DETECTION",
        2 => "SET_BAUDRATE",
        3 => "ASSERT",
        4 => "RTB_CMD",
        5 => "WRITE_ALIAS",
        6 => "UPDATE_PUB",
        7 => "NODE_UUID",
        8 => "REVISION",
        9 => "LUOS_REVISION",
        10 => "LUOS_STATISTICS",
        11 => "ASK_PUB_CMD",
        12 => "COLOR",
        13 => "COMPLIANT",
        14 => "IO_STATE",
        15 => "RATIO",
        16 => "PEDOMETER",
        17 => "ILLUMINANCE",
        18 => "VOLTAGE",
        19 => "CURRENT",
        20 => "POWER",
        21 => "TEMPERATURE",
        22 => "TIME",
        23 => "FORCE",
        24 => "MOMENT",
        25 => "CONTROL",
        26 => "REGISTER",
        27 => "REINIT",
        28 => "PID",
        29 => "RESOLUTION",
        30 => "REDUCTION",
        31 => "DIMENSION",
        32 => "OFFSET",
        33 => "SETID",
        34 => "ANGULAR_POSITION",
        35 => "ANGULAR_SPEED",
        36 => "LINEAR_POSITION",
        37 => "LINEAR_SPEED",
        38 => "ACCEL_3D",
        39 => "GYRO_3D",
        40 => "QUATERNION",
        41 => "COMPASS_3D",
        42 => "EULER_3D",
        43 => "ROT_MAT",
        44 => "LINEAR_ACCEL",
        45 => "GRAVITY_VECTOR",
        46 => "HEADING",
        47 => "ANGULAR_POSITION_LIMIT",
        48 => "LINEAR_POSITION_LIMIT",
        49 => "RATIO_LIMIT",
        50 => "CURRENT_LIMIT",
        51 => "ANGULAR_SPEED_LIMIT",
        52 => "LINEAR_SPEED_LIMIT",
        53 => "TORQUE_LIMIT",
        54 => "DXL_WHEELMODE",
        55 => "HANDY_SET_POSITION",
        56 => "PARAMETERS",
        57 => "LUOS_PROTOCOL_NB",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_widths() {
        assert_eq!(FieldKind::Protocol.bit_width(), 4);
        assert_eq!(FieldKind::Target.bit_width(), 12);
        assert_eq!(FieldKind::Size.bit_width(), 16);
        assert_eq!(FieldKind::Data(5).bit_width(), 8);
        assert_eq!(FieldKind::CrcInvalid.bit_width(), 16);
    }

    #[test]
    fn test_target_mode_ack_rule() {
        assert!(TargetMode::IdAck.expects_ack());
        assert!(TargetMode::NodeIdAck.expects_ack());
        assert!(!TargetMode::Id.expects_ack());
        assert!(!TargetMode::Broadcast.expects_ack());
        assert!(TargetMode::try_from(7).is_err());
    }

    #[test]
    fn test_ack_codes() {
        assert_eq!(AckCode::try_from(0x0F).unwrap(), AckCode::Ack);
        assert_eq!(AckCode::try_from(0x1F).unwrap(), AckCode::Nak);
        assert!(AckCode::try_from(0x4F).is_err());
    }

    #[test]
    fn test_frame_display() {
        let f = Frame {
            kind: FieldKind::Cmd,
            value: 12,
            start_sample: 0,
            end_sample: 10,
        };
        assert_eq!(f.to_string(), "CMD = 12 COLOR");

        let f = Frame {
            kind: FieldKind::Data(3),
            value: 7,
            start_sample: 0,
            end_sample: 10,
        };
        assert_eq!(f.to_string(), "DATA[3] = 7");

        let f = Frame {
            kind: FieldKind::Ack,
            value: 0x1F,
            start_sample: 0,
            end_sample: 10,
        };
        assert_eq!(f.to_string(), "NAK = 0x1F");
    }

    #[test]
    fn test_command_names() {
        assert_eq!(command_name(12), Some("COLOR"));
        assert_eq!(command_name(57), Some("LUOS_PROTOCOL_NB"));
        assert_eq!(command_name(58), None);
    }
}
