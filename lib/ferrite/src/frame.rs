//! Gateway wire format:
//! `0xAA | ver | src | dst | type | seq | flags | len(2, LE) | payload | crc16(2, LE)`.
//! The CRC covers everything from the start sentinel through the payload.

use crate::crc::crc16;
use crate::error::{ErrorKind, ProtoError, ProtoResult};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

pub const FRAME_START: u8 = 0xAA;
pub const PROTOCOL_VERSION: u8 = 0x01;

pub const HEADER_SIZE: usize = 9;
pub const CRC_SIZE: usize = 2;

/// Gateway-protocol payload cap. Deliberately a separate constant from the
/// Modbus RTU frame cap (`modbus::MAX_FRAME`); the two limits are close but
/// not interchangeable.
pub const MAX_PAYLOAD: usize = 256;
pub const MAX_FRAME: usize = HEADER_SIZE + MAX_PAYLOAD + CRC_SIZE;

/// All slaves listen on the broadcast address; no replies are expected.
pub const BROADCAST: u8 = 0x00;
pub const ADDRESS_MIN: u8 = 1;
pub const ADDRESS_MAX: u8 = 247;

pub mod flags {
    /// Sender expects an ACK echoing the frame sequence number.
    pub const ACK_REQUIRED: u8 = 0b0000_0001;
    /// Two-bit record priority carried by data frames.
    pub const PRIORITY_MASK: u8 = 0b0000_0110;
    pub const PRIORITY_SHIFT: u8 = 1;
    /// Payload is an event, not telemetry.
    pub const EVENT: u8 = 0b0000_1000;
}

/// Message type codes. Raw `u8` on the wire so unknown types can still be
/// routed to the structured-error path.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageType {
    Discover = 0x01,
    Announce = 0x02,
    Ack = 0x06,
    Data = 0x10,
    Event = 0x11,
    Nack = 0x15,
    Command = 0x20,
    ConfigWrite = 0x21,
    TimeSync = 0x30,
}

impl MessageType {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<MessageType> {
        match code {
            0x01 => Some(MessageType::Discover),
            0x02 => Some(MessageType::Announce),
            0x06 => Some(MessageType::Ack),
            0x10 => Some(MessageType::Data),
            0x11 => Some(MessageType::Event),
            0x15 => Some(MessageType::Nack),
            0x20 => Some(MessageType::Command),
            0x21 => Some(MessageType::ConfigWrite),
            0x30 => Some(MessageType::TimeSync),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub version: u8,
    pub source: u8,
    pub dest: u8,
    pub msg_type: u8,
    pub sequence: u8,
    pub flags: u8,
    pub length: u16,
}

impl Header {
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.dest == BROADCAST
    }
}

/// A parsed frame borrowing its payload from the receive buffer. Views must
/// not outlive the buffer; copy into an `OwnedFrame` to keep one around.
#[derive(Debug, Eq, PartialEq)]
pub struct FrameView<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

impl<'a> FrameView<'a> {
    #[inline]
    pub fn to_owned(&self) -> OwnedFrame {
        OwnedFrame {
            header: self.header,
            payload: self.payload.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OwnedFrame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Serializes one frame onto the end of `out`. Deterministic and bounded;
/// fails with `PayloadTooLarge` above the protocol cap.
pub fn build(
    out: &mut Vec<u8>,
    source: u8,
    dest: u8,
    msg_type: u8,
    sequence: u8,
    flags: u8,
    payload: &[u8],
) -> ProtoResult<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtoError::Fatal(ErrorKind::PayloadTooLarge));
    }

    let start = out.len();

    out.write_u8(FRAME_START)?;
    out.write_u8(PROTOCOL_VERSION)?;
    out.write_u8(source)?;
    out.write_u8(dest)?;
    out.write_u8(msg_type)?;
    out.write_u8(sequence)?;
    out.write_u8(flags)?;
    out.write_u16::<LittleEndian>(payload.len() as u16)?;
    out.extend_from_slice(payload);

    let crc = crc16(&out[start..]);
    out.write_u16::<LittleEndian>(crc)?;

    Ok(())
}

/// One parser step over the head of a byte stream.
#[derive(Debug, Eq, PartialEq)]
pub enum Step<'a> {
    /// A complete valid frame occupying `size` bytes at the head.
    Frame(FrameView<'a>, usize),
    /// More data is required before anything can be decided.
    Incomplete,
    /// The head of the stream is unusable; discard `consumed` bytes. For
    /// framing violations that is exactly one byte (resynchronize on the
    /// next start sentinel); for a checksum mismatch it is the whole frame
    /// and `header` carries the decoded header for diagnostics.
    Corrupt {
        consumed: usize,
        kind: ErrorKind,
        header: Option<Header>,
    },
}

pub fn parse(buf: &[u8]) -> Step<'_> {
    if buf.is_empty() {
        return Step::Incomplete;
    }

    if buf[0] != FRAME_START {
        return Step::Corrupt {
            consumed: 1,
            kind: ErrorKind::Framing,
            header: None,
        };
    }

    if buf.len() < HEADER_SIZE {
        return Step::Incomplete;
    }

    let length = LittleEndian::read_u16(&buf[7..9]) as usize;

    if buf[1] != PROTOCOL_VERSION || length > MAX_PAYLOAD {
        return Step::Corrupt {
            consumed: 1,
            kind: ErrorKind::Framing,
            header: None,
        };
    }

    let total = HEADER_SIZE + length + CRC_SIZE;

    if buf.len() < total {
        return Step::Incomplete;
    }

    let header = Header {
        version: buf[1],
        source: buf[2],
        dest: buf[3],
        msg_type: buf[4],
        sequence: buf[5],
        flags: buf[6],
        length: length as u16,
    };

    let wire_crc = LittleEndian::read_u16(&buf[total - CRC_SIZE..total]);

    if crc16(&buf[..total - CRC_SIZE]) != wire_crc {
        // Consume up to the frame boundary, never past it
        return Step::Corrupt {
            consumed: total,
            kind: ErrorKind::Crc,
            header: Some(header),
        };
    }

    Step::Frame(
        FrameView {
            header,
            payload: &buf[HEADER_SIZE..HEADER_SIZE + length],
        },
        total,
    )
}
