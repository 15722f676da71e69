//! Modbus RTU engine (master and slave) sharing the RS-485 transport with
//! the gateway protocol. RTU only: `unit(1) | pdu | crc16(2, LE)`, frames
//! delimited by 3.5 character times of silence.

pub mod data;
pub mod master;
pub mod slave;

pub use data::{ArrayBank, CoilBank, DataMap, RegisterBank};
pub use master::{Master, MasterConfig};
pub use slave::Slave;

use crate::crc::crc16;
use crate::error::{ErrorKind, ProtoError, ProtoResult};
use byteorder::{ByteOrder, LittleEndian};

/// RTU frame cap. Separate from the gateway protocol's payload cap; the two
/// limits are close but not interchangeable.
pub const MAX_FRAME: usize = 256;
pub const MIN_FRAME: usize = 4;

pub const BROADCAST: u8 = 0;
pub const UNIT_MAX: u8 = 247;

/// Exception responses set the high bit of the echoed function code.
pub const EXCEPTION_FLAG: u8 = 0x80;

pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

// Per-function quantity limits from the application protocol spec
pub const MAX_READ_COILS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_COILS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exception {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
}

impl Exception {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            Exception::IllegalFunction => 0x01,
            Exception::IllegalDataAddress => 0x02,
            Exception::IllegalDataValue => 0x03,
            Exception::ServerDeviceFailure => 0x04,
        }
    }
}

/// Maps an exception code received on the wire onto the error taxonomy.
#[inline]
pub fn exception_kind(code: u8) -> ErrorKind {
    match code {
        0x01 => ErrorKind::UnknownFunction,
        0x02 => ErrorKind::IllegalDataAddress,
        0x03 => ErrorKind::IllegalDataValue,
        code => ErrorKind::Exception(code),
    }
}

/// Appends the RTU CRC over everything already in `out`.
#[inline]
pub fn finish_frame(out: &mut Vec<u8>) {
    let crc = crc16(out);
    out.extend_from_slice(&crc.to_le_bytes());
}

/// Validates length and CRC of a raw RTU frame, splitting it into the unit
/// address and the PDU.
pub fn check_frame(raw: &[u8]) -> ProtoResult<(u8, &[u8])> {
    if raw.len() < MIN_FRAME || raw.len() > MAX_FRAME {
        return Err(ProtoError::Fatal(ErrorKind::Framing));
    }

    let split = raw.len() - 2;
    let wire_crc = LittleEndian::read_u16(&raw[split..]);

    if crc16(&raw[..split]) != wire_crc {
        return Err(ProtoError::Fatal(ErrorKind::Crc));
    }

    Ok((raw[0], &raw[1..split]))
}

/// Packs coil states LSB-first into bytes, the RTU bit order.
pub(crate) fn pack_bits(bits: &[bool], out: &mut Vec<u8>) {
    for chunk in bits.chunks(8) {
        let mut byte = 0u8;

        for (index, &bit) in chunk.iter().enumerate() {
            if bit {
                byte |= 1 << index;
            }
        }

        out.push(byte);
    }
}

pub(crate) fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|index| bytes[index / 8] & (1 << (index % 8)) != 0)
        .collect()
}
