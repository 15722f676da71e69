//! The record is the unit of durable storage and upload. On disk every
//! entry is length-prefixed and CRC-32 protected:
//! `len(u32 LE) | crc32(u32 LE) | body`, where the CRC covers the body and
//! `len` is the body size. Binary payloads are carried as-is; there is no
//! text framing anywhere in the store.

use crate::error::{StoreError, StoreResult};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::io::Read;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// `len` + `crc32` prefix on every framed entry.
pub const FRAME_OVERHEAD: usize = 8;

/// Upper bound on one framed body; anything claiming more is a torn or
/// corrupted length field.
pub const MAX_ENTRY_SIZE: usize = 1 << 20;

/// Retention and upload ordering classes. Critical records survive until
/// acknowledged or until storage is exhausted outright.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    #[inline]
    pub fn from_code(code: u8) -> Option<Priority> {
        match code {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Critical),
            _ => None,
        }
    }
}

pub mod flags {
    /// Record describes a user-visible event rather than telemetry.
    pub const EVENT: u8 = 0b0000_0001;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Record {
    /// Seconds since epoch at record creation.
    pub timestamp: u32,
    /// Monotonic per-device sequence number.
    pub sequence: u32,
    /// Bus address of the originating device (0 for locally produced).
    pub source: u8,
    pub priority: Priority,
    pub flags: u8,
    pub metadata: String,
    pub payload: Vec<u8>,
}

impl Record {
    const FIXED_SIZE: usize = 4 + 4 + 1 + 1 + 1 + 2;

    #[inline]
    pub fn body_size(&self) -> usize {
        Self::FIXED_SIZE + self.metadata.len() + self.payload.len()
    }

    #[inline]
    pub fn is_event(&self) -> bool {
        self.flags & flags::EVENT != 0
    }

    pub fn write_body(&self, out: &mut Vec<u8>) -> StoreResult<()> {
        if self.metadata.len() > u16::MAX as usize {
            return Err(StoreError::TooLarge);
        }

        if self.body_size() > MAX_ENTRY_SIZE {
            return Err(StoreError::TooLarge);
        }

        out.write_u32::<LittleEndian>(self.timestamp)?;
        out.write_u32::<LittleEndian>(self.sequence)?;
        out.write_u8(self.source)?;
        out.write_u8(self.priority.code())?;
        out.write_u8(self.flags)?;
        out.write_u16::<LittleEndian>(self.metadata.len() as u16)?;
        out.extend_from_slice(self.metadata.as_bytes());
        out.extend_from_slice(&self.payload);

        Ok(())
    }

    pub fn read_body(body: &[u8]) -> StoreResult<Record> {
        let mut stream = body;

        if body.len() < Self::FIXED_SIZE {
            return Err(StoreError::Corrupt("record body shorter than header"));
        }

        let timestamp = stream.read_u32::<LittleEndian>()?;
        let sequence = stream.read_u32::<LittleEndian>()?;
        let source = stream.read_u8()?;
        let priority = Priority::from_code(stream.read_u8()?)
            .ok_or(StoreError::Corrupt("unknown record priority"))?;
        let record_flags = stream.read_u8()?;
        let meta_len = stream.read_u16::<LittleEndian>()? as usize;

        if stream.len() < meta_len {
            return Err(StoreError::Corrupt("metadata extends past record body"));
        }

        let mut metadata = vec![0u8; meta_len];
        stream.read_exact(&mut metadata)?;

        let metadata = String::from_utf8(metadata)
            .map_err(|_| StoreError::Corrupt("metadata is not valid utf-8"))?;

        Ok(Record {
            timestamp,
            sequence,
            source,
            priority,
            flags: record_flags,
            metadata,
            payload: stream.to_vec(),
        })
    }
}

/// Appends one framed entry: length, CRC-32 over the body, body.
pub fn frame_into(out: &mut Vec<u8>, body: &[u8]) {
    let mut prefix = [0u8; FRAME_OVERHEAD];
    LittleEndian::write_u32(&mut prefix[..4], body.len() as u32);
    LittleEndian::write_u32(&mut prefix[4..], CRC32.checksum(body));

    out.extend_from_slice(&prefix);
    out.extend_from_slice(body);
}

/// One step over a framed entry stream.
#[derive(Debug, Eq, PartialEq)]
pub enum Unframed<'a> {
    /// A valid entry body occupying `consumed` bytes including the prefix.
    Entry { body: &'a [u8], consumed: usize },
    /// Clean end of stream.
    Eof,
    /// The remaining bytes are a torn write: a length that runs past the
    /// end, an absurd length field, or a checksum mismatch.
    Torn,
}

pub fn unframe(buf: &[u8]) -> Unframed<'_> {
    if buf.is_empty() {
        return Unframed::Eof;
    }

    if buf.len() < FRAME_OVERHEAD {
        return Unframed::Torn;
    }

    let length = LittleEndian::read_u32(&buf[..4]) as usize;
    let crc = LittleEndian::read_u32(&buf[4..8]);

    if length == 0 || length > MAX_ENTRY_SIZE || buf.len() < FRAME_OVERHEAD + length {
        return Unframed::Torn;
    }

    let body = &buf[FRAME_OVERHEAD..FRAME_OVERHEAD + length];

    if CRC32.checksum(body) != crc {
        return Unframed::Torn;
    }

    Unframed::Entry {
        body,
        consumed: FRAME_OVERHEAD + length,
    }
}
