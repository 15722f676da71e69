//! Segment files: append-only streams of framed entries, one directory per
//! type, named `<TYPE>_<hex-timestamp>.dat`. A sibling `.seal` file marks a
//! rotated segment immutable and carries its whole-file SHA-256.

use crate::compress::decompress_block;
use crate::error::{StoreError, StoreResult};
use crate::fs::Volume;
use crate::record::{frame_into, unframe, Record, Unframed};
use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SegmentKind {
    Data,
    Event,
    Config,
    Log,
    Firmware,
}

impl SegmentKind {
    pub const ALL: [SegmentKind; 5] = [
        SegmentKind::Data,
        SegmentKind::Event,
        SegmentKind::Config,
        SegmentKind::Log,
        SegmentKind::Firmware,
    ];

    #[inline]
    pub fn dir(self) -> &'static str {
        match self {
            SegmentKind::Data => "data",
            SegmentKind::Event => "event",
            SegmentKind::Config => "config",
            SegmentKind::Log => "log",
            SegmentKind::Firmware => "firmware",
        }
    }

    #[inline]
    pub fn tag(self) -> &'static str {
        match self {
            SegmentKind::Data => "DATA",
            SegmentKind::Event => "EVENT",
            SegmentKind::Config => "CONFIG",
            SegmentKind::Log => "LOG",
            SegmentKind::Firmware => "FW",
        }
    }
}

pub fn file_name(kind: SegmentKind, timestamp: u64) -> String {
    format!("{}/{}_{:08X}.dat", kind.dir(), kind.tag(), timestamp)
}

pub fn seal_name(name: &str) -> String {
    format!("{}.seal", name)
}

/// Creation timestamp encoded in a segment name, if it parses.
pub fn parse_name(kind: SegmentKind, name: &str) -> Option<u64> {
    let prefix = format!("{}/{}_", kind.dir(), kind.tag());
    let hex = name.strip_prefix(&prefix)?.strip_suffix(".dat")?;

    u64::from_str_radix(hex, 16).ok()
}

// Entry kind bytes, the first byte of every framed body
const KIND_RECORD: u8 = 0x01;
const KIND_BLOCK: u8 = 0x02;
const KIND_SEAL: u8 = 0x03;

/// One decoded segment entry.
#[derive(Debug, Eq, PartialEq)]
pub enum Entry {
    Record(Record),
    /// A compressed flush window: zstd bytes plus the size they expand to.
    Block {
        uncompressed_len: u32,
        data: Vec<u8>,
    },
}

/// Serializes a record as a framed segment entry.
pub fn encode_record_entry(out: &mut Vec<u8>, record: &Record) -> StoreResult<()> {
    let mut body = Vec::with_capacity(1 + record.body_size());
    body.push(KIND_RECORD);
    record.write_body(&mut body)?;

    frame_into(out, &body);
    Ok(())
}

/// Serializes a compressed block as a framed segment entry.
pub fn encode_block_entry(out: &mut Vec<u8>, uncompressed_len: u32, data: &[u8]) {
    let mut body = Vec::with_capacity(5 + data.len());
    body.push(KIND_BLOCK);

    let mut size = [0u8; 4];
    LittleEndian::write_u32(&mut size, uncompressed_len);
    body.extend_from_slice(&size);
    body.extend_from_slice(data);

    frame_into(out, &body);
}

fn decode_entry(body: &[u8]) -> StoreResult<Entry> {
    match body.first() {
        Some(&KIND_RECORD) => Ok(Entry::Record(Record::read_body(&body[1..])?)),
        Some(&KIND_BLOCK) => {
            if body.len() < 5 {
                return Err(StoreError::Corrupt("block entry shorter than its header"));
            }

            Ok(Entry::Block {
                uncompressed_len: LittleEndian::read_u32(&body[1..5]),
                data: body[5..].to_vec(),
            })
        }
        _ => Err(StoreError::Corrupt("unknown entry kind")),
    }
}

#[derive(Debug)]
pub struct Scan {
    pub entries: Vec<Entry>,
    /// Offset of the last byte that belongs to an intact entry.
    pub good_len: u64,
    /// Whether a torn tail followed the intact entries.
    pub torn: bool,
}

/// Walks a segment from the start, keeping every entry whose length and
/// CRC-32 hold up and stopping at the first torn one.
pub fn scan<V: Volume>(volume: &V, name: &str) -> StoreResult<Scan> {
    let data = volume.read(name)?;

    let mut entries = Vec::new();
    let mut offset = 0usize;

    let torn = loop {
        match unframe(&data[offset..]) {
            Unframed::Entry { body, consumed } => {
                entries.push(decode_entry(body)?);
                offset += consumed;
            }
            Unframed::Eof => break false,
            Unframed::Torn => break true,
        }
    };

    Ok(Scan {
        entries,
        good_len: offset as u64,
        torn,
    })
}

/// Open-time recovery: truncates a torn tail off the segment. Returns the
/// number of intact records kept.
pub fn truncate_torn<V: Volume>(volume: &mut V, name: &str) -> StoreResult<u64> {
    let scan = scan(volume, name)?;

    if scan.torn {
        volume.truncate(name, scan.good_len)?;
        volume.sync(name)?;
    }

    Ok(scan.entries.len() as u64)
}

/// All records in a segment in append order, expanding compressed blocks.
pub fn read_records<V: Volume>(volume: &V, name: &str) -> StoreResult<Vec<Record>> {
    let scan = scan(volume, name)?;
    let mut records = Vec::new();

    for entry in scan.entries {
        match entry {
            Entry::Record(record) => records.push(record),
            Entry::Block {
                uncompressed_len,
                data,
            } => {
                let plain = decompress_block(&data, uncompressed_len as usize)?;
                let mut offset = 0usize;

                loop {
                    match unframe(&plain[offset..]) {
                        Unframed::Entry { body, consumed } => {
                            match decode_entry(body)? {
                                Entry::Record(record) => records.push(record),
                                Entry::Block { .. } => {
                                    return Err(StoreError::Corrupt("nested compressed block"))
                                }
                            }
                            offset += consumed;
                        }
                        Unframed::Eof => break,
                        Unframed::Torn => {
                            return Err(StoreError::Corrupt("torn entry inside a block"))
                        }
                    }
                }
            }
        }
    }

    Ok(records)
}

/// Seals a segment: computes the whole-file SHA-256 and writes it as a side
/// record next to the data file. Sealed segments are immutable.
pub fn seal<V: Volume>(volume: &mut V, name: &str) -> StoreResult<[u8; 32]> {
    let data = volume.read(name)?;
    let hash: [u8; 32] = Sha256::digest(&data).into();

    let mut body = Vec::with_capacity(33);
    body.push(KIND_SEAL);
    body.extend_from_slice(&hash);

    let mut entry = Vec::new();
    frame_into(&mut entry, &body);

    let marker = seal_name(name);
    volume.append(&marker, &entry)?;
    volume.sync(&marker)?;

    Ok(hash)
}

#[inline]
pub fn is_sealed<V: Volume>(volume: &V, name: &str) -> bool {
    volume.exists(&seal_name(name))
}

/// A sealed segment is valid only if its current contents hash to the
/// sealed value.
pub fn verify_seal<V: Volume>(volume: &V, name: &str) -> StoreResult<()> {
    let entry = volume.read(&seal_name(name))?;

    let body = match unframe(&entry) {
        Unframed::Entry { body, .. } => body,
        _ => return Err(StoreError::Corrupt("unreadable seal record")),
    };

    if body.len() != 33 || body[0] != KIND_SEAL {
        return Err(StoreError::Corrupt("malformed seal record"));
    }

    let data = volume.read(name)?;
    let hash: [u8; 32] = Sha256::digest(&data).into();

    if body[1..] != hash {
        return Err(StoreError::Corrupt("sealed file hash mismatch"));
    }

    Ok(())
}
