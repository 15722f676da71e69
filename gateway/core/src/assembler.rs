//! Turns validated gateway frames into durable records. Sensors present
//! pre-digested payloads; this layer stamps the wall-clock timestamp,
//! assigns the per-device record sequence, and maps frame flags onto
//! record priority and kind.

use ferrite::frame::{flags, MessageType, OwnedFrame};
use hashbrown::HashMap;
use strata::record::flags as record_flags;
use strata::{Priority, Record, SegmentKind};

pub struct Assembler {
    sequences: HashMap<u8, u32>,
    labels: HashMap<u8, String>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            sequences: HashMap::new(),
            labels: HashMap::new(),
        }
    }

    /// Attaches a human-readable label (from discovery) used as record
    /// metadata for this device.
    pub fn set_label(&mut self, address: u8, label: String) {
        self.labels.insert(address, label);
    }

    /// Builds a record from a data or event frame. Frames of any other
    /// type produce nothing.
    pub fn assemble(&mut self, frame: &OwnedFrame, now: u64) -> Option<(SegmentKind, Record)> {
        let header = &frame.header;

        let is_event = match MessageType::from_code(header.msg_type) {
            Some(MessageType::Data) => header.flags & flags::EVENT != 0,
            Some(MessageType::Event) => true,
            _ => return None,
        };

        let priority_bits = (header.flags & flags::PRIORITY_MASK) >> flags::PRIORITY_SHIFT;
        let priority = Priority::from_code(priority_bits).expect("Two bits cover all priorities");

        let sequence = self.next_sequence(header.source);

        let metadata = self
            .labels
            .get(&header.source)
            .cloned()
            .unwrap_or_else(|| format!("device-{:03}", header.source));

        let kind = if is_event {
            SegmentKind::Event
        } else {
            SegmentKind::Data
        };

        Some((
            kind,
            Record {
                timestamp: now as u32,
                sequence,
                source: header.source,
                priority,
                flags: if is_event { record_flags::EVENT } else { 0 },
                metadata,
                payload: frame.payload.clone(),
            },
        ))
    }

    fn next_sequence(&mut self, source: u8) -> u32 {
        let counter = self.sequences.entry(source).or_insert(0);
        let sequence = *counter;
        *counter += 1;
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite::frame::Header;

    fn data_frame(source: u8, sequence: u8, flag_bits: u8, payload: &[u8]) -> OwnedFrame {
        OwnedFrame {
            header: Header {
                version: 1,
                source,
                dest: 1,
                msg_type: MessageType::Data.code(),
                sequence,
                flags: flag_bits,
                length: payload.len() as u16,
            },
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_data_frame_becomes_data_record() {
        let mut assembler = Assembler::new();

        let priority_high = (Priority::High.code()) << flags::PRIORITY_SHIFT;
        let frame = data_frame(7, 0, priority_high, &[1, 2, 3]);

        let (kind, record) = assembler.assemble(&frame, 1_700_000_000).unwrap();

        assert_eq!(kind, SegmentKind::Data);
        assert_eq!(record.priority, Priority::High);
        assert_eq!(record.source, 7);
        assert_eq!(record.payload, vec![1, 2, 3]);
        assert_eq!(record.timestamp, 1_700_000_000);
        assert!(!record.is_event());
    }

    #[test]
    fn test_sequences_are_per_device_and_monotonic() {
        let mut assembler = Assembler::new();

        for expected in 0..3 {
            let frame = data_frame(7, expected as u8, 0, &[]);
            let (_, record) = assembler.assemble(&frame, 0).unwrap();
            assert_eq!(record.sequence, expected);
        }

        let frame = data_frame(9, 0, 0, &[]);
        let (_, record) = assembler.assemble(&frame, 0).unwrap();
        assert_eq!(record.sequence, 0);
    }

    #[test]
    fn test_event_flag_routes_to_event_segment() {
        let mut assembler = Assembler::new();

        let frame = data_frame(7, 0, flags::EVENT, &[9]);
        let (kind, record) = assembler.assemble(&frame, 0).unwrap();

        assert_eq!(kind, SegmentKind::Event);
        assert!(record.is_event());
    }

    #[test]
    fn test_labels_feed_metadata() {
        let mut assembler = Assembler::new();
        assembler.set_label(7, "vibration/spindle-a".to_string());

        let (_, labelled) = assembler.assemble(&data_frame(7, 0, 0, &[]), 0).unwrap();
        let (_, unlabelled) = assembler.assemble(&data_frame(8, 0, 0, &[]), 0).unwrap();

        assert_eq!(labelled.metadata, "vibration/spindle-a");
        assert_eq!(unlabelled.metadata, "device-008");
    }

    #[test]
    fn test_non_data_frames_are_ignored() {
        let mut assembler = Assembler::new();

        let mut frame = data_frame(7, 0, 0, &[]);
        frame.header.msg_type = MessageType::Announce.code();

        assert!(assembler.assemble(&frame, 0).is_none());
    }
}
