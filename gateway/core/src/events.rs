//! User-visible failures and state changes become event records, stored
//! and uploaded like telemetry but flagged as events. Nothing in the core
//! fails silently: anything a person should see passes through here.

use strata::record::flags;
use strata::{Priority, Record};

pub const SUBSYSTEM_PAUSED: &str = "subsystem-paused";
pub const STORAGE_FULL: &str = "storage-full";
pub const ADDRESS_CONFLICT: &str = "address-conflict";
pub const DELIVERY_FAILED: &str = "delivery-failed";
pub const BATCH_DROPPED: &str = "batch-dropped";
pub const CONFIG_APPLIED: &str = "config-applied";
pub const CONFIG_REJECTED: &str = "config-rejected";
pub const OTA_UPDATE_AVAILABLE: &str = "ota-update-available";
pub const GATEWAY_STARTED: &str = "gateway-started";

/// Factory for locally produced event records with their own sequence
/// space (source address 0 marks the gateway itself).
pub struct EventLog {
    sequence: u32,
}

impl EventLog {
    pub fn new() -> EventLog {
        EventLog { sequence: 0 }
    }

    pub fn make(&mut self, code: &str, detail: &str, priority: Priority, now: u64) -> Record {
        let sequence = self.sequence;
        self.sequence += 1;

        Record {
            timestamp: now as u32,
            sequence,
            source: 0,
            priority,
            flags: flags::EVENT,
            metadata: code.to_string(),
            payload: detail.as_bytes().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_records_are_flagged_and_sequenced() {
        let mut log = EventLog::new();

        let first = log.make(STORAGE_FULL, "used=256MiB", Priority::Critical, 1_700_000_000);
        let second = log.make(CONFIG_APPLIED, "bus_baud", Priority::Normal, 1_700_000_001);

        assert!(first.is_event());
        assert_eq!(first.source, 0);
        assert_eq!(first.sequence, 0);
        assert_eq!(first.metadata, STORAGE_FULL);
        assert_eq!(first.payload, b"used=256MiB");

        assert_eq!(second.sequence, 1);
    }
}
