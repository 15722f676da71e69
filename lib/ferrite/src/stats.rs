use crate::error::ErrorKind;

/// Per-link counters. Every failure path on the gateway protocol bumps one
/// of these; nothing is dropped silently.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinkStats {
    pub frames_tx: u64,
    pub frames_rx: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub crc_errors: u64,
    pub framing_errors: u64,
    pub overruns: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub acks_rx: u64,
    pub nacks_rx: u64,
    pub nacks_tx: u64,
    pub replays_dropped: u64,
    pub address_conflicts: u64,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct ModbusStats {
    pub requests: u64,
    pub responses: u64,
    pub exceptions: u64,
    pub crc_errors: u64,
    pub timeouts: u64,
    pub retries: u64,
}

/// Terminal outcomes of link operations, drained by the scheduler and
/// turned into user-visible event records.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkEvent {
    Delivered {
        dest: u8,
        sequence: u8,
        attempts: u32,
    },
    SendFailed {
        dest: u8,
        sequence: u8,
        kind: ErrorKind,
    },
    AddressConflict {
        address: u8,
    },
}
