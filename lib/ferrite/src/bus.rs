//! Half-duplex bus ownership. The RS-485 line carries both the gateway
//! protocol and Modbus RTU; the arbiter owns the port, tracks the last bus
//! activity and enforces the turnaround silence both protocols mandate
//! before any transmit.

use crate::buffer::Buffer;
use crate::error::ProtoResult;
use crate::modbus;
use flint::time::{Clock, Deadline};
use std::io;
use std::time::{Duration, Instant};

/// Transport capability the engines are written against. Real backends
/// (serial port, test harness) are injected at construction.
pub trait BusPort {
    /// Transmit the bytes, blocking until they are on the wire.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Receive into `buf`, blocking until at least one byte arrives or the
    /// deadline expires. Returns `Ok(0)` on deadline expiry.
    fn recv(&mut self, buf: &mut [u8], deadline: Deadline) -> io::Result<usize>;
}

/// RTU-derived silence intervals for a configured line speed. A character
/// is 11 bit-times: start + 8 data + parity + stop.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BusTiming {
    pub char_time: Duration,
    /// Minimum quiet time between frames (3.5 character times).
    pub inter_frame: Duration,
    /// Maximum quiet time inside a frame (1.5 character times).
    pub inter_char: Duration,
}

impl BusTiming {
    pub fn from_baud(baud: u32) -> BusTiming {
        if baud == 0 {
            panic!("Bus baud rate must be non-zero");
        }

        let char_time = Duration::from_micros(11_000_000 / u64::from(baud));

        BusTiming {
            char_time,
            inter_frame: char_time * 7 / 2,
            inter_char: char_time * 3 / 2,
        }
    }
}

const RECV_CHUNK: usize = 64;

/// Owns the shared port. Both protocol engines transact through one of
/// these; only one of {send, receive} is ever active at a time.
pub struct Arbiter<P, C> {
    port: P,
    clock: C,
    timing: BusTiming,
    last_activity: Instant,
}

impl<P: BusPort, C: Clock> Arbiter<P, C> {
    #[inline]
    pub fn new(port: P, timing: BusTiming, clock: C) -> Arbiter<P, C> {
        let last_activity = clock.now();

        Arbiter {
            port,
            clock,
            timing,
            last_activity,
        }
    }

    #[inline]
    pub fn timing(&self) -> &BusTiming {
        &self.timing
    }

    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    #[inline]
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    #[inline]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    #[inline]
    pub fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration)
    }

    /// Transmit one frame, waiting out the mandated inter-frame silence
    /// before turning the bus around.
    pub fn send(&mut self, bytes: &[u8]) -> ProtoResult<()> {
        let elapsed = self.clock.now().duration_since(self.last_activity);

        if elapsed < self.timing.inter_frame {
            self.clock.sleep(self.timing.inter_frame - elapsed);
        }

        self.port.send(bytes)?;
        self.last_activity = self.clock.now();

        Ok(())
    }

    /// Pulls whatever arrives before the deadline into `buffer`. Returns the
    /// number of bytes received; 0 means the deadline expired quietly.
    pub fn recv_into(&mut self, buffer: &mut Buffer, deadline: Deadline) -> ProtoResult<usize> {
        let mut chunk = [0u8; RECV_CHUNK];

        let received = self.port.recv(&mut chunk, deadline)?;

        if received > 0 {
            self.last_activity = self.clock.now();
            buffer.push(&chunk[..received])?;
        }

        Ok(received)
    }

    /// Receives one silence-delimited RTU frame: bytes are collected until
    /// the line stays quiet for the inter-frame gap, the overall deadline
    /// expires, or the frame cap is reached. Returns the byte count.
    pub fn recv_until_silence(&mut self, out: &mut Vec<u8>, deadline: Deadline) -> ProtoResult<usize> {
        let start_len = out.len();
        let mut chunk = [0u8; RECV_CHUNK];

        loop {
            let now = self.clock.now();

            let slice = if out.len() == start_len {
                deadline
            } else {
                // Mid-frame: quiet for the inter-frame gap ends the frame
                let gap = Deadline::after(now, self.timing.inter_frame);
                if gap.instant() < deadline.instant() {
                    gap
                } else {
                    deadline
                }
            };

            if slice.expired(now) {
                break;
            }

            let received = self.port.recv(&mut chunk, slice)?;

            if received == 0 {
                break;
            }

            out.extend_from_slice(&chunk[..received]);
            self.last_activity = self.clock.now();

            if out.len() - start_len >= modbus::MAX_FRAME {
                break;
            }
        }

        Ok(out.len() - start_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_at_9600_baud() {
        let timing = BusTiming::from_baud(9600);

        // 11 bits at 9600 baud is 1145µs per character
        assert_eq!(timing.char_time, Duration::from_micros(1145));
        assert_eq!(timing.inter_frame, Duration::from_nanos(4_007_500));
        assert_eq!(timing.inter_char, Duration::from_nanos(1_717_500));
    }

    #[test]
    fn test_timing_at_115200_baud() {
        let timing = BusTiming::from_baud(115_200);

        assert_eq!(timing.char_time, Duration::from_micros(95));
        assert!(timing.inter_frame > timing.inter_char);
    }

    #[test]
    #[should_panic(expected = "Bus baud rate must be non-zero")]
    fn test_zero_baud_panics() {
        BusTiming::from_baud(0);
    }
}
