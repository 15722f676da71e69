//! Modbus RTU master. Every operation validates its argument ranges before
//! any bus traffic, then runs one request/response transaction with retry
//! on timeout and line noise. Exceptions from the peer are structural and
//! never retried.

use super::{
    check_frame, exception_kind, finish_frame, function, pack_bits, unpack_bits, BROADCAST,
    EXCEPTION_FLAG, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::bus::{Arbiter, BusPort};
use crate::error::{ErrorKind, ProtoError, ProtoResult};
use crate::stats::ModbusStats;
use byteorder::{BigEndian, ByteOrder};
use flint::backoff::Backoff;
use flint::logging::{self, Logger};
use flint::time::{Clock, Deadline};
use std::time::Duration;

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub response_timeout: Duration,
    pub max_retries: u8,
}

impl Default for MasterConfig {
    fn default() -> MasterConfig {
        MasterConfig {
            response_timeout: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

pub struct Master {
    config: MasterConfig,
    scratch: Vec<u8>,
    stats: ModbusStats,
    log: Logger,
}

impl Master {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: MasterConfig, log: L) -> Master {
        Master {
            config,
            scratch: Vec::with_capacity(super::MAX_FRAME),
            stats: ModbusStats::default(),
            log: logging::branch(log),
        }
    }

    #[inline]
    pub fn stats(&self) -> &ModbusStats {
        &self.stats
    }

    pub fn read_coils<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        start: u16,
        quantity: u16,
    ) -> ProtoResult<Vec<bool>> {
        self.read_bits(bus, unit, function::READ_COILS, start, quantity)
    }

    pub fn read_discrete_inputs<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        start: u16,
        quantity: u16,
    ) -> ProtoResult<Vec<bool>> {
        self.read_bits(bus, unit, function::READ_DISCRETE_INPUTS, start, quantity)
    }

    pub fn read_holding_registers<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        start: u16,
        quantity: u16,
    ) -> ProtoResult<Vec<u16>> {
        self.read_words(bus, unit, function::READ_HOLDING_REGISTERS, start, quantity)
    }

    pub fn read_input_registers<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        start: u16,
        quantity: u16,
    ) -> ProtoResult<Vec<u16>> {
        self.read_words(bus, unit, function::READ_INPUT_REGISTERS, start, quantity)
    }

    pub fn write_single_coil<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        addr: u16,
        value: bool,
    ) -> ProtoResult<()> {
        let encoded = if value { 0xFF00 } else { 0x0000 };
        let pdu = request_pdu(function::WRITE_SINGLE_COIL, addr, encoded);
        let reply = self.transact(bus, unit, &pdu)?;

        Self::check_echo(unit, &pdu, &reply)
    }

    pub fn write_single_register<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        addr: u16,
        value: u16,
    ) -> ProtoResult<()> {
        let pdu = request_pdu(function::WRITE_SINGLE_REGISTER, addr, value);
        let reply = self.transact(bus, unit, &pdu)?;

        Self::check_echo(unit, &pdu, &reply)
    }

    pub fn write_multiple_coils<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        start: u16,
        values: &[bool],
    ) -> ProtoResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_COILS as usize {
            return Err(ProtoError::Fatal(ErrorKind::IllegalDataValue));
        }

        check_span(start, values.len() as u16)?;

        let mut pdu = request_pdu(function::WRITE_MULTIPLE_COILS, start, values.len() as u16);
        pdu.push(((values.len() + 7) / 8) as u8);
        pack_bits(values, &mut pdu);

        let reply = self.transact(bus, unit, &pdu)?;

        Self::check_echo(unit, &pdu[..5], &reply)
    }

    pub fn write_multiple_registers<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        start: u16,
        values: &[u16],
    ) -> ProtoResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ProtoError::Fatal(ErrorKind::IllegalDataValue));
        }

        check_span(start, values.len() as u16)?;

        let mut pdu = request_pdu(function::WRITE_MULTIPLE_REGISTERS, start, values.len() as u16);
        pdu.push((values.len() * 2) as u8);
        for value in values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }

        let reply = self.transact(bus, unit, &pdu)?;

        Self::check_echo(unit, &pdu[..5], &reply)
    }

    fn read_bits<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        function: u8,
        start: u16,
        quantity: u16,
    ) -> ProtoResult<Vec<bool>> {
        check_read_args(unit, start, quantity, MAX_READ_COILS)?;

        let pdu = request_pdu(function, start, quantity);
        let reply = self.transact(bus, unit, &pdu)?;

        let data_bytes = (quantity as usize + 7) / 8;

        if reply.len() != 2 + data_bytes || reply[1] as usize != data_bytes {
            return Err(ProtoError::Fatal(ErrorKind::Framing));
        }

        Ok(unpack_bits(&reply[2..], quantity as usize))
    }

    fn read_words<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        function: u8,
        start: u16,
        quantity: u16,
    ) -> ProtoResult<Vec<u16>> {
        check_read_args(unit, start, quantity, MAX_READ_REGISTERS)?;

        let pdu = request_pdu(function, start, quantity);
        let reply = self.transact(bus, unit, &pdu)?;

        let data_bytes = quantity as usize * 2;

        if reply.len() != 2 + data_bytes || reply[1] as usize != data_bytes {
            return Err(ProtoError::Fatal(ErrorKind::Framing));
        }

        Ok(reply[2..]
            .chunks_exact(2)
            .map(BigEndian::read_u16)
            .collect())
    }

    /// One request/response exchange. Timeouts and line noise retry with
    /// backoff up to the configured cap; a broadcast request returns as
    /// soon as the frame is out (the next transmit waits the turnaround).
    fn transact<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        unit: u8,
        pdu: &[u8],
    ) -> ProtoResult<Vec<u8>> {
        if unit > super::UNIT_MAX {
            return Err(ProtoError::Fatal(ErrorKind::IllegalDataValue));
        }

        let mut raw = Vec::with_capacity(pdu.len() + 3);
        raw.push(unit);
        raw.extend_from_slice(pdu);
        finish_frame(&mut raw);

        let mut backoff = Backoff::new(RETRY_BACKOFF_BASE, RETRY_BACKOFF_CAP);
        let mut attempt: u32 = 0;

        loop {
            bus.send(&raw)?;
            self.stats.requests += 1;

            if unit == BROADCAST {
                return Ok(Vec::new());
            }

            self.scratch.clear();
            let deadline = Deadline::after(bus.now(), self.config.response_timeout);
            let received = bus.recv_until_silence(&mut self.scratch, deadline)?;

            let failure = if received == 0 {
                self.stats.timeouts += 1;
                ErrorKind::Timeout
            } else {
                match check_frame(&self.scratch) {
                    Ok((addr, reply)) => {
                        if addr != unit || reply.is_empty() {
                            ErrorKind::Framing
                        } else if reply[0] == pdu[0] | EXCEPTION_FLAG {
                            self.stats.exceptions += 1;
                            let code = reply.get(1).copied().unwrap_or(0);

                            logging::debug!(self.log, "exception response";
                                            "context" => "transact",
                                            "unit" => unit,
                                            "function" => pdu[0],
                                            "exception" => code);

                            return Err(ProtoError::Fatal(exception_kind(code)));
                        } else if reply[0] != pdu[0] {
                            ErrorKind::Framing
                        } else {
                            self.stats.responses += 1;
                            return Ok(reply.to_vec());
                        }
                    }
                    Err(ProtoError::Fatal(ErrorKind::Crc)) => {
                        self.stats.crc_errors += 1;
                        ErrorKind::Crc
                    }
                    Err(ProtoError::Fatal(kind)) => kind,
                    Err(err) => return Err(err),
                }
            };

            if attempt >= u32::from(self.config.max_retries) {
                return Err(ProtoError::Fatal(failure));
            }

            attempt += 1;
            self.stats.retries += 1;

            logging::debug!(self.log, "retrying request";
                            "context" => "transact",
                            "unit" => unit,
                            "function" => pdu[0],
                            "attempt" => attempt,
                            "failure" => ?failure);

            bus.sleep(backoff.next_delay());
        }
    }

    /// Write responses echo the request head; anything else means the slave
    /// applied something other than what was asked.
    fn check_echo(unit: u8, expected: &[u8], reply: &[u8]) -> ProtoResult<()> {
        if unit == BROADCAST {
            return Ok(());
        }

        if reply != expected {
            return Err(ProtoError::Fatal(ErrorKind::Framing));
        }

        Ok(())
    }
}

fn request_pdu(function: u8, first: u16, second: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function);
    pdu.extend_from_slice(&first.to_be_bytes());
    pdu.extend_from_slice(&second.to_be_bytes());
    pdu
}

fn check_read_args(unit: u8, start: u16, quantity: u16, limit: u16) -> ProtoResult<()> {
    // Reads cannot be broadcast, nobody would answer
    if unit == BROADCAST {
        return Err(ProtoError::Fatal(ErrorKind::IllegalDataValue));
    }

    if quantity == 0 || quantity > limit {
        return Err(ProtoError::Fatal(ErrorKind::IllegalDataValue));
    }

    check_span(start, quantity)
}

fn check_span(start: u16, quantity: u16) -> ProtoResult<()> {
    if u32::from(start) + u32::from(quantity) > 0x1_0000 {
        return Err(ProtoError::Fatal(ErrorKind::IllegalDataAddress));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16;
    use crate::testkit::{rig, sent};

    fn respond(bus: &crate::bus::Arbiter<crate::testkit::MockPort, crate::testkit::TestClock>, body: &[u8]) {
        let mut raw = body.to_vec();
        let crc = crc16(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());
        bus.port().queue(raw);
    }

    fn master() -> Master {
        Master::new(MasterConfig::default(), None)
    }

    #[test]
    fn test_quantity_limits_rejected_without_bus_traffic() {
        let mut bus = rig(19_200);
        let mut master = master();

        let cases: Vec<ProtoResult<()>> = vec![
            master.read_coils(&mut bus, 1, 0, 0).map(drop),
            master.read_coils(&mut bus, 1, 0, 2001).map(drop),
            master.read_discrete_inputs(&mut bus, 1, 0, 2001).map(drop),
            master.read_holding_registers(&mut bus, 1, 0, 126).map(drop),
            master.read_input_registers(&mut bus, 1, 0, 0).map(drop),
            master
                .write_multiple_coils(&mut bus, 1, 0, &[false; 1969])
                .map(drop),
            master
                .write_multiple_registers(&mut bus, 1, 0, &[0; 124])
                .map(drop),
        ];

        for result in cases {
            assert_eq!(result, Err(ProtoError::Fatal(ErrorKind::IllegalDataValue)));
        }

        assert!(sent(&bus).is_empty());
        assert_eq!(master.stats().requests, 0);
    }

    #[test]
    fn test_address_span_overflow_rejected() {
        let mut bus = rig(19_200);
        let mut master = master();

        let result = master.read_holding_registers(&mut bus, 1, 0xFFFE, 3);

        assert_eq!(result, Err(ProtoError::Fatal(ErrorKind::IllegalDataAddress)));
        assert!(sent(&bus).is_empty());
    }

    #[test]
    fn test_read_holding_registers_roundtrip() {
        let mut bus = rig(19_200);
        let mut master = master();

        // Slave returns registers 0 and 1 holding 10 and 20
        respond(&bus, &[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14]);

        let values = master.read_holding_registers(&mut bus, 1, 0, 2).unwrap();

        assert_eq!(values, vec![10, 20]);

        let request = &sent(&bus)[0];
        assert_eq!(&request[..6], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(master.stats().responses, 1);
    }

    #[test]
    fn test_read_coils_unpacks_bits() {
        let mut bus = rig(19_200);
        let mut master = master();

        respond(&bus, &[0x01, 0x01, 0x02, 0b0000_0101, 0b0000_0010]);

        let coils = master.read_coils(&mut bus, 1, 0, 10).unwrap();

        assert_eq!(
            coils,
            vec![true, false, true, false, false, false, false, false, false, true]
        );
    }

    #[test]
    fn test_write_single_coil_broadcast_expects_no_response() {
        let mut bus = rig(19_200);
        let mut master = master();

        master.write_single_coil(&mut bus, 0, 0x0013, true).unwrap();

        let request = &sent(&bus)[0];
        assert_eq!(&request[..6], &[0x00, 0x05, 0x00, 0x13, 0xFF, 0x00]);
        assert_eq!(sent(&bus).len(), 1);
        assert_eq!(master.stats().timeouts, 0);
    }

    #[test]
    fn test_write_single_register_validates_echo() {
        let mut bus = rig(19_200);
        let mut master = master();

        respond(&bus, &[0x01, 0x06, 0x00, 0x20, 0x12, 0x34]);

        master
            .write_single_register(&mut bus, 1, 0x0020, 0x1234)
            .unwrap();

        // A corrupted echo (wrong value) must be rejected
        let mut bus = rig(19_200);
        let mut master = Master::new(
            MasterConfig {
                max_retries: 0,
                ..MasterConfig::default()
            },
            None,
        );

        respond(&bus, &[0x01, 0x06, 0x00, 0x20, 0x99, 0x99]);

        let result = master.write_single_register(&mut bus, 1, 0x0020, 0x1234);

        assert_eq!(result, Err(ProtoError::Fatal(ErrorKind::Framing)));
    }

    #[test]
    fn test_exception_response_maps_and_never_retries() {
        let mut bus = rig(19_200);
        let mut master = master();

        respond(&bus, &[0x01, 0x83, 0x02]);

        let result = master.read_holding_registers(&mut bus, 1, 0, 2);

        assert_eq!(result, Err(ProtoError::Fatal(ErrorKind::IllegalDataAddress)));
        assert_eq!(master.stats().exceptions, 1);
        assert_eq!(master.stats().retries, 0);
        assert_eq!(sent(&bus).len(), 1);
    }

    #[test]
    fn test_timeout_retries_then_fails() {
        let mut bus = rig(19_200);
        let mut master = Master::new(
            MasterConfig {
                response_timeout: Duration::from_millis(100),
                max_retries: 2,
            },
            None,
        );

        let result = master.read_holding_registers(&mut bus, 1, 0, 1);

        assert_eq!(result, Err(ProtoError::Fatal(ErrorKind::Timeout)));
        assert_eq!(sent(&bus).len(), 3);
        assert_eq!(master.stats().timeouts, 3);
        assert_eq!(master.stats().retries, 2);
    }

    #[test]
    fn test_crc_noise_retries_then_recovers() {
        let mut bus = rig(19_200);
        let mut master = master();

        // First response mangled, second clean
        let mut mangled = vec![0x01, 0x03, 0x02, 0x00, 0x05];
        let crc = crc16(&mangled);
        mangled.extend_from_slice(&crc.to_le_bytes());
        mangled[3] ^= 0xFF;
        bus.port().queue(mangled);

        respond(&bus, &[0x01, 0x03, 0x02, 0x00, 0x05]);

        let values = master.read_holding_registers(&mut bus, 1, 0, 1).unwrap();

        assert_eq!(values, vec![5]);
        assert_eq!(master.stats().crc_errors, 1);
        assert_eq!(master.stats().retries, 1);
    }

    #[test]
    fn test_write_multiple_registers_request_shape() {
        let mut bus = rig(19_200);
        let mut master = master();

        respond(&bus, &[0x01, 0x10, 0x00, 0x10, 0x00, 0x02]);

        master
            .write_multiple_registers(&mut bus, 1, 0x0010, &[0x0102, 0x0304])
            .unwrap();

        let request = &sent(&bus)[0];
        assert_eq!(
            &request[..11],
            &[0x01, 0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04]
        );
    }
}
