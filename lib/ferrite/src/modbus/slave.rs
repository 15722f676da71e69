//! Modbus RTU slave. Frames addressed to this unit (or broadcast) dispatch
//! by function code into the data-map capabilities; malformed requests come
//! back as exception frames with the function code's high bit set.
//! Broadcast requests are executed but never answered.

use super::{
    check_frame, finish_frame, function, pack_bits, DataMap, Exception, BROADCAST, EXCEPTION_FLAG,
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS, UNIT_MAX,
};
use crate::bus::{Arbiter, BusPort};
use crate::error::{ErrorKind, ProtoError, ProtoResult};
use crate::stats::ModbusStats;
use byteorder::{BigEndian, ByteOrder};
use flint::logging::{self, Logger};
use flint::time::{Clock, Deadline};
use std::time::Duration;

pub struct Slave {
    address: u8,
    map: DataMap,
    scratch: Vec<u8>,
    stats: ModbusStats,
    log: Logger,
}

impl Slave {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        address: u8,
        map: DataMap,
        log: L,
    ) -> ProtoResult<Slave> {
        if address == BROADCAST || address > UNIT_MAX {
            return Err(ProtoError::Fatal(ErrorKind::IllegalDataValue));
        }

        Ok(Slave {
            address,
            map,
            scratch: Vec::with_capacity(super::MAX_FRAME),
            stats: ModbusStats::default(),
            log: logging::branch(log),
        })
    }

    #[inline]
    pub fn address(&self) -> u8 {
        self.address
    }

    #[inline]
    pub fn stats(&self) -> &ModbusStats {
        &self.stats
    }

    /// Services the bus once: receives one silence-delimited frame before
    /// the timeout and answers it. Returns whether a frame was seen.
    pub fn service<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        timeout: Duration,
    ) -> ProtoResult<bool> {
        self.scratch.clear();

        let deadline = Deadline::after(bus.now(), timeout);
        let mut raw = std::mem::take(&mut self.scratch);
        let received = bus.recv_until_silence(&mut raw, deadline);
        let outcome = match received {
            Ok(0) => Ok(false),
            Ok(_) => match self.handle_frame(&raw) {
                Ok(Some(response)) => {
                    bus.send(&response)?;
                    Ok(true)
                }
                Ok(None) => Ok(true),
                Err(ProtoError::Fatal(ErrorKind::Crc)) => {
                    self.stats.crc_errors += 1;
                    logging::debug!(self.log, "discarding frame with bad checksum";
                                    "context" => "service", "size" => raw.len());
                    Ok(false)
                }
                Err(ProtoError::Fatal(ErrorKind::Framing)) => {
                    logging::debug!(self.log, "discarding malformed frame";
                                    "context" => "service", "size" => raw.len());
                    Ok(false)
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        self.scratch = raw;
        outcome
    }

    /// Pure dispatch: one raw RTU frame in, the raw response frame out.
    /// `None` means no response goes on the wire (not addressed to this
    /// unit, or a broadcast).
    pub fn handle_frame(&mut self, raw: &[u8]) -> ProtoResult<Option<Vec<u8>>> {
        let (unit, pdu) = check_frame(raw)?;

        if unit != self.address && unit != BROADCAST {
            return Ok(None);
        }

        if pdu.is_empty() {
            return Err(ProtoError::Fatal(ErrorKind::Framing));
        }

        self.stats.requests += 1;

        let result = self.dispatch(pdu);

        if unit == BROADCAST {
            return Ok(None);
        }

        let response_pdu = match result {
            Ok(response) => {
                self.stats.responses += 1;
                response
            }
            Err(exception) => {
                self.stats.exceptions += 1;

                logging::debug!(self.log, "request refused";
                                "context" => "dispatch",
                                "function" => pdu[0],
                                "exception" => exception.code());

                vec![pdu[0] | EXCEPTION_FLAG, exception.code()]
            }
        };

        let mut response = Vec::with_capacity(response_pdu.len() + 3);
        response.push(self.address);
        response.extend_from_slice(&response_pdu);
        finish_frame(&mut response);

        Ok(Some(response))
    }

    fn dispatch(&mut self, pdu: &[u8]) -> Result<Vec<u8>, Exception> {
        match pdu[0] {
            function::READ_COILS => self.read_bits(pdu, false),
            function::READ_DISCRETE_INPUTS => self.read_bits(pdu, true),
            function::READ_HOLDING_REGISTERS => self.read_words(pdu, false),
            function::READ_INPUT_REGISTERS => self.read_words(pdu, true),
            function::WRITE_SINGLE_COIL => self.write_single_coil(pdu),
            function::WRITE_SINGLE_REGISTER => self.write_single_register(pdu),
            function::WRITE_MULTIPLE_COILS => self.write_multiple_coils(pdu),
            function::WRITE_MULTIPLE_REGISTERS => self.write_multiple_registers(pdu),
            _ => Err(Exception::IllegalFunction),
        }
    }

    fn read_bits(&mut self, pdu: &[u8], discrete: bool) -> Result<Vec<u8>, Exception> {
        let (start, quantity) = read_request_fields(pdu)?;

        if quantity == 0 || quantity > MAX_READ_COILS {
            return Err(Exception::IllegalDataValue);
        }

        check_span(start, quantity)?;

        let bank = if discrete {
            &mut self.map.discrete_inputs
        } else {
            &mut self.map.coils
        };

        let mut bits = Vec::with_capacity(quantity as usize);

        for offset in 0..quantity {
            let mut bit = false;
            bank.coil(start + offset, &mut bit, false)?;
            bits.push(bit);
        }

        let mut response = vec![pdu[0], ((quantity + 7) / 8) as u8];
        pack_bits(&bits, &mut response);

        Ok(response)
    }

    fn read_words(&mut self, pdu: &[u8], input: bool) -> Result<Vec<u8>, Exception> {
        let (start, quantity) = read_request_fields(pdu)?;

        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(Exception::IllegalDataValue);
        }

        check_span(start, quantity)?;

        let bank = if input {
            &mut self.map.inputs
        } else {
            &mut self.map.holding
        };

        let mut response = vec![pdu[0], (quantity * 2) as u8];

        for offset in 0..quantity {
            let mut word = 0u16;
            bank.register(start + offset, &mut word, false)?;
            response.extend_from_slice(&word.to_be_bytes());
        }

        Ok(response)
    }

    fn write_single_coil(&mut self, pdu: &[u8]) -> Result<Vec<u8>, Exception> {
        let (addr, encoded) = read_request_fields(pdu)?;

        let mut value = match encoded {
            0x0000 => false,
            0xFF00 => true,
            _ => return Err(Exception::IllegalDataValue),
        };

        self.map.coils.coil(addr, &mut value, true)?;

        // The response echoes the request
        Ok(pdu.to_vec())
    }

    fn write_single_register(&mut self, pdu: &[u8]) -> Result<Vec<u8>, Exception> {
        let (addr, mut value) = read_request_fields(pdu)?;

        self.map.holding.register(addr, &mut value, true)?;

        Ok(pdu.to_vec())
    }

    fn write_multiple_coils(&mut self, pdu: &[u8]) -> Result<Vec<u8>, Exception> {
        let (start, quantity) = read_request_fields(pdu)?;

        if quantity == 0 || quantity > MAX_WRITE_COILS {
            return Err(Exception::IllegalDataValue);
        }

        check_span(start, quantity)?;

        let data_bytes = (quantity as usize + 7) / 8;

        if pdu.len() != 6 + data_bytes || pdu[5] as usize != data_bytes {
            return Err(Exception::IllegalDataValue);
        }

        // Probe the whole span before mutating so a partial failure cannot
        // leave the bank half-written
        let bank = &mut self.map.coils;

        for offset in 0..quantity {
            let mut probe = false;
            bank.coil(start + offset, &mut probe, false)?;
        }

        for offset in 0..quantity {
            let index = offset as usize;
            let mut bit = pdu[6 + index / 8] & (1 << (index % 8)) != 0;
            bank.coil(start + offset, &mut bit, true)?;
        }

        Ok(pdu[..5].to_vec())
    }

    fn write_multiple_registers(&mut self, pdu: &[u8]) -> Result<Vec<u8>, Exception> {
        let (start, quantity) = read_request_fields(pdu)?;

        if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
            return Err(Exception::IllegalDataValue);
        }

        check_span(start, quantity)?;

        let data_bytes = quantity as usize * 2;

        if pdu.len() != 6 + data_bytes || pdu[5] as usize != data_bytes {
            return Err(Exception::IllegalDataValue);
        }

        let bank = &mut self.map.holding;

        for offset in 0..quantity {
            let mut probe = 0u16;
            bank.register(start + offset, &mut probe, false)?;
        }

        for offset in 0..quantity {
            let index = 6 + offset as usize * 2;
            let mut word = BigEndian::read_u16(&pdu[index..index + 2]);
            bank.register(start + offset, &mut word, true)?;
        }

        Ok(pdu[..5].to_vec())
    }
}

fn read_request_fields(pdu: &[u8]) -> Result<(u16, u16), Exception> {
    if pdu.len() < 5 {
        return Err(Exception::IllegalDataValue);
    }

    Ok((
        BigEndian::read_u16(&pdu[1..3]),
        BigEndian::read_u16(&pdu[3..5]),
    ))
}

fn check_span(start: u16, quantity: u16) -> Result<(), Exception> {
    if u32::from(start) + u32::from(quantity) > 0x1_0000 {
        return Err(Exception::IllegalDataAddress);
    }

    Ok(())
}
