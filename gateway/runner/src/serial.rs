//! Serial backend for the bus capability. A reader thread drains the UART
//! as bytes arrive and funnels them through a lock-free queue; the main
//! loop pulls from that queue with deadlines and never touches the device
//! from more than one place.

use ferrite::bus::BusPort;
use flint::spsc;
use flint::time::Deadline;
use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

const INGRESS_CAPACITY: usize = 8192;
const READER_POLL: Duration = Duration::from_millis(5);
const DRAIN_SLEEP: Duration = Duration::from_millis(1);

pub struct SerialBusPort {
    port: Box<dyn SerialPort>,
    ingress: spsc::Consumer<u8>,
}

impl SerialBusPort {
    pub fn open(path: &str, baud: u32, parity: char) -> serialport::Result<SerialBusPort> {
        let parity = match parity {
            'E' => Parity::Even,
            'O' => Parity::Odd,
            _ => Parity::None,
        };

        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(parity)
            .stop_bits(StopBits::One)
            .timeout(READER_POLL)
            .open()?;

        let reader = port.try_clone()?;
        let (producer, consumer) = spsc::funnel(INGRESS_CAPACITY);

        thread::spawn(move || reader_loop(reader, producer));

        Ok(SerialBusPort {
            port,
            ingress: consumer,
        })
    }
}

fn reader_loop(mut reader: Box<dyn SerialPort>, producer: spsc::Producer<u8>) {
    let mut chunk = [0u8; 256];

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => (),
            Ok(received) => {
                for &byte in &chunk[..received] {
                    // A full queue means the main loop stalled; dropping
                    // bytes here reads as a framing error upstream, which
                    // the parser already resynchronizes from
                    let _ = producer.push(byte);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(_) => return,
        }
    }
}

impl BusPort for SerialBusPort {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn recv(&mut self, buf: &mut [u8], deadline: Deadline) -> io::Result<usize> {
        loop {
            let mut count = 0;

            while count < buf.len() {
                match self.ingress.pop() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }

            if count > 0 {
                return Ok(count);
            }

            if deadline.expired(Instant::now()) {
                return Ok(0);
            }

            thread::sleep(DRAIN_SLEEP);
        }
    }
}
