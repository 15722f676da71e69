//! Scripted bus fixtures shared by the protocol engine tests.

use crate::bus::{Arbiter, BusPort, BusTiming};
use flint::time::{Clock, Deadline};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Manually advanced clock shared between the port mock and the arbiter.
#[derive(Clone)]
pub struct TestClock {
    now: Rc<Cell<Instant>>,
    epoch: Rc<Cell<u64>>,
}

impl TestClock {
    pub fn new() -> TestClock {
        TestClock {
            now: Rc::new(Cell::new(Instant::now())),
            epoch: Rc::new(Cell::new(1_700_000_000)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }

    pub fn jump_to(&self, instant: Instant) {
        self.now.set(instant);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn timestamp_secs(&self) -> u64 {
        self.epoch.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Scripted half-duplex port: `recv` serves the queued chunks in order,
/// then reports silence by jumping the clock to the deadline.
pub struct MockPort {
    pub script: RefCell<VecDeque<Vec<u8>>>,
    pub sent: Vec<Vec<u8>>,
    clock: TestClock,
}

impl MockPort {
    pub fn new(clock: TestClock) -> MockPort {
        MockPort {
            script: RefCell::new(VecDeque::new()),
            sent: Vec::new(),
            clock,
        }
    }

    pub fn queue(&self, chunk: Vec<u8>) {
        self.script.borrow_mut().push_back(chunk);
    }
}

impl BusPort for MockPort {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sent.push(bytes.to_vec());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], deadline: Deadline) -> io::Result<usize> {
        let mut script = self.script.borrow_mut();

        match script.pop_front() {
            Some(mut chunk) => {
                self.clock.advance(Duration::from_micros(100));
                let size = chunk.len().min(buf.len());
                buf[..size].copy_from_slice(&chunk[..size]);

                // Requeue what did not fit so nothing is lost
                if size < chunk.len() {
                    chunk.drain(..size);
                    script.push_front(chunk);
                }

                Ok(size)
            }
            None => {
                self.clock.jump_to(deadline.instant());
                Ok(0)
            }
        }
    }
}

pub fn rig(baud: u32) -> Arbiter<MockPort, TestClock> {
    let clock = TestClock::new();
    let port = MockPort::new(clock.clone());

    Arbiter::new(port, BusTiming::from_baud(baud), clock)
}

pub fn sent(bus: &Arbiter<MockPort, TestClock>) -> &[Vec<u8>] {
    &bus.port().sent
}
