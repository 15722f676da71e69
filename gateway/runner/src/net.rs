//! Plain-TCP backend for the sync client's dialer capability. TLS, when
//! required, is layered outside (a wrapping dialer or a local proxy).

use flint::time::Deadline;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Instant;
use uplink::net::{Dialer, NetStream};

pub struct TcpDialer;

impl TcpDialer {
    pub fn new() -> TcpDialer {
        TcpDialer
    }
}

pub struct TcpNetStream {
    stream: TcpStream,
}

impl io::Read for TcpNetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl io::Write for TcpNetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl NetStream for TcpNetStream {
    fn set_deadline(&mut self, deadline: Deadline) -> io::Result<()> {
        let remaining = deadline.remaining(Instant::now());

        if remaining.as_millis() == 0 {
            return Err(io::ErrorKind::TimedOut.into());
        }

        self.stream.set_read_timeout(Some(remaining))?;
        self.stream.set_write_timeout(Some(remaining))
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpNetStream;

    fn connect(&mut self, host: &str, port: u16, deadline: Deadline) -> io::Result<TcpNetStream> {
        let remaining = deadline.remaining(Instant::now());

        if remaining.as_millis() == 0 {
            return Err(io::ErrorKind::TimedOut.into());
        }

        let address = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;

        let stream = TcpStream::connect_timeout(&address, remaining)?;

        Ok(TcpNetStream { stream })
    }
}
