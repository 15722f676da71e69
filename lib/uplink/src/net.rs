use flint::time::Deadline;
use std::io;

/// Byte-stream transport capability. Whether the bytes cross plain TCP or
/// a TLS session is the integrator's choice; the client only needs connect
/// plus deadline-bounded reads and writes.
pub trait NetStream: io::Read + io::Write {
    /// Bounds all subsequent reads and writes. Implementations report
    /// expiry as `TimedOut`.
    fn set_deadline(&mut self, deadline: Deadline) -> io::Result<()>;
}

pub trait Dialer {
    type Stream: NetStream;

    fn connect(&mut self, host: &str, port: u16, deadline: Deadline) -> io::Result<Self::Stream>;
}
