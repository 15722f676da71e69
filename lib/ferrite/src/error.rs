use std::io;

pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors on the bus side of the gateway. `Wait` is the quiescent arm: the
/// operation needs more bus traffic (or more time) before it can make
/// progress and the caller should come back later. Everything that actually
/// went wrong is a `Fatal` carrying the error kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtoError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Byte stream violated the framing rules; the receiver resynchronizes.
    Framing,
    /// Frame checksum did not match its contents.
    Crc,
    PayloadTooLarge,
    /// Receive buffer overran because the producer outpaced the parser.
    Overrun,
    /// No valid reply arrived within the response deadline, retries included.
    Timeout,
    /// Peer refused the request with a NACK.
    Nack(NackReason),
    /// Message type with no registered handler.
    UnknownType,
    /// Modbus function code the peer does not implement.
    UnknownFunction,
    IllegalDataAddress,
    IllegalDataValue,
    /// Modbus exception outside the three standard classes above.
    Exception(u8),
    /// Two devices claim the same bus address.
    AddressConflict,
    Io(io::ErrorKind),
}

/// Reason codes carried in NACK payloads.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NackReason {
    Crc,
    UnknownType,
    Malformed,
    Busy,
    Unknown(u8),
}

impl NackReason {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            NackReason::Crc => 0x01,
            NackReason::UnknownType => 0x02,
            NackReason::Malformed => 0x03,
            NackReason::Busy => 0x04,
            NackReason::Unknown(code) => code,
        }
    }

    #[inline]
    pub fn from_code(code: u8) -> NackReason {
        match code {
            0x01 => NackReason::Crc,
            0x02 => NackReason::UnknownType,
            0x03 => NackReason::Malformed,
            0x04 => NackReason::Busy,
            code => NackReason::Unknown(code),
        }
    }
}

impl From<io::Error> for ProtoError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ProtoError::Wait,
            kind => ProtoError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for ProtoResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(ProtoError::Wait) => false,
            _ => true,
        }
    }
}
