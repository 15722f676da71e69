use std::io;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreError {
    /// Capacity exhausted with only critical data left to protect. The
    /// store keeps accepting critical records and rejects the rest.
    Full,
    /// Integrity failure that recovery could not explain away, with a short
    /// description of what did not add up.
    Corrupt(&'static str),
    Compression,
    /// Record larger than the on-disk framing can carry.
    TooLarge,
    /// Storage configuration out of bounds, rejected at open.
    Config,
    Io(io::ErrorKind),
}

impl From<io::Error> for StoreError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        StoreError::Io(io_error.kind())
    }
}
