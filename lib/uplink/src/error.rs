use std::io;
use strata::StoreError;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncError {
    /// Credential missing or rejected; uploads pause until a handshake
    /// succeeds. The cursor never advances on this path.
    AuthRequired,
    /// Transient; retry with backoff while preserving the batch id.
    Retryable(RetryCause),
    /// Unrecoverable; the scheduler pauses the sync subsystem.
    Fatal(FatalCause),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetryCause {
    Status(u16),
    Network(io::ErrorKind),
    Timeout,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FatalCause {
    /// Response body exceeded the fixed receive budget. Surfaced instead of
    /// silently discarding the tail.
    OversizedBody,
    /// Response was not parseable as HTTP/1.1.
    Malformed,
    /// Response parsed but its payload was missing required fields.
    BadPayload,
    /// The storage engine failed underneath the sync path.
    Storage(StoreError),
}

impl From<io::Error> for SyncError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                SyncError::Retryable(RetryCause::Timeout)
            }
            kind => SyncError::Retryable(RetryCause::Network(kind)),
        }
    }
}

impl From<StoreError> for SyncError {
    #[inline]
    fn from(store_error: StoreError) -> Self {
        SyncError::Fatal(FatalCause::Storage(store_error))
    }
}
