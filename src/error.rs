use std::io;

/// Error taxonomy of the driver stack.
///
/// Device-reported command errors, transport failures, and host-side misuse
/// all funnel into this one enum so callers get a single surface to match on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter")]
    InvalidParam,

    #[error("out of memory")]
    OutOfMemory,

    #[error("device busy")]
    DeviceBusy,

    #[error("not a supported device or protocol version")]
    DeviceUnsupported,

    #[error("device failure")]
    DeviceFailure,

    #[error("device gone")]
    Gone,

    #[error("malformed message: {0}")]
    ProtocolViolation(&'static str),

    #[error("chunk sequence violation: expected {expected}, got {actual}")]
    SequenceViolation { expected: u16, actual: u16 },

    #[error("timed out")]
    Timeout,

    #[error("configuration access denied")]
    AccessDenied,

    #[error("aborted")]
    Aborted,

    #[error("no bit timing solution")]
    NoSolution,

    #[error("not implemented by device")]
    NotImplemented,

    #[error("unknown device error")]
    Unknown,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<usb_bulk_async::UsbAsyncError> for Error {
    fn from(err: usb_bulk_async::UsbAsyncError) -> Self {
        let err: io::Error = err.into();
        match err.kind() {
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::NotConnected => Error::Gone,
            io::ErrorKind::BrokenPipe => Error::DeviceFailure,
            _ => Error::Io(err),
        }
    }
}

impl Error {
    /// True if the device has been removed and no retry can succeed.
    pub fn is_gone(&self) -> bool {
        matches!(self, Error::Gone)
    }

    /// Rebuild an error from a code carried over the control channel or a
    /// ring header. Variants with payloads come back as their plain kind.
    pub fn from_code(code: i32) -> Error {
        match code {
            1 => Error::InvalidParam,
            2 => Error::OutOfMemory,
            3 => Error::DeviceBusy,
            4 => Error::DeviceUnsupported,
            5 => Error::DeviceFailure,
            6 => Error::Gone,
            7 => Error::ProtocolViolation("remote"),
            9 => Error::Timeout,
            10 => Error::AccessDenied,
            11 => Error::Aborted,
            12 => Error::NoSolution,
            13 => Error::NotImplemented,
            _ => Error::Unknown,
        }
    }

    /// Stable numeric code published through the client ring `error` field.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidParam => 1,
            Error::OutOfMemory => 2,
            Error::DeviceBusy => 3,
            Error::DeviceUnsupported => 4,
            Error::DeviceFailure => 5,
            Error::Gone => 6,
            Error::ProtocolViolation(_) => 7,
            Error::SequenceViolation { .. } => 8,
            Error::Timeout => 9,
            Error::AccessDenied => 10,
            Error::Aborted => 11,
            Error::NoSolution => 12,
            Error::NotImplemented => 13,
            Error::Unknown => -1,
            Error::Io(_) => 14,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
