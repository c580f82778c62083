use std::fmt::{Display, Formatter};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("helicity decoder is not initialized")]
    NotInitialized,
    #[error("nothing addressable at A24 0x{a24:06X}")]
    NotPresent { a24: u32 },
    #[error("no helicity decoder found in slots 3 through 20")]
    NotFound,
    #[error("board at A24 0x{a24:06X} has type 0x{board_type:04X}, not a helicity decoder")]
    WrongDevice { a24: u32, board_type: u32 },
    #[error("firmware version 0x{found:02X} not supported (expected 0x{supported:02X})")]
    UnsupportedFirmware { found: u32, supported: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("timed out waiting for {what} after {polls} polls")]
    Timeout { what: &'static str, polls: u32 },
    #[error("invalid block header 0x{0:08X}")]
    InvalidHeader(u32),
    #[error("data ran out after {words} words without a block trailer")]
    Truncated { words: usize },
    #[error("DMA transfer failed with status {0}")]
    Dma(i64),
    #[error("firmware image exceeds {max} bytes")]
    ImageTooLarge { max: usize },
    #[error("no firmware image loaded")]
    NoImage,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("EEPROM verification failed at {mismatches} addresses")]
    VerificationFailed { mismatches: usize },
    #[error("bus access failed: {0}")]
    Bus(eyre::Report),
}

impl From<eyre::Report> for Error {
    fn from(value: eyre::Report) -> Self {
        Self::Bus(value)
    }
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("trigger time continuation 0x{word:08X} does not follow a trigger time word")]
    OrphanTriggerTime { word: u32 },
    #[error("decoder run at index {index} with {remaining} words left overflows the capture buffer")]
    InvalidState { index: u8, remaining: u8 },
}

/// A condition worth reporting that does not abort the operation raising it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    SourceClamped {
        signal: &'static str,
        requested: u8,
    },
    FirmwareIgnored {
        found: u32,
        supported: u32,
    },
    DelayMismatch {
        delay: &'static str,
        programmed: u32,
        measured: u32,
    },
    VerifyMismatch {
        address: u32,
        expected: u8,
        actual: u8,
    },
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::SourceClamped { signal, requested } => {
                write!(f, "invalid {signal} source ({requested}), set to internal")
            }
            Self::FirmwareIgnored { found, supported } => write!(
                f,
                "firmware version 0x{found:02X} not supported (expected 0x{supported:02X}), ignored"
            ),
            Self::DelayMismatch {
                delay,
                programmed,
                measured,
            } => write!(
                f,
                "{delay} delay programmed as 0x{programmed:03X} but measured 0x{measured:03X}"
            ),
            Self::VerifyMismatch {
                address,
                expected,
                actual,
            } => write!(
                f,
                "EEPROM mismatch at 0x{address:06X}: expected 0x{expected:02X}, read 0x{actual:02X}"
            ),
        }
    }
}
