//! Error codes, the per-thread error value, and the crate error type.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask of error kinds. Kinds combine, e.g. `SOCKET | RECV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCode(u64);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);
    /// Socket timeout.
    pub const TIMEOUT: ErrorCode = ErrorCode(1 << 1);
    pub const WARN: ErrorCode = ErrorCode(1 << 2);
    /// Socket disconnect.
    pub const SOCKET: ErrorCode = ErrorCode(1 << 3);
    pub const SEND: ErrorCode = ErrorCode(1 << 4);
    pub const RECV: ErrorCode = ErrorCode(1 << 5);
    /// System call failure.
    pub const SYS: ErrorCode = ErrorCode(1 << 6);
    /// Runtime failure.
    pub const RT: ErrorCode = ErrorCode(1 << 7);
    pub const MEM: ErrorCode = ErrorCode(1 << 8);
    pub const FATAL: ErrorCode = ErrorCode(1 << 9);

    const NAMES: [(ErrorCode, &'static str); 9] = [
        (Self::TIMEOUT, "TIMEOUT"),
        (Self::WARN, "WARN"),
        (Self::SOCKET, "SOCKET"),
        (Self::SEND, "SEND"),
        (Self::RECV, "RECV"),
        (Self::SYS, "SYS"),
        (Self::RT, "RT"),
        (Self::MEM, "MEM"),
        (Self::FATAL, "FATAL"),
    ];

    pub const fn from_bits(bits: u64) -> Self {
        ErrorCode(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// True if every kind in `other` is also set in `self`.
    pub const fn contains(self, other: ErrorCode) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// True if `self` and `other` share at least one kind.
    pub const fn intersects(self, other: ErrorCode) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ErrorCode {
    type Output = ErrorCode;

    fn bitor(self, rhs: ErrorCode) -> ErrorCode {
        ErrorCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorCode {
    fn bitor_assign(&mut self, rhs: ErrorCode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return f.write_str("SUCCESS");
        }
        let mut first = true;
        for (code, name) in Self::NAMES {
            if self.contains(code) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            write!(f, "0x{:x}", self.0)?;
        }
        Ok(())
    }
}

/// Last error recorded on a thread. `text` is `None` after a success event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorValue {
    pub code: ErrorCode,
    pub text: Option<String>,
}

impl ErrorValue {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// Allocation failure reported by an [`AllocHooks`](crate::env::AllocHooks) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("failed to allocate {requested} bytes")]
pub struct AllocError {
    pub requested: usize,
}

/// Errors returned by fallible operations. Every error is also recorded in
/// the calling thread's environment before it is returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("socket disconnected: {0}")]
    Disconnected(String),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),
    #[error("{context}: {source}")]
    Sys {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Memory(#[from] AllocError),
    #[error("{0}")]
    Runtime(String),
}

impl Error {
    pub fn sys(context: impl Into<String>, source: io::Error) -> Self {
        Error::Sys {
            context: context.into(),
            source,
        }
    }

    /// Error kind bitmask recorded in the environment for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Timeout(_) => ErrorCode::TIMEOUT,
            Error::Disconnected(_) => ErrorCode::SOCKET,
            Error::Send(_) => ErrorCode::SOCKET | ErrorCode::SEND,
            Error::Recv(_) => ErrorCode::SOCKET | ErrorCode::RECV,
            Error::Sys { .. } => ErrorCode::SYS,
            Error::Tls(_) => ErrorCode::SYS,
            Error::InvalidArgument(_) => ErrorCode::RT,
            Error::Memory(_) => ErrorCode::MEM,
            Error::Runtime(_) => ErrorCode::RT,
        }
    }

    /// Record this error in the thread environment and hand it back.
    pub fn report(self) -> Self {
        crate::env::submit_error(self.code(), self.to_string());
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;
