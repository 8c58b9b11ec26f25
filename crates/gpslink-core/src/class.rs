//! Classification of transport connect failures.
//!
//! The mapping is keyed on the OS error code the transport reports,
//! never on error message text.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Class of a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Remote is reachable but nothing listens on the channel.
    RefusedNoService,
    /// Remote is not reachable at the link layer.
    UnreachableHost,
    /// Local transport handle is unusable (e.g. after an abrupt failure).
    TransportBadState,
    /// Connect did not complete before its deadline.
    Timeout,
    /// Anything else.
    Unclassified,
}

impl ErrorClass {
    /// Classifies a raw OS error number.
    pub fn from_raw_os_error(code: i32) -> Self {
        match code {
            libc::ECONNREFUSED => Self::RefusedNoService,
            libc::EHOSTDOWN | libc::EHOSTUNREACH => Self::UnreachableHost,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            libc::EBADFD => Self::TransportBadState,
            libc::EBADF => Self::TransportBadState,
            libc::ETIMEDOUT => Self::Timeout,
            _ => Self::Unclassified,
        }
    }

    /// Classifies an I/O error, preferring the OS code over the portable kind.
    pub fn from_io_error(error: &io::Error) -> Self {
        if let Some(code) = error.raw_os_error() {
            return Self::from_raw_os_error(code);
        }
        match error.kind() {
            io::ErrorKind::ConnectionRefused => Self::RefusedNoService,
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Unclassified,
        }
    }

    /// True when the remote device is absent and other channels cannot help.
    pub fn is_host_absent(self) -> bool {
        self == Self::UnreachableHost
    }

    /// Diagnostic tag form (e.g. `REFUSED_NO_SERVICE`).
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::RefusedNoService => "REFUSED_NO_SERVICE",
            Self::UnreachableHost => "UNREACHABLE_HOST",
            Self::TransportBadState => "TRANSPORT_BAD_STATE",
            Self::Timeout => "TIMEOUT",
            Self::Unclassified => "UNCLASSIFIED",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}
