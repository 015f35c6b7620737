// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error taxonomy of the mailbox facility
//! OWNERS: @kernel-noc-team
//! PUBLIC API: Error, Result
//! DEPENDS_ON: nexus_hal::HwError, nexus_resource::PoolError
//! INVARIANTS: Driver failures are carried verbatim in `Error::Hardware`

use core::fmt;

use nexus_hal::HwError;
use nexus_resource::PoolError;

/// Result alias used across the facility.
pub type Result<T> = core::result::Result<T, Error>;

/// Error returned by mailbox operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad node, port, address or parameter.
    Invalid,
    /// Transient exhaustion (hardware mailbox, port or buffer); retry later.
    Again,
    /// Address already in use or transfer in flight.
    Busy,
    /// Unused, wrong-direction or inconsistent channel.
    BadDescriptor,
    /// Unknown ioctl request.
    NotSupported,
    /// Low-level driver failure.
    Hardware(HwError),
}

impl Error {
    /// Negative errno reported to callers of the kernel-call surface.
    pub const fn errno(self) -> isize {
        match self {
            Self::Invalid => -22,
            Self::Again => -11,
            Self::Busy => -16,
            Self::BadDescriptor => -9,
            Self::NotSupported => -95,
            Self::Hardware(err) => err.errno(),
        }
    }
}

impl From<HwError> for Error {
    fn from(value: HwError) -> Self {
        Self::Hardware(value)
    }
}

impl From<PoolError> for Error {
    fn from(value: PoolError) -> Self {
        match value {
            PoolError::Exhausted => Self::Again,
            PoolError::OutOfRange | PoolError::NotInUse => Self::Invalid,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid argument"),
            Self::Again => write!(f, "resource temporarily unavailable"),
            Self::Busy => write!(f, "mailbox busy"),
            Self::BadDescriptor => write!(f, "bad mailbox descriptor"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Hardware(err) => write!(f, "hardware mailbox: {err}"),
        }
    }
}
