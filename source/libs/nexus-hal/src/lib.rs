// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "sim")), no_std)]

//! CONTEXT: Hardware abstraction consumed by the NoC mailbox facility
//! OWNERS: @kernel-noc-team
//! PUBLIC API: MailboxHw, Timer, Fence, CoherentFence, Hal, HwFd, HwError, HwMessage
//! DEPENDS_ON: core (no_std); parking_lot (feature `sim`)
//! INVARIANTS: One hardware message is exactly HW_MAILBOX_MSG_SIZE bytes; driver calls never
//!             block except `MailboxHw::wait`
//! ADR: docs/adr/0016-kernel-libs-architecture.md

use core::fmt;
use core::sync::atomic::{fence, Ordering};

#[cfg(feature = "sim")]
pub mod sim;

/// Logic number of a NoC node.
pub type NodeNum = usize;

/// Size of one hardware mailbox message in bytes.
pub const HW_MAILBOX_MSG_SIZE: usize = 68;

/// Raw hardware mailbox message.
pub type HwMessage = [u8; HW_MAILBOX_MSG_SIZE];

/// Descriptor handed out by the mailbox driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HwFd(u32);

impl HwFd {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Failures reported by the mailbox driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwError {
    /// Node number not addressable from this core.
    InvalidNode,
    /// Descriptor unknown or used in the wrong direction.
    BadDescriptor,
    /// Endpoint already exists.
    Busy,
    /// Driver ran out of hardware descriptors.
    Exhausted,
    /// Wait issued without a matching asynchronous operation.
    NotArmed,
    /// Transfer failed on the interconnect.
    Io,
}

impl HwError {
    /// Negative errno reported for this failure.
    pub const fn errno(self) -> isize {
        match self {
            Self::InvalidNode => -22,
            Self::BadDescriptor => -9,
            Self::Busy => -16,
            Self::Exhausted => -11,
            Self::NotArmed => -125,
            Self::Io => -5,
        }
    }
}

impl fmt::Display for HwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNode => write!(f, "invalid noc node"),
            Self::BadDescriptor => write!(f, "bad mailbox descriptor"),
            Self::Busy => write!(f, "mailbox endpoint busy"),
            Self::Exhausted => write!(f, "no hardware mailbox available"),
            Self::NotArmed => write!(f, "no asynchronous operation to wait for"),
            Self::Io => write!(f, "interconnect transfer failed"),
        }
    }
}

/// Low-level hardware mailbox driver.
///
/// `aread`/`awrite` only issue the operation; completion is observed through `wait`, which
/// fills `msg` for input descriptors and leaves it untouched for output descriptors.
pub trait MailboxHw {
    /// Creates the input endpoint of `local`.
    fn create(&self, local: NodeNum) -> Result<HwFd, HwError>;
    /// Opens an output endpoint towards `remote`.
    fn open(&self, remote: NodeNum) -> Result<HwFd, HwError>;
    /// Arms an asynchronous receive on an input endpoint.
    fn aread(&self, fd: HwFd) -> Result<(), HwError>;
    /// Starts an asynchronous send of `msg`; the driver copies the message.
    fn awrite(&self, fd: HwFd, msg: &HwMessage) -> Result<(), HwError>;
    /// Blocks until the oldest outstanding operation on `fd` completes.
    fn wait(&self, fd: HwFd, msg: &mut HwMessage) -> Result<(), HwError>;
}

/// Abstraction for a monotonic timer.
pub trait Timer {
    /// Returns the current time in nanoseconds.
    fn now(&self) -> u64;
}

/// Memory coherence barrier between cores sharing kernel tables.
pub trait Fence {
    /// Makes local writes to shared tables visible to other cores.
    fn publish(&self);
    /// Discards stale copies before reading state published by other cores.
    fn refresh(&self);
}

/// Fence for platforms with coherent shared memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoherentFence;

impl Fence for CoherentFence {
    #[inline]
    fn publish(&self) {
        fence(Ordering::Release);
    }

    #[inline]
    fn refresh(&self) {
        fence(Ordering::Acquire);
    }
}

/// Collection of devices the NoC facility runs on.
pub trait Hal {
    type Mailbox: MailboxHw;
    type Timer: Timer;
    type Fence: Fence;

    fn mailbox(&self) -> &Self::Mailbox;
    fn timer(&self) -> &Self::Timer;
    fn fence(&self) -> &Self::Fence;

    /// Logic number of the node this kernel runs on.
    fn node_num(&self) -> NodeNum;

    /// Number of nodes in the NoC topology.
    fn node_count(&self) -> usize;

    #[inline]
    fn node_is_local(&self, node: NodeNum) -> bool {
        node == self.node_num()
    }
}

#[cfg(test)]
mod tests {
    use super::{CoherentFence, Fence, HwError, HwFd};

    #[test]
    fn fd_roundtrip() {
        assert_eq!(HwFd::from_raw(7).as_raw(), 7);
    }

    #[test]
    fn errno_is_negative() {
        for err in [
            HwError::InvalidNode,
            HwError::BadDescriptor,
            HwError::Busy,
            HwError::Exhausted,
            HwError::NotArmed,
            HwError::Io,
        ] {
            assert!(err.errno() < 0);
        }
    }

    #[test]
    fn coherent_fence_is_callable() {
        let fence = CoherentFence;
        fence.publish();
        fence.refresh();
    }
}
