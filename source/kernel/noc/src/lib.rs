// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

//! CONTEXT: NEURON network-on-chip mailbox facility
//! OWNERS: @kernel-noc-team
//! PUBLIC API: Facility, VmbxId, Address, Error, WaitStatus, IoctlRequest, UserBuffer, kcall
//! DEPENDS_ON: nexus-hal (driver, timer, fence), nexus-resource (slot pools), spin, log
//! INVARIANTS: Fixed-size tables only (no allocator); handles are table indices;
//!             failure paths never log or panic, only `Facility::init` treats errors as fatal
//! ADR: docs/adr/0025-noc-virtual-mailboxes.md
//!
//! A small set of hardware mailboxes (one input for this node, one output per peer) is
//! multiplexed into many virtual mailboxes through per-mailbox port tables. Transfers are
//! issued asynchronously and completed by `wait`; messages that land on the wrong port are
//! kept in the buffer pool for their rightful reader.

pub mod address;
pub mod config;
pub mod error;
pub mod frame;
pub mod kcall;
pub mod mailbox;
pub mod mbuffer;
pub mod vmailbox;

pub use address::{Address, BufferId, MailboxId, VmbxId};
pub use error::{Error, Result};
pub use vmailbox::{Endpoint, Facility, IoctlRequest, Stats, UserBuffer, VmbxState, WaitStatus};

/// `log` target used by every record of this crate.
pub const LOG_TARGET: &str = "kernel::noc";

/// Emits a per-transfer trace record when `trace-transfers` is enabled.
macro_rules! trace_transfer {
    ($($arg:tt)*) => {{
        #[cfg(feature = "trace-transfers")]
        log::trace!(target: $crate::LOG_TARGET, $($arg)*);
    }};
}

pub(crate) use trace_transfer;
