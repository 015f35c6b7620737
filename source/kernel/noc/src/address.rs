// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address arithmetic and table handles
//! OWNERS: @kernel-noc-team
//! PUBLIC API: Address, VmbxId, MailboxId, BufferId
//! DEPENDS_ON: config
//! INVARIANTS: Address = node * PORT_MAX + port; VmbxId = mailbox * PORT_MAX + port;
//!             handles are plain indices, never pointers

use core::fmt;

use nexus_hal::NodeNum;

use crate::config::{MBUFFER_MAX, NODES_MAX, PORT_MAX, VMAILBOX_MAX};
use crate::error::{Error, Result};

/// Logical address of a port on a node, also stamped as message destination.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u32);

impl Address {
    /// Composes `(node, port)`; both must be inside the configured topology.
    pub fn compose(node: NodeNum, port: usize) -> Result<Self> {
        if node >= NODES_MAX || port >= PORT_MAX {
            return Err(Error::Invalid);
        }
        Ok(Self((node * PORT_MAX + port) as u32))
    }

    /// Decodes a wire value; out-of-range values are rejected.
    pub fn from_raw(raw: u32) -> Option<Self> {
        ((raw as usize) < NODES_MAX * PORT_MAX).then_some(Self(raw))
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn node(self) -> NodeNum {
        self.0 as usize / PORT_MAX
    }

    #[inline]
    pub const fn port(self) -> usize {
        self.0 as usize % PORT_MAX
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node(), self.port())
    }
}

/// Index into the hardware mailbox registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MailboxId(pub(crate) usize);

impl MailboxId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Index into the message buffer pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) usize);

impl BufferId {
    pub(crate) fn new(index: usize) -> Option<Self> {
        (index < MBUFFER_MAX).then_some(Self(index))
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Handle of a virtual mailbox, as returned to callers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmbxId(usize);

impl VmbxId {
    pub(crate) const fn compose(mailbox: MailboxId, port: usize) -> Self {
        Self(mailbox.0 * PORT_MAX + port)
    }

    /// Validates a raw handle coming from a caller.
    pub fn from_raw(raw: usize) -> Result<Self> {
        if raw < VMAILBOX_MAX {
            Ok(Self(raw))
        } else {
            Err(Error::BadDescriptor)
        }
    }

    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn mailbox(self) -> MailboxId {
        MailboxId(self.0 / PORT_MAX)
    }

    #[inline]
    pub const fn port(self) -> usize {
        self.0 % PORT_MAX
    }
}
