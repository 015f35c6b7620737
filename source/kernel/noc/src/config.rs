// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Compile-time geometry of the mailbox tables.

use nexus_hal::HW_MAILBOX_MSG_SIZE;
use static_assertions::{const_assert, const_assert_eq};

/// Maximum number of nodes addressable on the NoC.
pub const NODES_MAX: usize = 16;

/// Logical ports multiplexed on every hardware mailbox.
pub const PORT_MAX: usize = 16;

/// Payload carried by one message.
pub const MSG_SIZE: usize = 64;

/// Bytes of destination header in front of every payload on the wire.
pub const HEADER_SIZE: usize = 4;

/// Message buffers shared by every transfer on this node.
pub const MBUFFER_MAX: usize = 32;

/// One input mailbox for the local node plus one output mailbox per node.
pub const HW_MAILBOX_MAX: usize = NODES_MAX + 1;

/// Virtual mailboxes: one per (hardware mailbox, port) pair.
pub const VMAILBOX_MAX: usize = HW_MAILBOX_MAX * PORT_MAX;

const_assert_eq!(HEADER_SIZE + MSG_SIZE, HW_MAILBOX_MSG_SIZE);
const_assert!(PORT_MAX > 0 && NODES_MAX > 0);
const_assert!(MBUFFER_MAX > 0);
// Composed addresses travel as u32 on the wire, u32::MAX marks "no destination".
const_assert!(NODES_MAX * PORT_MAX < u32::MAX as usize);
