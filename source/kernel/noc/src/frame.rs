// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware mailbox frame: 4-byte little-endian destination followed by the payload.

use nexus_hal::{HwMessage, HW_MAILBOX_MSG_SIZE};

use crate::address::Address;
use crate::config::{HEADER_SIZE, MSG_SIZE};

/// Wire value of a frame without destination.
pub const DEST_NONE: u32 = u32::MAX;

/// One message as staged in a buffer slot and carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub dest: Option<Address>,
    pub payload: [u8; MSG_SIZE],
}

impl Frame {
    /// Frame with no destination and a zeroed payload.
    pub const EMPTY: Self = Self { dest: None, payload: [0; MSG_SIZE] };

    pub const fn new(dest: Address, payload: [u8; MSG_SIZE]) -> Self {
        Self { dest: Some(dest), payload }
    }

    /// Resets the frame to [`Frame::EMPTY`].
    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }

    /// Serialises the frame to the fixed-size hardware message.
    pub fn encode(&self) -> HwMessage {
        let mut raw = [0u8; HW_MAILBOX_MSG_SIZE];
        let dest = self.dest.map_or(DEST_NONE, Address::as_raw);
        raw[..HEADER_SIZE].copy_from_slice(&dest.to_le_bytes());
        raw[HEADER_SIZE..].copy_from_slice(&self.payload);
        raw
    }

    /// Deserialises a hardware message; unknown destinations decode as `None`.
    pub fn decode(raw: &HwMessage) -> Self {
        let dest = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let mut payload = [0u8; MSG_SIZE];
        payload.copy_from_slice(&raw[HEADER_SIZE..]);
        Self { dest: Address::from_raw(dest), payload }
    }
}

#[cfg(test)]
mod tests {
    use super::{Frame, DEST_NONE};
    use crate::address::Address;
    use crate::config::MSG_SIZE;

    const VECTOR: &[u8; 68] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/vectors/noc_frame_v1.bin"));

    fn counting_payload() -> [u8; MSG_SIZE] {
        let mut payload = [0u8; MSG_SIZE];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = i as u8;
        }
        payload
    }

    #[test]
    fn golden_vector_roundtrip() {
        // node 1, port 2 -> raw 18
        let frame = Frame::new(Address::compose(1, 2).unwrap(), counting_payload());
        assert_eq!(&frame.encode(), VECTOR);
        assert_eq!(Frame::decode(VECTOR), frame);
    }

    #[test]
    fn missing_destination_encodes_as_sentinel() {
        let raw = Frame::EMPTY.encode();
        assert_eq!(raw[..4], DEST_NONE.to_le_bytes());
        assert_eq!(Frame::decode(&raw), Frame::EMPTY);
    }
}
