// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the virtual mailbox facility
//! OWNERS: @kernel-noc-team
//! NOTE: Tests only; no kernel logic. Runs against the host NoC simulation.
//!
//! TEST_SCOPE:
//!   - Address uniqueness across arbitrary create/open/unlink/close sequences
//!   - Port reference counting on hardware mailboxes
//!   - Loopback transfers never reach the driver and preserve payload bytes
//!   - Kept messages are neither lost nor duplicated
//!
//! TEST_SCENARIOS:
//!   - live_ids_are_unique(): random lifecycle sequences keep ids unique and refcounts exact
//!   - loopback_roundtrip(): any payload on any port round-trips without driver calls
//!   - kept_messages_drain_exactly(): k looped-back messages are read back as the same multiset

use super::{Facility, UserBuffer, VmbxState, WaitStatus};
use crate::address::VmbxId;
use crate::config::{MBUFFER_MAX, MSG_SIZE, PORT_MAX};
use nexus_hal::sim::{SimNetwork, SimNode};
use proptest::prelude::*;

const NODES: usize = 3;
const LOCAL: usize = 1;

#[derive(Clone, Debug)]
enum Op {
    Create(usize),
    Open(usize, usize),
    Release(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PORT_MAX + 2).prop_map(Op::Create),
        (0..NODES, 0..PORT_MAX).prop_map(|(node, port)| Op::Open(node, port)),
        any::<usize>().prop_map(Op::Release),
    ]
}

fn facility() -> Facility<SimNode> {
    let facility = Facility::new(SimNetwork::new(NODES).node(LOCAL));
    facility.init();
    facility
}

fn read(facility: &Facility<SimNode>, id: VmbxId) -> [u8; MSG_SIZE] {
    let mut out = [0u8; MSG_SIZE];
    let buffer = unsafe { UserBuffer::from_raw_parts(out.as_mut_ptr(), out.len()) }.unwrap();
    facility.aread(id, buffer).unwrap();
    assert_eq!(facility.wait(id).unwrap(), WaitStatus::Done);
    out
}

proptest! {
    #[test]
    fn live_ids_are_unique(ops in proptest::collection::vec(arb_op(), 1..64)) {
        let facility = facility();
        let mut live: Vec<(VmbxId, bool)> = Vec::new();

        for op in ops {
            match op {
                Op::Create(port) => {
                    if let Ok(id) = facility.create(LOCAL, port) {
                        live.push((id, true));
                    } else {
                        prop_assert!(port >= PORT_MAX || live.iter().any(|(id, input)| *input && id.port() == port));
                    }
                }
                Op::Open(node, port) => {
                    if let Ok(id) = facility.open(node, port) {
                        live.push((id, false));
                    }
                }
                Op::Release(pick) => {
                    if !live.is_empty() {
                        let (id, input) = live.swap_remove(pick % live.len());
                        let released = if input { facility.unlink(id) } else { facility.close(id) };
                        prop_assert!(released.is_ok());
                        prop_assert_eq!(facility.state(id), VmbxState::Closed);
                    }
                }
            }

            for (i, (id, _)) in live.iter().enumerate() {
                prop_assert!(live[i + 1..].iter().all(|(other, _)| other != id));
                prop_assert_eq!(facility.state(*id), VmbxState::Idle);
                let bound = live.iter().filter(|(other, _)| other.mailbox() == id.mailbox()).count();
                prop_assert_eq!(facility.mailbox_refcount(*id).unwrap(), bound);
            }
        }
    }

    #[test]
    fn loopback_roundtrip(port in 0..PORT_MAX, payload in proptest::collection::vec(any::<u8>(), MSG_SIZE)) {
        let facility = facility();
        let net = facility.hal().network().clone();
        let calls = net.calls(LOCAL);

        let input = facility.create(LOCAL, port).unwrap();
        let output = facility.open(LOCAL, port).unwrap();
        prop_assert_eq!(facility.awrite(output, &payload).unwrap(), MSG_SIZE);
        prop_assert_eq!(facility.state(output), VmbxState::Done);
        prop_assert_eq!(facility.wait(output).unwrap(), WaitStatus::Done);

        prop_assert_eq!(&read(&facility, input)[..], &payload[..]);
        prop_assert_eq!(net.calls(LOCAL), calls);
        prop_assert_eq!(facility.buffers_in_use(), 0);
    }

    #[test]
    fn kept_messages_drain_exactly(count in 1..=MBUFFER_MAX, seed in any::<u8>()) {
        let facility = facility();
        let input = facility.create(LOCAL, 0).unwrap();
        let output = facility.open(LOCAL, 0).unwrap();

        let mut written: Vec<u8> = Vec::new();
        for i in 0..count {
            let tag = seed.wrapping_add(i as u8);
            facility.awrite(output, &[tag; MSG_SIZE]).unwrap();
            facility.wait(output).unwrap();
            written.push(tag);
        }
        prop_assert_eq!(facility.buffers_in_use(), count);

        let mut received: Vec<u8> = (0..count).map(|_| read(&facility, input)[0]).collect();
        written.sort_unstable();
        received.sort_unstable();
        prop_assert_eq!(received, written);
        prop_assert_eq!(facility.buffers_in_use(), 0);
    }
}
