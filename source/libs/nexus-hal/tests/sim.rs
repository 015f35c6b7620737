//! CONTEXT: Tests for the host network-on-chip simulation
//! OWNERS: @kernel-noc-team
//! STATUS: Functional
//! API_STABILITY: Unstable (test support)
//! TEST_COVERAGE: 5 integration tests
//!
//! TEST_SCOPE:
//!   - Endpoint creation rules (one input per node, outputs to any node)
//!   - Frame delivery and blocking wait
//!   - Driver call accounting and fault injection
//!
//! TEST_SCENARIOS:
//!   - awrite_delivers_to_remote_inbox(): a frame written on node 0 is read on node 1
//!   - create_is_exclusive_per_node(): second input endpoint is refused
//!   - wait_requires_outstanding_operation(): waits without aread/awrite are rejected
//!   - injected_fault_is_one_shot(): one failing open, then success
//!   - wait_blocks_until_delivery(): receiver parked in wait wakes on delivery
//!
//! DEPENDENCIES:
//!   - nexus_hal::sim::{SimNetwork, SimOp}
//!
//! ADR: docs/adr/0016-kernel-libs-architecture.md
use nexus_hal::sim::{SimNetwork, SimOp};
use nexus_hal::{Hal, HwError, HwMessage, MailboxHw, Timer, HW_MAILBOX_MSG_SIZE};

fn pattern(seed: u8) -> HwMessage {
    let mut msg = [0u8; HW_MAILBOX_MSG_SIZE];
    for (i, byte) in msg.iter_mut().enumerate() {
        *byte = seed.wrapping_add(i as u8);
    }
    msg
}

#[test]
fn awrite_delivers_to_remote_inbox() {
    let net = SimNetwork::new(2);
    let sender = net.node(0);
    let receiver = net.node(1);

    let out = sender.mailbox().open(1).unwrap();
    sender.mailbox().awrite(out, &pattern(3)).unwrap();
    assert_eq!(net.pending(1), 1);
    sender.mailbox().wait(out, &mut [0u8; HW_MAILBOX_MSG_SIZE]).unwrap();

    let input = receiver.mailbox().create(1).unwrap();
    receiver.mailbox().aread(input).unwrap();
    let mut msg = [0u8; HW_MAILBOX_MSG_SIZE];
    receiver.mailbox().wait(input, &mut msg).unwrap();
    assert_eq!(msg, pattern(3));
    assert_eq!(net.pending(1), 0);

    let calls = net.calls(0);
    assert_eq!((calls.opens, calls.awrites, calls.waits), (1, 1, 1));
    assert_eq!(net.calls(1).total(), 3);
}

#[test]
fn create_is_exclusive_per_node() {
    let net = SimNetwork::new(3);
    let node = net.node(2);
    assert!(node.mailbox().create(2).is_ok());
    assert_eq!(node.mailbox().create(2), Err(HwError::Busy));
    assert_eq!(node.mailbox().create(1), Err(HwError::InvalidNode));
    assert_eq!(node.mailbox().open(3), Err(HwError::InvalidNode));
    assert_eq!(node.node_count(), 3);
    assert!(node.node_is_local(2));
}

#[test]
fn wait_requires_outstanding_operation() {
    let net = SimNetwork::new(2);
    let node = net.node(0);
    let input = node.mailbox().create(0).unwrap();
    let out = node.mailbox().open(1).unwrap();
    let mut msg = [0u8; HW_MAILBOX_MSG_SIZE];
    assert_eq!(node.mailbox().wait(input, &mut msg), Err(HwError::NotArmed));
    assert_eq!(node.mailbox().wait(out, &mut msg), Err(HwError::NotArmed));
    assert_eq!(node.mailbox().aread(out), Err(HwError::BadDescriptor));
    assert_eq!(node.mailbox().awrite(input, &msg), Err(HwError::BadDescriptor));

    // Descriptors are private to the node that obtained them.
    assert_eq!(net.node(1).mailbox().aread(input), Err(HwError::BadDescriptor));
}

#[test]
fn injected_fault_is_one_shot() {
    let net = SimNetwork::new(2);
    let node = net.node(0);
    net.fail_next(0, SimOp::Open);
    assert_eq!(node.mailbox().open(1), Err(HwError::Io));
    assert!(node.mailbox().open(1).is_ok());
    assert_eq!(net.calls(0).opens, 2);

    let before = node.timer().now();
    assert!(node.timer().now() > before);
}

#[test]
fn wait_blocks_until_delivery() {
    let net = SimNetwork::new(2);
    let receiver = net.node(1);
    let sender = net.node(0);
    let input = receiver.mailbox().create(1).unwrap();
    receiver.mailbox().aread(input).unwrap();

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            let mut msg = [0u8; HW_MAILBOX_MSG_SIZE];
            receiver.mailbox().wait(input, &mut msg).map(|()| msg)
        });
        let out = sender.mailbox().open(1).unwrap();
        sender.mailbox().awrite(out, &pattern(9)).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(pattern(9)));
    });
}
