//! CONTEXT: Benchmark support for the NoC mailbox facility
//! INTENT: Ready-made facilities and channel pairs on the host NoC simulation
//! IDL (target): facility(nodes, local), loopback_pair(facility, port), roundtrip(facility, pair, payload)
//! DEPS: neuron-noc (facility), nexus-hal sim (driver)
//! READINESS: Library; no service dependencies
//! TESTS: Loopback pair round-trips a payload
use std::sync::Arc;

use neuron_noc::config::MSG_SIZE;
use neuron_noc::{Error, Facility, Result, UserBuffer, VmbxId, WaitStatus};
use nexus_hal::sim::{SimNetwork, SimNode};
use nexus_hal::Hal;

/// Input and output channel bound to the same local address.
#[derive(Clone, Copy, Debug)]
pub struct Pair {
    pub input: VmbxId,
    pub output: VmbxId,
}

/// Builds an initialised facility for `local` on a fresh network of `nodes`.
pub fn facility(nodes: usize, local: usize) -> (Arc<SimNetwork>, Facility<SimNode>) {
    let net = SimNetwork::new(nodes);
    let facility = Facility::new(net.node(local));
    facility.init();
    (net, facility)
}

/// Creates a loopback channel pair on `port` of the local node.
pub fn loopback_pair(facility: &Facility<SimNode>, port: usize) -> Result<Pair> {
    let node = facility.hal().node_num();
    let input = facility.create(node, port)?;
    let output = facility.open(node, port)?;
    Ok(Pair { input, output })
}

/// Writes `payload` through `pair` and reads it back into `out`.
pub fn roundtrip(
    facility: &Facility<SimNode>,
    pair: Pair,
    payload: &[u8; MSG_SIZE],
    out: &mut [u8; MSG_SIZE],
) -> Result<WaitStatus> {
    facility.awrite(pair.output, payload)?;
    facility.wait(pair.output)?;
    // SAFETY: `out` is exclusively borrowed until the wait below returns.
    let buffer = unsafe { UserBuffer::from_raw_parts(out.as_mut_ptr(), out.len()) }.ok_or(Error::Invalid)?;
    facility.aread(pair.input, buffer)?;
    facility.wait(pair.input)
}
