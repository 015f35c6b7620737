// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host simulation of a network-on-chip with one mailbox inbox per node
//! OWNERS: @kernel-noc-team
//! PUBLIC API: SimNetwork, SimNode, SimOp, DriverCalls
//! DEPENDS_ON: std, parking_lot::{Mutex, Condvar}
//! INVARIANTS: Writes are delivered to the remote inbox before `awrite` returns; `wait` on an
//!             input descriptor blocks until a frame is queued for its node; every driver entry
//!             point bumps the calling node's counters, including failed calls

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{CoherentFence, Hal, HwError, HwFd, HwMessage, MailboxHw, NodeNum, Timer};

/// Nanoseconds the simulated clock advances per read.
pub const SIM_TICK_NS: u64 = 10;

/// Driver entry points, used for counters and fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimOp {
    Create,
    Open,
    Aread,
    Awrite,
    Wait,
}

/// Number of driver calls issued by one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverCalls {
    pub creates: usize,
    pub opens: usize,
    pub areads: usize,
    pub awrites: usize,
    pub waits: usize,
}

impl DriverCalls {
    pub fn total(&self) -> usize {
        self.creates + self.opens + self.areads + self.awrites + self.waits
    }

    fn bump(&mut self, op: SimOp) {
        match op {
            SimOp::Create => self.creates += 1,
            SimOp::Open => self.opens += 1,
            SimOp::Aread => self.areads += 1,
            SimOp::Awrite => self.awrites += 1,
            SimOp::Wait => self.waits += 1,
        }
    }
}

#[derive(Clone, Copy)]
enum EndpointKind {
    Input,
    Output { remote: NodeNum },
}

struct SimEndpoint {
    owner: NodeNum,
    kind: EndpointKind,
    outstanding: usize,
}

#[derive(Default)]
struct NodeState {
    inbox: VecDeque<HwMessage>,
    input: Option<HwFd>,
    calls: DriverCalls,
    fault: Option<SimOp>,
}

struct NetState {
    nodes: Vec<NodeState>,
    endpoints: Vec<SimEndpoint>,
}

/// Simulated interconnect shared by every [`SimNode`].
pub struct SimNetwork {
    state: Mutex<NetState>,
    delivered: Condvar,
    clock: AtomicU64,
}

impl SimNetwork {
    /// Builds a network of `nodes` cores with empty inboxes.
    pub fn new(nodes: usize) -> Arc<Self> {
        let nodes = (0..nodes).map(|_| NodeState::default()).collect();
        Arc::new(Self {
            state: Mutex::new(NetState { nodes, endpoints: Vec::new() }),
            delivered: Condvar::new(),
            clock: AtomicU64::new(0),
        })
    }

    /// Returns the HAL view of `node`.
    pub fn node(self: &Arc<Self>, node: NodeNum) -> SimNode {
        SimNode { net: Arc::clone(self), node, fence: CoherentFence }
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Driver calls issued so far by `node`.
    pub fn calls(&self, node: NodeNum) -> DriverCalls {
        self.state.lock().nodes.get(node).map(|n| n.calls).unwrap_or_default()
    }

    /// Frames queued for `node` and not yet consumed by a wait.
    pub fn pending(&self, node: NodeNum) -> usize {
        self.state.lock().nodes.get(node).map_or(0, |n| n.inbox.len())
    }

    /// Makes the next `op` issued by `node` fail with [`HwError::Io`].
    pub fn fail_next(&self, node: NodeNum, op: SimOp) {
        if let Some(state) = self.state.lock().nodes.get_mut(node) {
            state.fault = Some(op);
        }
    }

    /// Queues a raw frame for `node` as if it came off the wire.
    pub fn inject(&self, node: NodeNum, msg: HwMessage) {
        let mut state = self.state.lock();
        if let Some(target) = state.nodes.get_mut(node) {
            target.inbox.push_back(msg);
            self.delivered.notify_all();
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(SIM_TICK_NS, Ordering::Relaxed) + SIM_TICK_NS
    }
}

impl NetState {
    /// Accounts the call and consumes a pending injected fault.
    fn enter(&mut self, node: NodeNum, op: SimOp) -> Result<(), HwError> {
        let state = self.nodes.get_mut(node).ok_or(HwError::InvalidNode)?;
        state.calls.bump(op);
        if state.fault == Some(op) {
            state.fault = None;
            return Err(HwError::Io);
        }
        Ok(())
    }

    fn endpoint(&mut self, node: NodeNum, fd: HwFd) -> Result<&mut SimEndpoint, HwError> {
        self.endpoints
            .get_mut(fd.as_raw() as usize)
            .filter(|ep| ep.owner == node)
            .ok_or(HwError::BadDescriptor)
    }

    fn push_endpoint(&mut self, owner: NodeNum, kind: EndpointKind) -> Result<HwFd, HwError> {
        let raw = u32::try_from(self.endpoints.len()).map_err(|_| HwError::Exhausted)?;
        self.endpoints.push(SimEndpoint { owner, kind, outstanding: 0 });
        Ok(HwFd::from_raw(raw))
    }
}

/// One core of a [`SimNetwork`].
#[derive(Clone)]
pub struct SimNode {
    net: Arc<SimNetwork>,
    node: NodeNum,
    fence: CoherentFence,
}

impl SimNode {
    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.net
    }
}

impl MailboxHw for SimNode {
    fn create(&self, local: NodeNum) -> Result<HwFd, HwError> {
        let mut state = self.net.state.lock();
        state.enter(self.node, SimOp::Create)?;
        if local != self.node {
            return Err(HwError::InvalidNode);
        }
        if state.nodes[local].input.is_some() {
            return Err(HwError::Busy);
        }
        let fd = state.push_endpoint(local, EndpointKind::Input)?;
        state.nodes[local].input = Some(fd);
        Ok(fd)
    }

    fn open(&self, remote: NodeNum) -> Result<HwFd, HwError> {
        let mut state = self.net.state.lock();
        state.enter(self.node, SimOp::Open)?;
        if remote >= state.nodes.len() {
            return Err(HwError::InvalidNode);
        }
        state.push_endpoint(self.node, EndpointKind::Output { remote })
    }

    fn aread(&self, fd: HwFd) -> Result<(), HwError> {
        let mut state = self.net.state.lock();
        state.enter(self.node, SimOp::Aread)?;
        let endpoint = state.endpoint(self.node, fd)?;
        match endpoint.kind {
            EndpointKind::Input => {
                endpoint.outstanding += 1;
                Ok(())
            }
            EndpointKind::Output { .. } => Err(HwError::BadDescriptor),
        }
    }

    fn awrite(&self, fd: HwFd, msg: &HwMessage) -> Result<(), HwError> {
        let mut state = self.net.state.lock();
        state.enter(self.node, SimOp::Awrite)?;
        let endpoint = state.endpoint(self.node, fd)?;
        let EndpointKind::Output { remote } = endpoint.kind else {
            return Err(HwError::BadDescriptor);
        };
        endpoint.outstanding += 1;
        state.nodes[remote].inbox.push_back(*msg);
        self.net.delivered.notify_all();
        Ok(())
    }

    fn wait(&self, fd: HwFd, msg: &mut HwMessage) -> Result<(), HwError> {
        let mut state = self.net.state.lock();
        state.enter(self.node, SimOp::Wait)?;
        let endpoint = state.endpoint(self.node, fd)?;
        if endpoint.outstanding == 0 {
            return Err(HwError::NotArmed);
        }
        endpoint.outstanding -= 1;
        if let EndpointKind::Output { .. } = endpoint.kind {
            return Ok(());
        }
        loop {
            if let Some(frame) = state.nodes[self.node].inbox.pop_front() {
                *msg = frame;
                return Ok(());
            }
            self.net.delivered.wait(&mut state);
        }
    }
}

impl Timer for SimNode {
    fn now(&self) -> u64 {
        self.net.tick()
    }
}

impl Hal for SimNode {
    type Mailbox = Self;
    type Timer = Self;
    type Fence = CoherentFence;

    fn mailbox(&self) -> &Self::Mailbox {
        self
    }

    fn timer(&self) -> &Self::Timer {
        self
    }

    fn fence(&self) -> &Self::Fence {
        &self.fence
    }

    fn node_num(&self) -> NodeNum {
        self.node
    }

    fn node_count(&self) -> usize {
        self.net.node_count()
    }
}
