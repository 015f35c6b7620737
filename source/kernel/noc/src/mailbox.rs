// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware mailbox registry and per-mailbox port tables
//! OWNERS: @kernel-noc-team
//! PUBLIC API: Registry, HwMailbox, Direction
//! DEPENDS_ON: nexus_hal::MailboxHw, nexus_resource::ResourcePool
//! INVARIANTS: At most one input mailbox per local node and one output mailbox per remote node;
//!             refcount equals the number of bound ports; a loopback output owns no descriptor;
//!             a port sits in the write-request queue at most once and only while requested;
//!             descriptors persist until the registry owner releases the slot
//! ADR: docs/adr/0025-noc-virtual-mailboxes.md

use nexus_hal::{HwFd, MailboxHw, NodeNum};
use nexus_resource::{Pooled, Resource, ResourcePool};

use crate::address::{BufferId, MailboxId};
use crate::config::{HW_MAILBOX_MAX, PORT_MAX};
use crate::error::{Error, Result};

/// Direction of a hardware mailbox, fixed when the slot is set up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Clone, Copy)]
struct Port {
    resource: Resource,
    buffer: Option<BufferId>,
    requested: bool,
}

const PORT_FREE: Port = Port { resource: Resource::INIT, buffer: None, requested: false };

/// Ports waiting for their turn on an output mailbox, oldest first.
#[derive(Clone, Copy)]
struct RequestQueue {
    ports: [usize; PORT_MAX],
    head: usize,
    len: usize,
}

const QUEUE_EMPTY: RequestQueue = RequestQueue { ports: [0; PORT_MAX], head: 0, len: 0 };

impl RequestQueue {
    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % PORT_MAX
    }

    fn push(&mut self, port: usize) -> Result<()> {
        if self.len == PORT_MAX {
            return Err(Error::Busy);
        }
        let tail = self.slot(self.len);
        self.ports[tail] = port;
        self.len += 1;
        Ok(())
    }

    fn front(&self) -> Option<usize> {
        (self.len != 0).then(|| self.ports[self.head])
    }

    /// Drops `port` wherever it is queued; later requests keep their order.
    fn remove(&mut self, port: usize) {
        let Some(at) = (0..self.len).find(|&i| self.ports[self.slot(i)] == port) else {
            return;
        };
        for i in at..self.len - 1 {
            self.ports[self.slot(i)] = self.ports[self.slot(i + 1)];
        }
        self.len -= 1;
    }
}

/// One physical mailbox endpoint.
#[derive(Clone, Copy)]
pub struct HwMailbox {
    resource: Resource,
    fd: Option<HwFd>,
    node: NodeNum,
    refcount: usize,
    ports: [Port; PORT_MAX],
    requests: RequestQueue,
}

impl Pooled for HwMailbox {
    fn resource(&self) -> &Resource {
        &self.resource
    }

    fn resource_mut(&mut self) -> &mut Resource {
        &mut self.resource
    }
}

const MAILBOX_FREE: HwMailbox = HwMailbox {
    resource: Resource::INIT,
    fd: None,
    node: 0,
    refcount: 0,
    ports: [PORT_FREE; PORT_MAX],
    requests: QUEUE_EMPTY,
};

impl HwMailbox {
    pub fn direction(&self) -> Direction {
        if self.resource.is_readable() {
            Direction::Input
        } else {
            Direction::Output
        }
    }

    /// Driver descriptor; `None` for the loopback output.
    #[inline]
    pub fn fd(&self) -> Option<HwFd> {
        self.fd
    }

    #[inline]
    pub fn node(&self) -> NodeNum {
        self.node
    }

    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    #[inline]
    pub fn is_loopback(&self) -> bool {
        self.direction() == Direction::Output && self.fd.is_none()
    }

    /// A driver operation is outstanding on the descriptor.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.resource.is_busy()
    }

    pub fn port_in_use(&self, port: usize) -> bool {
        self.ports.get(port).map_or(false, |p| p.resource.is_used())
    }

    /// Buffer bound to `port` for the current transfer.
    pub fn port_buffer(&self, port: usize) -> Option<BufferId> {
        self.ports.get(port).and_then(|p| p.buffer)
    }

    /// `port` has a write request queued.
    pub fn is_requested(&self, port: usize) -> bool {
        self.ports.get(port).map_or(false, |p| p.requested)
    }

    /// `port` is at the head of the write-request queue.
    pub fn is_turn(&self, port: usize) -> bool {
        self.requests.front() == Some(port)
    }

    /// Number of queued write requests.
    pub fn queued(&self) -> usize {
        self.requests.len
    }

    fn reset(&mut self, node: NodeNum, fd: Option<HwFd>) {
        self.fd = fd;
        self.node = node;
        self.refcount = 0;
        self.ports = [PORT_FREE; PORT_MAX];
        self.requests = QUEUE_EMPTY;
    }
}

/// Registry of hardware mailboxes opened by this kernel.
pub struct Registry {
    mailboxes: ResourcePool<HwMailbox, HW_MAILBOX_MAX>,
}

impl Registry {
    pub const fn new() -> Self {
        Self { mailboxes: ResourcePool::new([MAILBOX_FREE; HW_MAILBOX_MAX]) }
    }

    /// Creates the input mailbox of `local` through the driver.
    pub fn create<M: MailboxHw>(&mut self, hw: &M, local: NodeNum) -> Result<MailboxId> {
        if self.find_input(local).is_some() {
            return Err(Error::Busy);
        }
        let index = self.mailboxes.alloc()?;
        let fd = match hw.create(local) {
            Ok(fd) => fd,
            Err(err) => {
                self.mailboxes.free(index)?;
                return Err(err.into());
            }
        };
        let mailbox = self.mailboxes.get_used_mut(index)?;
        mailbox.reset(local, Some(fd));
        mailbox.resource.set_rdonly();
        mailbox.resource.set_notbusy();
        Ok(MailboxId(index))
    }

    /// Returns the output mailbox to `remote`, opening it on first use.
    ///
    /// The loopback output (`loopback == true`) never asks the driver for a descriptor.
    pub fn open<M: MailboxHw>(
        &mut self,
        hw: &M,
        remote: NodeNum,
        loopback: bool,
    ) -> Result<MailboxId> {
        if let Some(id) = self.find_output(remote) {
            return Ok(id);
        }
        let index = self.mailboxes.alloc()?;
        let fd = if loopback {
            None
        } else {
            match hw.open(remote) {
                Ok(fd) => Some(fd),
                Err(err) => {
                    self.mailboxes.free(index)?;
                    return Err(err.into());
                }
            }
        };
        let mailbox = self.mailboxes.get_used_mut(index)?;
        mailbox.reset(remote, fd);
        mailbox.resource.set_wronly();
        mailbox.resource.set_notbusy();
        Ok(MailboxId(index))
    }

    /// Recycles an unreferenced registry slot.
    pub fn release(&mut self, id: MailboxId) -> Result<()> {
        let mailbox = self.get(id)?;
        if mailbox.refcount != 0 {
            return Err(Error::Busy);
        }
        self.mailboxes.free(id.index())?;
        Ok(())
    }

    pub fn find_input(&self, local: NodeNum) -> Option<MailboxId> {
        self.mailboxes
            .position(|mbx| mbx.resource.is_readable() && mbx.node == local)
            .map(MailboxId)
    }

    pub fn find_output(&self, remote: NodeNum) -> Option<MailboxId> {
        self.mailboxes
            .position(|mbx| mbx.resource.is_writable() && mbx.node == remote)
            .map(MailboxId)
    }

    /// Resolves a used slot; anything else is a bad descriptor.
    pub fn get(&self, id: MailboxId) -> Result<&HwMailbox> {
        self.mailboxes.get_used(id.index()).map_err(|_| Error::BadDescriptor)
    }

    fn get_mut(&mut self, id: MailboxId) -> Result<&mut HwMailbox> {
        self.mailboxes.get_used_mut(id.index()).map_err(|_| Error::BadDescriptor)
    }

    /// Binds the first free port; `Again` when every port is taken.
    pub fn port_alloc(&mut self, id: MailboxId) -> Result<usize> {
        let mailbox = self.get_mut(id)?;
        if mailbox.refcount >= PORT_MAX {
            return Err(Error::Again);
        }
        let port = mailbox
            .ports
            .iter()
            .position(|p| !p.resource.is_used())
            .ok_or(Error::Again)?;
        mailbox.bind(port);
        Ok(port)
    }

    /// Binds a specific port; `Busy` if it is already bound.
    pub fn port_bind(&mut self, id: MailboxId, port: usize) -> Result<()> {
        let mailbox = self.get_mut(id)?;
        let slot = mailbox.ports.get(port).ok_or(Error::Invalid)?;
        if slot.resource.is_used() {
            return Err(Error::Busy);
        }
        mailbox.bind(port);
        Ok(())
    }

    /// Unbinds `port` and drops one reference on the mailbox.
    pub fn port_release(&mut self, id: MailboxId, port: usize) -> Result<()> {
        let mailbox = self.get_mut(id)?;
        let slot = mailbox.ports.get_mut(port).ok_or(Error::BadDescriptor)?;
        if !slot.resource.is_used() || slot.buffer.is_some() || slot.requested {
            return Err(Error::BadDescriptor);
        }
        *slot = PORT_FREE;
        mailbox.refcount -= 1;
        Ok(())
    }

    /// Attaches (or detaches with `None`) the transfer buffer of a bound port.
    pub fn set_port_buffer(
        &mut self,
        id: MailboxId,
        port: usize,
        buffer: Option<BufferId>,
    ) -> Result<()> {
        let mailbox = self.get_mut(id)?;
        let slot = mailbox.ports.get_mut(port).ok_or(Error::BadDescriptor)?;
        if !slot.resource.is_used() {
            return Err(Error::BadDescriptor);
        }
        slot.buffer = buffer;
        Ok(())
    }

    /// Queues a write request for `port` unless it already has one.
    pub fn request(&mut self, id: MailboxId, port: usize) -> Result<()> {
        let mailbox = self.get_mut(id)?;
        let slot = mailbox.ports.get(port).ok_or(Error::BadDescriptor)?;
        if !slot.resource.is_used() {
            return Err(Error::BadDescriptor);
        }
        if !slot.requested {
            mailbox.requests.push(port)?;
            mailbox.ports[port].requested = true;
        }
        Ok(())
    }

    /// Removes the write request of `port`, if any.
    pub fn withdraw(&mut self, id: MailboxId, port: usize) -> Result<()> {
        let mailbox = self.get_mut(id)?;
        let slot = mailbox.ports.get_mut(port).ok_or(Error::BadDescriptor)?;
        if slot.requested {
            slot.requested = false;
            mailbox.requests.remove(port);
        }
        Ok(())
    }

    /// Flags the descriptor as having an outstanding driver operation.
    pub fn set_busy(&mut self, id: MailboxId, busy: bool) -> Result<()> {
        let resource = &mut self.get_mut(id)?.resource;
        if busy {
            resource.set_busy();
        } else {
            resource.set_notbusy();
        }
        Ok(())
    }

    /// Number of registry slots in use.
    pub fn used(&self) -> usize {
        self.mailboxes.used()
    }
}

impl HwMailbox {
    fn bind(&mut self, port: usize) {
        let slot = &mut self.ports[port];
        *slot = PORT_FREE;
        slot.resource.set_used();
        self.refcount += 1;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, Registry};
    use crate::address::BufferId;
    use crate::config::PORT_MAX;
    use crate::error::Error;
    use core::cell::Cell;
    use nexus_hal::{HwError, HwFd, HwMessage, MailboxHw, NodeNum};

    #[derive(Default)]
    struct MockHw {
        next: Cell<u32>,
        opens: Cell<usize>,
        fail: Cell<bool>,
    }

    impl MockHw {
        fn issue(&self) -> Result<HwFd, HwError> {
            if self.fail.replace(false) {
                return Err(HwError::Io);
            }
            let fd = self.next.get();
            self.next.set(fd + 1);
            Ok(HwFd::from_raw(fd))
        }
    }

    impl MailboxHw for MockHw {
        fn create(&self, _local: NodeNum) -> Result<HwFd, HwError> {
            self.issue()
        }

        fn open(&self, _remote: NodeNum) -> Result<HwFd, HwError> {
            self.opens.set(self.opens.get() + 1);
            self.issue()
        }

        fn aread(&self, _fd: HwFd) -> Result<(), HwError> {
            Ok(())
        }

        fn awrite(&self, _fd: HwFd, _msg: &HwMessage) -> Result<(), HwError> {
            Ok(())
        }

        fn wait(&self, _fd: HwFd, _msg: &mut HwMessage) -> Result<(), HwError> {
            Ok(())
        }
    }

    #[test]
    fn one_input_per_node() {
        let hw = MockHw::default();
        let mut registry = Registry::new();
        let id = registry.create(&hw, 0).unwrap();
        assert_eq!(registry.get(id).unwrap().direction(), Direction::Input);
        assert_eq!(registry.create(&hw, 0), Err(Error::Busy));
        assert_eq!(registry.find_input(0), Some(id));
    }

    #[test]
    fn open_reuses_output_without_driver() {
        let hw = MockHw::default();
        let mut registry = Registry::new();
        let first = registry.open(&hw, 3, false).unwrap();
        let second = registry.open(&hw, 3, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(hw.opens.get(), 1);

        let loopback = registry.open(&hw, 0, true).unwrap();
        assert!(registry.get(loopback).unwrap().is_loopback());
        assert_eq!(hw.opens.get(), 1);
    }

    #[test]
    fn driver_failure_frees_the_slot() {
        let hw = MockHw::default();
        let mut registry = Registry::new();
        hw.fail.set(true);
        assert_eq!(registry.open(&hw, 1, false), Err(Error::Hardware(HwError::Io)));
        assert_eq!(registry.used(), 0);
        hw.fail.set(true);
        assert_eq!(registry.create(&hw, 0), Err(Error::Hardware(HwError::Io)));
        assert_eq!(registry.used(), 0);
    }

    #[test]
    fn ports_track_refcount() {
        let hw = MockHw::default();
        let mut registry = Registry::new();
        let id = registry.open(&hw, 1, false).unwrap();
        for expected in 0..PORT_MAX {
            assert_eq!(registry.port_alloc(id), Ok(expected));
        }
        assert_eq!(registry.port_alloc(id), Err(Error::Again));
        assert_eq!(registry.get(id).unwrap().refcount(), PORT_MAX);
        assert_eq!(registry.release(id), Err(Error::Busy));

        registry.port_release(id, 4).unwrap();
        assert_eq!(registry.port_alloc(id), Ok(4));
        assert_eq!(registry.port_bind(id, 4), Err(Error::Busy));
    }

    #[test]
    fn write_requests_are_served_in_order() {
        let hw = MockHw::default();
        let mut registry = Registry::new();
        let id = registry.open(&hw, 1, false).unwrap();
        for _ in 0..3 {
            registry.port_alloc(id).unwrap();
        }
        assert_eq!(registry.request(id, 5), Err(Error::BadDescriptor));

        registry.request(id, 2).unwrap();
        registry.request(id, 0).unwrap();
        registry.request(id, 2).unwrap();
        registry.request(id, 1).unwrap();
        let mailbox = registry.get(id).unwrap();
        assert_eq!(mailbox.queued(), 3);
        assert!(mailbox.is_turn(2));
        assert!(!mailbox.is_turn(0));

        // A requested port is pinned until its request goes away.
        assert_eq!(registry.port_release(id, 0), Err(Error::BadDescriptor));
        registry.withdraw(id, 0).unwrap();
        assert!(!registry.get(id).unwrap().is_requested(0));
        registry.withdraw(id, 2).unwrap();
        assert!(registry.get(id).unwrap().is_turn(1));
        registry.withdraw(id, 1).unwrap();
        assert_eq!(registry.get(id).unwrap().queued(), 0);
        registry.port_release(id, 0).unwrap();
    }

    #[test]
    fn request_queue_wraps() {
        let hw = MockHw::default();
        let mut registry = Registry::new();
        let id = registry.open(&hw, 1, false).unwrap();
        for _ in 0..PORT_MAX {
            registry.port_alloc(id).unwrap();
        }
        for round in 0..3 * PORT_MAX {
            let port = round % PORT_MAX;
            let next = (round + 1) % PORT_MAX;
            registry.request(id, port).unwrap();
            registry.request(id, next).unwrap();
            assert!(registry.get(id).unwrap().is_turn(port));
            registry.withdraw(id, port).unwrap();
            assert!(registry.get(id).unwrap().is_turn(next));
            registry.withdraw(id, next).unwrap();
        }
        for port in 0..PORT_MAX {
            registry.request(id, port).unwrap();
        }
        assert_eq!(registry.get(id).unwrap().queued(), PORT_MAX);
        assert!(registry.get(id).unwrap().is_turn(0));
    }

    #[test]
    fn port_with_buffer_cannot_be_released() {
        let hw = MockHw::default();
        let mut registry = Registry::new();
        let id = registry.create(&hw, 0).unwrap();
        registry.port_bind(id, 2).unwrap();
        let buffer = BufferId::new(0).unwrap();
        registry.set_port_buffer(id, 2, Some(buffer)).unwrap();
        assert_eq!(registry.get(id).unwrap().port_buffer(2), Some(buffer));
        assert_eq!(registry.port_release(id, 2), Err(Error::BadDescriptor));
        registry.set_port_buffer(id, 2, None).unwrap();
        registry.port_release(id, 2).unwrap();
        assert_eq!(registry.get(id).unwrap().refcount(), 0);
        registry.release(id).unwrap();
        assert_eq!(registry.used(), 0);
    }
}
