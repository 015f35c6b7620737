// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual mailbox facility: channel lifecycle and asynchronous transfers
//! OWNERS: @kernel-noc-team
//! PUBLIC API: Facility, VmbxState, Endpoint, Stats, WaitStatus, IoctlRequest, UserBuffer
//! DEPENDS_ON: mailbox::Registry, mbuffer::MbufferPool, nexus_hal::Hal, spin::Mutex
//! INVARIANTS: Lock order vmailboxes -> registry -> mbuffers; no lock is held across the driver
//!             wait; a channel issues one transfer at a time and must wait before the next;
//!             output ports get the hardware mailbox in request order;
//!             every shared-table mutation ends with a fence publish
//! ADR: docs/adr/0025-noc-virtual-mailboxes.md

mod ioctl;
mod user;

#[cfg(test)]
mod tests_prop;

use nexus_hal::{Fence, Hal, MailboxHw, NodeNum, Timer, HW_MAILBOX_MSG_SIZE};
use spin::Mutex;

use crate::address::{Address, BufferId, VmbxId};
use crate::config::{MSG_SIZE, NODES_MAX, VMAILBOX_MAX};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::mailbox::{Direction, Registry};
use crate::mbuffer::{MbufferPool, Release};
use crate::LOG_TARGET;

use ioctl::{Counter, Counters};

pub use ioctl::IoctlRequest;
pub use user::UserBuffer;

/// Externally visible state of a virtual mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmbxState {
    Closed,
    Idle,
    /// A driver operation was issued and must be waited on.
    Busy,
    /// Completed without the driver (fast path or loopback); wait returns immediately.
    Done,
}

/// Direction-tagged binding resolved when the channel is created or opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Readable { local: Address },
    Writable { remote: Address },
}

impl Endpoint {
    fn direction(self) -> Direction {
        match self {
            Self::Readable { .. } => Direction::Input,
            Self::Writable { .. } => Direction::Output,
        }
    }
}

/// Per-channel performance counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes transferred.
    pub volume: u64,
    /// Nanoseconds spent issuing, waiting and copying.
    pub latency: u64,
}

/// Outcome of a successful [`Facility::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// The transfer completed for this channel.
    Done,
    /// A message for another open port arrived; it stays queued for that port.
    Misdelivered,
    /// A message for a port that is not open arrived and was discarded.
    Dropped,
}

impl WaitStatus {
    /// Kernel-call encoding: 0 for done, 1 for any re-addressed message.
    pub const fn code(self) -> usize {
        match self {
            Self::Done => 0,
            Self::Misdelivered | Self::Dropped => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Busy,
    Done,
}

#[derive(Clone, Copy)]
struct Channel {
    phase: Phase,
    endpoint: Endpoint,
    pending: Option<UserBuffer>,
    stats: Stats,
}

impl Channel {
    const fn new(endpoint: Endpoint) -> Self {
        Self { phase: Phase::Idle, endpoint, pending: None, stats: Stats { volume: 0, latency: 0 } }
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.phase {
            Phase::Idle => Ok(()),
            Phase::Busy | Phase::Done => Err(Error::Busy),
        }
    }

    fn finish(&mut self) {
        self.phase = Phase::Idle;
        self.pending = None;
    }
}

type Table = [Option<Channel>; VMAILBOX_MAX];

const CLOSED: Option<Channel> = None;

/// The virtual mailbox facility of one node.
pub struct Facility<H: Hal> {
    hal: H,
    vmailboxes: Mutex<Table>,
    registry: Mutex<Registry>,
    mbuffers: Mutex<MbufferPool>,
    counters: Counters,
}

impl<H: Hal> Facility<H> {
    /// Builds an uninitialised facility; call [`Facility::init`] before use.
    pub const fn new(hal: H) -> Self {
        Self {
            hal,
            vmailboxes: Mutex::new([CLOSED; VMAILBOX_MAX]),
            registry: Mutex::new(Registry::new()),
            mbuffers: Mutex::new(MbufferPool::new()),
            counters: Counters::new(),
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Sets up the node topology: the local input mailbox and one output per node.
    pub fn try_init(&self) -> Result<()> {
        let local = self.hal.node_num();
        let nodes = self.hal.node_count();
        if nodes == 0 || nodes > NODES_MAX || local >= nodes {
            return Err(Error::Invalid);
        }
        log::info!(
            target: LOG_TARGET,
            "[kernel][noc] initializing the kmailbox facility (node {local} of {nodes})"
        );

        let mut registry = self.registry.lock();
        self.hal.fence().refresh();
        registry.create(self.hal.mailbox(), local)?;
        for node in 0..nodes {
            registry.open(self.hal.mailbox(), node, self.hal.node_is_local(node))?;
        }
        self.hal.fence().publish();
        Ok(())
    }

    /// Like [`Facility::try_init`]; the kernel cannot run IPC without its mailboxes.
    pub fn init(&self) {
        if let Err(err) = self.try_init() {
            panic!("[kernel][noc] failed to initialize mailbox facility: {err}");
        }
    }

    /// Creates an input channel on `port` of the local node.
    pub fn create(&self, local: NodeNum, port: usize) -> Result<VmbxId> {
        if local >= self.hal.node_count() || !self.hal.node_is_local(local) {
            return Err(Error::Invalid);
        }
        let address = Address::compose(local, port)?;

        let mut table = self.vmailboxes.lock();
        let mut registry = self.registry.lock();
        self.hal.fence().refresh();

        let mailbox = registry.find_input(local).ok_or(Error::Again)?;
        let id = VmbxId::compose(mailbox, port);
        if table[id.as_raw()].is_some() {
            return Err(Error::Busy);
        }
        registry.port_bind(mailbox, port)?;
        table[id.as_raw()] = Some(Channel::new(Endpoint::Readable { local: address }));

        self.hal.fence().publish();
        self.counters.bump(Counter::Creates);
        log::debug!(target: LOG_TARGET, "[kernel][noc] vmailbox {} created on {address}", id.as_raw());
        Ok(id)
    }

    /// Opens an output channel towards `remote_port` on `remote`.
    pub fn open(&self, remote: NodeNum, remote_port: usize) -> Result<VmbxId> {
        if remote >= self.hal.node_count() {
            return Err(Error::Invalid);
        }
        let address = Address::compose(remote, remote_port)?;

        let mut table = self.vmailboxes.lock();
        let mut registry = self.registry.lock();
        self.hal.fence().refresh();

        let existing = registry.find_output(remote);
        let mailbox = match existing {
            Some(mailbox) => mailbox,
            None => registry.open(self.hal.mailbox(), remote, self.hal.node_is_local(remote))?,
        };
        let port = match registry.port_alloc(mailbox) {
            Ok(port) => port,
            Err(err) => {
                if existing.is_none() {
                    registry.release(mailbox)?;
                }
                return Err(err);
            }
        };
        let id = VmbxId::compose(mailbox, port);
        if table[id.as_raw()].is_some() {
            registry.port_release(mailbox, port)?;
            return Err(Error::Busy);
        }
        table[id.as_raw()] = Some(Channel::new(Endpoint::Writable { remote: address }));

        self.hal.fence().publish();
        self.counters.bump(Counter::Opens);
        log::debug!(target: LOG_TARGET, "[kernel][noc] vmailbox {} opened to {address}", id.as_raw());
        Ok(id)
    }

    /// Destroys an input channel.
    pub fn unlink(&self, id: VmbxId) -> Result<()> {
        self.release(id, Direction::Input)?;
        self.counters.bump(Counter::Unlinks);
        Ok(())
    }

    /// Destroys an output channel.
    pub fn close(&self, id: VmbxId) -> Result<()> {
        self.release(id, Direction::Output)?;
        self.counters.bump(Counter::Closes);
        Ok(())
    }

    fn release(&self, id: VmbxId, direction: Direction) -> Result<()> {
        let mut table = self.vmailboxes.lock();
        let mut registry = self.registry.lock();
        self.hal.fence().refresh();

        let channel = table[id.as_raw()].as_ref().ok_or(Error::BadDescriptor)?;
        let endpoint = channel.endpoint;
        if endpoint.direction() != direction {
            return Err(Error::BadDescriptor);
        }
        let mailbox = registry.get(id.mailbox())?;
        if mailbox.direction() != direction || !mailbox.port_in_use(id.port()) {
            return Err(Error::BadDescriptor);
        }
        channel.ensure_idle()?;
        let staged = mailbox.port_buffer(id.port());
        let mut pool = self.mbuffers.lock();
        match endpoint {
            Endpoint::Readable { local } => {
                // Refuse to drop messages already queued for this address.
                if pool.search(local).is_some() {
                    return Err(Error::Busy);
                }
            }
            // A write still waiting for its turn gives up its place and its message.
            Endpoint::Writable { .. } => {
                Self::settle(&mut registry, &mut pool, id, staged, Release::Discard, false)?
            }
        }
        drop(pool);

        registry.port_release(id.mailbox(), id.port())?;
        table[id.as_raw()] = None;
        self.hal.fence().publish();
        log::debug!(target: LOG_TARGET, "[kernel][noc] vmailbox {} released", id.as_raw());
        Ok(())
    }

    /// Issues an asynchronous read into `buffer`; returns the bytes requested.
    pub fn aread(&self, id: VmbxId, buffer: UserBuffer) -> Result<usize> {
        if buffer.len() != MSG_SIZE {
            return Err(Error::Invalid);
        }

        let mut table = self.vmailboxes.lock();
        let mut registry = self.registry.lock();
        self.hal.fence().refresh();

        let channel = table[id.as_raw()].as_mut().ok_or(Error::BadDescriptor)?;
        let Endpoint::Readable { local } = channel.endpoint else {
            return Err(Error::BadDescriptor);
        };
        channel.ensure_idle()?;
        let mailbox = registry.get(id.mailbox())?;
        if mailbox.direction() != Direction::Input || !mailbox.port_in_use(id.port()) {
            return Err(Error::BadDescriptor);
        }
        let fd = mailbox.fd().ok_or(Error::BadDescriptor)?;
        let hw_busy = mailbox.is_busy();

        let mut pool = self.mbuffers.lock();

        // A message may already be waiting (loopback or re-addressed).
        if let Some(kept) = pool.search(local) {
            let t1 = self.hal.timer().now();
            // SAFETY: `UserBuffer` guarantees the memory stays valid until the wait.
            unsafe { buffer.copy_from(&pool.frame(kept)?.payload) };
            let t2 = self.hal.timer().now();
            pool.release(kept, Release::Discard)?;

            channel.stats.latency += t2.saturating_sub(t1);
            channel.stats.volume += MSG_SIZE as u64;
            channel.phase = Phase::Done;
            self.hal.fence().publish();
            self.counters.bump(Counter::Reads);
            crate::trace_transfer!("vmailbox {} read kept message", id.as_raw());
            return Ok(MSG_SIZE);
        }

        if hw_busy {
            return Err(Error::Busy);
        }
        let staging = pool.alloc()?;
        let t1 = self.hal.timer().now();
        if let Err(err) = self.hal.mailbox().aread(fd) {
            pool.release(staging, Release::Discard)?;
            return Err(err.into());
        }
        let t2 = self.hal.timer().now();
        registry.set_port_buffer(id.mailbox(), id.port(), Some(staging))?;
        registry.set_busy(id.mailbox(), true)?;

        channel.stats.latency += t2.saturating_sub(t1);
        channel.pending = Some(buffer);
        channel.phase = Phase::Busy;
        self.hal.fence().publish();
        self.counters.bump(Counter::Reads);
        crate::trace_transfer!("vmailbox {} aread issued", id.as_raw());
        Ok(MSG_SIZE)
    }

    /// Issues an asynchronous write of `payload`; returns the bytes sent.
    ///
    /// Ports of one output mailbox take turns: a port that finds another port ahead of it
    /// gets `Busy` but keeps its staged message and its place in the queue, so retrying
    /// after the current writer's wait succeeds.
    pub fn awrite(&self, id: VmbxId, payload: &[u8]) -> Result<usize> {
        let payload: &[u8; MSG_SIZE] = payload.try_into().map_err(|_| Error::Invalid)?;

        let mut table = self.vmailboxes.lock();
        let mut registry = self.registry.lock();
        self.hal.fence().refresh();

        let channel = table[id.as_raw()].as_mut().ok_or(Error::BadDescriptor)?;
        let Endpoint::Writable { remote } = channel.endpoint else {
            return Err(Error::BadDescriptor);
        };
        channel.ensure_idle()?;
        let mailbox = registry.get(id.mailbox())?;
        if mailbox.direction() != Direction::Output || !mailbox.port_in_use(id.port()) {
            return Err(Error::BadDescriptor);
        }
        let frame = Frame::new(remote, *payload);
        let mut pool = self.mbuffers.lock();

        let Some(fd) = mailbox.fd() else {
            // Loopback: hand the message straight to the pool.
            let staging = pool.alloc()?;
            let t1 = self.hal.timer().now();
            *pool.frame_mut(staging)? = frame;
            let t2 = self.hal.timer().now();
            pool.release(staging, Release::Keep)?;

            channel.stats.latency += t2.saturating_sub(t1);
            channel.stats.volume += MSG_SIZE as u64;
            channel.phase = Phase::Done;
            self.hal.fence().publish();
            self.counters.bump(Counter::Writes);
            crate::trace_transfer!("vmailbox {} looped back to {remote}", id.as_raw());
            return Ok(MSG_SIZE);
        };

        let staging = match mailbox.port_buffer(id.port()) {
            Some(staging) => staging,
            None => {
                let staging = pool.alloc()?;
                if let Err(err) = registry.set_port_buffer(id.mailbox(), id.port(), Some(staging)) {
                    pool.release(staging, Release::Discard)?;
                    return Err(err);
                }
                staging
            }
        };
        // A queued port sends whatever it staged last.
        *pool.frame_mut(staging)? = frame;
        registry.request(id.mailbox(), id.port())?;

        let mailbox = registry.get(id.mailbox())?;
        if !mailbox.is_turn(id.port()) || mailbox.is_busy() {
            self.hal.fence().publish();
            return Err(Error::Busy);
        }

        let t1 = self.hal.timer().now();
        if let Err(err) = self.hal.mailbox().awrite(fd, &frame.encode()) {
            let settled =
                Self::settle(&mut registry, &mut pool, id, Some(staging), Release::Discard, false);
            self.hal.fence().publish();
            settled?;
            return Err(err.into());
        }
        let t2 = self.hal.timer().now();
        registry.set_busy(id.mailbox(), true)?;

        channel.stats.latency += t2.saturating_sub(t1);
        channel.phase = Phase::Busy;
        self.hal.fence().publish();
        self.counters.bump(Counter::Writes);
        crate::trace_transfer!("vmailbox {} awrite issued to {remote}", id.as_raw());
        Ok(MSG_SIZE)
    }

    /// Blocks until the outstanding transfer of `id` completes.
    pub fn wait(&self, id: VmbxId) -> Result<WaitStatus> {
        let (fd, staging, endpoint) = {
            let mut table = self.vmailboxes.lock();
            let mut registry = self.registry.lock();
            self.hal.fence().refresh();

            let channel = table[id.as_raw()].as_mut().ok_or(Error::BadDescriptor)?;
            match channel.phase {
                Phase::Done => {
                    channel.finish();
                    self.hal.fence().publish();
                    self.counters.bump(Counter::Waits);
                    return Ok(WaitStatus::Done);
                }
                Phase::Idle => return Err(Error::BadDescriptor),
                Phase::Busy => {}
            }
            let (fd, staging) = registry
                .get(id.mailbox())
                .map(|mailbox| (mailbox.fd(), mailbox.port_buffer(id.port())))
                .unwrap_or((None, None));
            let (Some(fd), Some(staging)) = (fd, staging) else {
                // The binding no longer describes a transfer; settle what is left.
                let mut pool = self.mbuffers.lock();
                let settled =
                    Self::settle(&mut registry, &mut pool, id, staging, Release::Discard, true);
                channel.finish();
                self.hal.fence().publish();
                settled?;
                return Err(Error::BadDescriptor);
            };
            (fd, staging, channel.endpoint)
        };

        let mut raw = [0u8; HW_MAILBOX_MSG_SIZE];
        let t1 = self.hal.timer().now();
        let outcome = self.hal.mailbox().wait(fd, &mut raw);
        let t2 = self.hal.timer().now();

        let mut table = self.vmailboxes.lock();
        let mut registry = self.registry.lock();
        let mut pool = self.mbuffers.lock();
        self.hal.fence().refresh();

        let mut channel = table[id.as_raw()].as_mut();
        let completed = outcome.map_err(Error::from).and_then(|()| {
            let channel = channel.as_deref_mut().ok_or(Error::BadDescriptor)?;
            channel.stats.latency += t2.saturating_sub(t1);
            let Endpoint::Readable { local } = endpoint else {
                channel.stats.volume += MSG_SIZE as u64;
                return Ok((WaitStatus::Done, Release::Discard));
            };
            let frame = Frame::decode(&raw);
            *pool.frame_mut(staging)? = frame;
            if frame.dest == Some(local) {
                if let Some(user) = channel.pending {
                    // SAFETY: `UserBuffer` guarantees the memory stays valid until now.
                    unsafe { user.copy_from(&frame.payload) };
                }
                channel.stats.volume += MSG_SIZE as u64;
                return Ok((WaitStatus::Done, Release::Discard));
            }
            // Re-address: keep it only if its port is open on this mailbox.
            let mailbox = registry.get(id.mailbox())?;
            let open = frame.dest.is_some_and(|dest| {
                dest.node() == local.node() && mailbox.port_in_use(dest.port())
            });
            Ok(if open {
                (WaitStatus::Misdelivered, Release::Keep)
            } else {
                (WaitStatus::Dropped, Release::Discard)
            })
        });
        let (result, rule) = match completed {
            Ok((status, rule)) => (Ok(status), rule),
            Err(err) => (Err(err), Release::Discard),
        };

        let settled = Self::settle(&mut registry, &mut pool, id, Some(staging), rule, true);
        if let Some(channel) = channel {
            channel.finish();
        }
        self.hal.fence().publish();
        settled?;

        self.counters.bump(Counter::Waits);
        crate::trace_transfer!("vmailbox {} wait -> {:?}", id.as_raw(), result);
        result
    }

    /// Returns the port of `id` to a quiescent state: staged buffer released by `rule`,
    /// port unbound and its write request withdrawn. `issued` marks the port as the owner of
    /// the outstanding driver operation, which clears the hardware mailbox busy flag.
    ///
    /// Every step runs; the first failure is reported.
    fn settle(
        registry: &mut Registry,
        pool: &mut MbufferPool,
        id: VmbxId,
        staging: Option<BufferId>,
        rule: Release,
        issued: bool,
    ) -> Result<()> {
        let released = staging.map_or(Ok(()), |staging| pool.release(staging, rule));
        let unbound = registry.set_port_buffer(id.mailbox(), id.port(), None);
        let withdrawn = registry.withdraw(id.mailbox(), id.port());
        let idle = if issued { registry.set_busy(id.mailbox(), false) } else { Ok(()) };
        released.and(unbound).and(withdrawn).and(idle)
    }

    /// Reads a channel statistic or a facility-wide counter.
    pub fn ioctl(&self, id: VmbxId, request: IoctlRequest) -> Result<u64> {
        let table = self.vmailboxes.lock();
        self.hal.fence().refresh();

        let channel = table[id.as_raw()].as_ref().ok_or(Error::BadDescriptor)?;
        channel.ensure_idle()?;
        Ok(match request {
            IoctlRequest::GetVolume => channel.stats.volume,
            IoctlRequest::GetLatency => channel.stats.latency,
            other => other.counter().map_or(0, |counter| self.counters.get(counter)),
        })
    }

    pub fn state(&self, id: VmbxId) -> VmbxState {
        let table = self.vmailboxes.lock();
        self.hal.fence().refresh();
        match table[id.as_raw()].as_ref().map(|channel| channel.phase) {
            None => VmbxState::Closed,
            Some(Phase::Idle) => VmbxState::Idle,
            Some(Phase::Busy) => VmbxState::Busy,
            Some(Phase::Done) => VmbxState::Done,
        }
    }

    pub fn stats(&self, id: VmbxId) -> Result<Stats> {
        let table = self.vmailboxes.lock();
        self.hal.fence().refresh();
        table[id.as_raw()].as_ref().map(|channel| channel.stats).ok_or(Error::BadDescriptor)
    }

    /// Binding of an open channel.
    pub fn endpoint(&self, id: VmbxId) -> Result<Endpoint> {
        let table = self.vmailboxes.lock();
        table[id.as_raw()].as_ref().map(|channel| channel.endpoint).ok_or(Error::BadDescriptor)
    }

    /// Message buffers currently allocated, kept messages included.
    pub fn buffers_in_use(&self) -> usize {
        self.mbuffers.lock().used()
    }

    /// Reference count of the hardware mailbox carrying `id`.
    pub fn mailbox_refcount(&self, id: VmbxId) -> Result<usize> {
        Ok(self.registry.lock().get(id.mailbox())?.refcount())
    }
}
