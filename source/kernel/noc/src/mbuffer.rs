// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Message buffer pool staging every in-flight or kept message
//! OWNERS: @kernel-noc-team
//! PUBLIC API: MbufferPool, Release
//! DEPENDS_ON: nexus_resource::ResourcePool, frame::Frame
//! INVARIANTS: A freed or freshly allocated slot has no destination and a zeroed payload;
//!             BUSY on a used slot means "message kept for a later reader"

use nexus_resource::{Pooled, Resource, ResourcePool};

use crate::address::{Address, BufferId};
use crate::config::MBUFFER_MAX;
use crate::error::{Error, Result};
use crate::frame::Frame;

/// What happens to a message when its buffer is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Leave the message in the pool for a later fast-path read.
    Keep,
    /// Scrub the slot and return it to the free list.
    Discard,
}

#[derive(Clone, Copy)]
struct Mbuffer {
    resource: Resource,
    frame: Frame,
}

impl Pooled for Mbuffer {
    fn resource(&self) -> &Resource {
        &self.resource
    }

    fn resource_mut(&mut self) -> &mut Resource {
        &mut self.resource
    }
}

const FREE: Mbuffer = Mbuffer { resource: Resource::INIT, frame: Frame::EMPTY };

/// Fixed pool of message buffers.
pub struct MbufferPool {
    slots: ResourcePool<Mbuffer, MBUFFER_MAX>,
}

impl MbufferPool {
    pub const fn new() -> Self {
        Self { slots: ResourcePool::new([FREE; MBUFFER_MAX]) }
    }

    /// Claims a scrubbed slot; `Again` when the pool is exhausted.
    pub fn alloc(&mut self) -> Result<BufferId> {
        let index = self.slots.alloc()?;
        let slot = self.slots.get_used_mut(index)?;
        slot.frame.clear();
        BufferId::new(index).ok_or(Error::Invalid)
    }

    /// Releases a slot, either keeping its message or scrubbing it.
    pub fn release(&mut self, id: BufferId, rule: Release) -> Result<()> {
        let slot = self.slots.get_used_mut(id.index())?;
        match rule {
            Release::Keep => slot.resource.set_busy(),
            Release::Discard => {
                slot.frame.clear();
                self.slots.free(id.index())?;
            }
        }
        Ok(())
    }

    /// Scrubs and frees the slot.
    #[inline]
    pub fn free(&mut self, id: BufferId) -> Result<()> {
        self.release(id, Release::Discard)
    }

    pub fn mark_busy(&mut self, id: BufferId) -> Result<()> {
        self.slots.get_used_mut(id.index())?.resource.set_busy();
        Ok(())
    }

    pub fn mark_not_busy(&mut self, id: BufferId) -> Result<()> {
        self.slots.get_used_mut(id.index())?.resource.set_notbusy();
        Ok(())
    }

    pub fn is_used(&self, id: BufferId) -> bool {
        self.slots.get_used(id.index()).is_ok()
    }

    pub fn is_busy(&self, id: BufferId) -> bool {
        self.slots.get_used(id.index()).map_or(false, |slot| slot.resource.is_busy())
    }

    /// Finds a kept message addressed to `dest`.
    pub fn search(&self, dest: Address) -> Option<BufferId> {
        self.slots
            .position(|slot| slot.resource.is_busy() && slot.frame.dest == Some(dest))
            .and_then(BufferId::new)
    }

    pub fn frame(&self, id: BufferId) -> Result<&Frame> {
        Ok(&self.slots.get_used(id.index())?.frame)
    }

    pub fn frame_mut(&mut self, id: BufferId) -> Result<&mut Frame> {
        Ok(&mut self.slots.get_used_mut(id.index())?.frame)
    }

    /// Number of allocated slots, kept messages included.
    pub fn used(&self) -> usize {
        self.slots.used()
    }
}

impl Default for MbufferPool {
    fn default() -> Self {
        Self::new()
    }
}
