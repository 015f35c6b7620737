// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

//! CONTEXT: Generic fixed-slot resource pool shared by kernel tables
//! OWNERS: @runtime
//! PUBLIC API: Resource, ResourceFlags, Pooled, ResourcePool, PoolError
//! DEPENDS_ON: bitflags
//! INVARIANTS: No heap; capacity fixed at compile time; alloc returns the lowest free slot;
//!             a freshly allocated slot carries only the USED flag
//! ADR: docs/adr/0016-kernel-libs-architecture.md

use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Status bits tracked for every pooled resource.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ResourceFlags: u32 {
        /// Slot is allocated.
        const USED = 1 << 0;
        /// Slot is engaged in an operation (or holds a kept payload).
        const BUSY = 1 << 1;
        /// Slot may be read from.
        const READ = 1 << 2;
        /// Slot may be written to.
        const WRITE = 1 << 3;
        /// Operations on the slot complete asynchronously.
        const ASYNC = 1 << 4;
    }
}

/// Generic resource header embedded in every pooled entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Resource {
    flags: ResourceFlags,
}

impl Resource {
    /// Resource in its initial (unused) state.
    pub const INIT: Self = Self { flags: ResourceFlags::empty() };

    pub const fn new() -> Self {
        Self::INIT
    }

    pub const fn flags(&self) -> ResourceFlags {
        self.flags
    }

    #[inline]
    pub const fn is_used(&self) -> bool {
        self.flags.contains(ResourceFlags::USED)
    }

    #[inline]
    pub fn set_used(&mut self) {
        self.flags.insert(ResourceFlags::USED);
    }

    /// Clears every flag, returning the slot to the free state.
    #[inline]
    pub fn set_unused(&mut self) {
        self.flags = ResourceFlags::empty();
    }

    #[inline]
    pub const fn is_busy(&self) -> bool {
        self.flags.contains(ResourceFlags::BUSY)
    }

    #[inline]
    pub fn set_busy(&mut self) {
        self.flags.insert(ResourceFlags::BUSY);
    }

    #[inline]
    pub fn set_notbusy(&mut self) {
        self.flags.remove(ResourceFlags::BUSY);
    }

    #[inline]
    pub const fn is_readable(&self) -> bool {
        self.flags.contains(ResourceFlags::READ)
    }

    #[inline]
    pub const fn is_writable(&self) -> bool {
        self.flags.contains(ResourceFlags::WRITE)
    }

    #[inline]
    pub fn set_rdonly(&mut self) {
        self.flags.remove(ResourceFlags::WRITE);
        self.flags.insert(ResourceFlags::READ);
    }

    #[inline]
    pub fn set_wronly(&mut self) {
        self.flags.remove(ResourceFlags::READ);
        self.flags.insert(ResourceFlags::WRITE);
    }

    #[inline]
    pub fn set_rdwr(&mut self) {
        self.flags.insert(ResourceFlags::READ | ResourceFlags::WRITE);
    }

    #[inline]
    pub const fn is_async(&self) -> bool {
        self.flags.contains(ResourceFlags::ASYNC)
    }

    #[inline]
    pub fn set_async(&mut self) {
        self.flags.insert(ResourceFlags::ASYNC);
    }

    #[inline]
    pub fn set_sync(&mut self) {
        self.flags.remove(ResourceFlags::ASYNC);
    }
}

/// Entries stored in a [`ResourcePool`] expose their embedded [`Resource`].
pub trait Pooled {
    fn resource(&self) -> &Resource;
    fn resource_mut(&mut self) -> &mut Resource;
}

/// Errors produced by pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is in use.
    Exhausted,
    /// Index outside the pool.
    OutOfRange,
    /// Slot is not allocated.
    NotInUse,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "resource pool exhausted"),
            Self::OutOfRange => write!(f, "resource index out of range"),
            Self::NotInUse => write!(f, "resource not in use"),
        }
    }
}

/// Fixed-capacity table of pooled entries.
pub struct ResourcePool<T, const N: usize> {
    slots: [T; N],
}

impl<T: Pooled, const N: usize> ResourcePool<T, N> {
    /// Wraps a pre-initialised slot array (usually built from a `const` entry).
    pub const fn new(slots: [T; N]) -> Self {
        Self { slots }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Claims the lowest free slot and marks it used.
    pub fn alloc(&mut self) -> Result<usize, PoolError> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let resource = slot.resource_mut();
            if !resource.is_used() {
                *resource = Resource::INIT;
                resource.set_used();
                return Ok(index);
            }
        }
        Err(PoolError::Exhausted)
    }

    /// Returns a used slot to the free state.
    pub fn free(&mut self, id: usize) -> Result<(), PoolError> {
        let slot = self.slots.get_mut(id).ok_or(PoolError::OutOfRange)?;
        if !slot.resource().is_used() {
            return Err(PoolError::NotInUse);
        }
        slot.resource_mut().set_unused();
        Ok(())
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id)
    }

    /// Returns the entry at `id` only if it is allocated.
    pub fn get_used(&self, id: usize) -> Result<&T, PoolError> {
        let slot = self.slots.get(id).ok_or(PoolError::OutOfRange)?;
        if slot.resource().is_used() {
            Ok(slot)
        } else {
            Err(PoolError::NotInUse)
        }
    }

    /// Mutable counterpart of [`ResourcePool::get_used`].
    pub fn get_used_mut(&mut self, id: usize) -> Result<&mut T, PoolError> {
        let slot = self.slots.get_mut(id).ok_or(PoolError::OutOfRange)?;
        if slot.resource().is_used() {
            Ok(slot)
        } else {
            Err(PoolError::NotInUse)
        }
    }

    /// Index of the first used slot matching `pred`.
    pub fn position<F>(&self, mut pred: F) -> Option<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.slots.iter().position(|slot| slot.resource().is_used() && pred(slot))
    }

    /// Number of allocated slots.
    pub fn used(&self) -> usize {
        self.slots.iter().filter(|slot| slot.resource().is_used()).count()
    }

    /// Iterates over allocated slots together with their index.
    pub fn iter_used(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter(|(_, slot)| slot.resource().is_used())
    }
}
