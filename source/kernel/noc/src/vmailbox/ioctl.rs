// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ioctl request codes and facility-wide operation counters.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;

/// Requests understood by `Facility::ioctl`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum IoctlRequest {
    /// Bytes moved through the channel.
    GetVolume = 1,
    /// Accumulated issue, wait and copy time in nanoseconds.
    GetLatency = 2,
    GetNCreates = 3,
    GetNUnlinks = 4,
    GetNOpens = 5,
    GetNCloses = 6,
    GetNReads = 7,
    GetNWrites = 8,
    GetNWaits = 9,
}

impl TryFrom<u32> for IoctlRequest {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::GetVolume,
            2 => Self::GetLatency,
            3 => Self::GetNCreates,
            4 => Self::GetNUnlinks,
            5 => Self::GetNOpens,
            6 => Self::GetNCloses,
            7 => Self::GetNReads,
            8 => Self::GetNWrites,
            9 => Self::GetNWaits,
            _ => return Err(Error::NotSupported),
        })
    }
}

impl IoctlRequest {
    pub(crate) const fn counter(self) -> Option<Counter> {
        match self {
            Self::GetVolume | Self::GetLatency => None,
            Self::GetNCreates => Some(Counter::Creates),
            Self::GetNUnlinks => Some(Counter::Unlinks),
            Self::GetNOpens => Some(Counter::Opens),
            Self::GetNCloses => Some(Counter::Closes),
            Self::GetNReads => Some(Counter::Reads),
            Self::GetNWrites => Some(Counter::Writes),
            Self::GetNWaits => Some(Counter::Waits),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Counter {
    Creates,
    Unlinks,
    Opens,
    Closes,
    Reads,
    Writes,
    Waits,
}

const COUNTER_COUNT: usize = 7;

/// Successful operations since start-up, shared by every channel.
pub(crate) struct Counters {
    values: [AtomicU64; COUNTER_COUNT],
}

impl Counters {
    pub(crate) const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self { values: [ZERO; COUNTER_COUNT] }
    }

    #[inline]
    pub(crate) fn bump(&self, counter: Counter) {
        self.values[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }
}
