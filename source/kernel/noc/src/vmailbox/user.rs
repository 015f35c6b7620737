// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Caller-owned receive buffer filled when an asynchronous read completes.

use core::ptr::NonNull;

/// Destination of an asynchronous read.
///
/// The facility keeps the buffer until the matching `wait` and writes the payload into it
/// then, so its validity has to be promised up front by the caller.
#[derive(Clone, Copy, Debug)]
pub struct UserBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: `from_raw_parts` requires exclusive access to the memory until the transfer is
// waited on, so the buffer may be completed from whichever core runs the wait.
unsafe impl Send for UserBuffer {}

impl UserBuffer {
    /// Wraps a raw user buffer; returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `len` bytes from this call until the `wait` that
    /// completes the read returns, and nothing else may access that memory in between.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `data` into the buffer, truncated to its length.
    ///
    /// # Safety
    ///
    /// The contract of [`UserBuffer::from_raw_parts`] must still hold.
    pub(crate) unsafe fn copy_from(&self, data: &[u8]) {
        let count = data.len().min(self.len);
        // SAFETY: caller upholds validity of `ptr` for `len` bytes; `data` is a distinct
        // kernel-side slice so the ranges cannot overlap.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), count) };
    }
}
