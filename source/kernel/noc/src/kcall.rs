// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-call dispatcher for the mailbox facility
//! OWNERS: @kernel-noc-team
//! PUBLIC API: KcallTable, Args, Context, KcallError, UserMemory, KCALL_MAILBOX_* IDs
//! DEPENDS_ON: vmailbox::Facility, nexus_hal::Hal
//! INVARIANTS: Fixed MAX_KCALL window; stable IDs; every user pointer is checked against
//!             `UserMemory` before it is dereferenced; errors are returned as negative errno
//! ADR: docs/adr/0025-noc-virtual-mailboxes.md

use core::fmt;
use core::mem::size_of;

use nexus_hal::{Fence, Hal, NodeNum};

use crate::address::VmbxId;
use crate::config::MSG_SIZE;
use crate::error::Error;
use crate::vmailbox::{Facility, IoctlRequest, UserBuffer};

/// Size of the kernel-call window.
const MAX_KCALL: usize = 64;

/// Kernel-call numbers of the mailbox facility.
pub const KCALL_MAILBOX_CREATE: usize = 39;
pub const KCALL_MAILBOX_OPEN: usize = 40;
pub const KCALL_MAILBOX_UNLINK: usize = 41;
pub const KCALL_MAILBOX_CLOSE: usize = 42;
pub const KCALL_MAILBOX_AWRITE: usize = 43;
pub const KCALL_MAILBOX_AREAD: usize = 44;
pub const KCALL_MAILBOX_WAIT: usize = 45;
pub const KCALL_MAILBOX_IOCTL: usize = 46;

/// Result type used by kernel-call handlers.
pub type KcallResult<T> = Result<T, KcallError>;

/// Kernel-call arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KcallError {
    /// Kernel-call number not present in the dispatch table.
    InvalidKcall,
    /// User pointer outside the caller's memory.
    BadAddress,
    /// Mailbox facility rejected the request.
    Mailbox(Error),
}

impl KcallError {
    /// Negative errno returned to user space.
    pub const fn errno(self) -> isize {
        match self {
            Self::InvalidKcall => -38,
            Self::BadAddress => -14,
            Self::Mailbox(err) => err.errno(),
        }
    }
}

impl From<Error> for KcallError {
    fn from(value: Error) -> Self {
        Self::Mailbox(value)
    }
}

impl fmt::Display for KcallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKcall => write!(f, "invalid kernel call"),
            Self::BadAddress => write!(f, "bad user address"),
            Self::Mailbox(err) => write!(f, "{err}"),
        }
    }
}

/// Validates user memory ranges handed to the kernel.
///
/// # Safety
///
/// A range accepted by `check_area` must stay mapped, writable and exclusively owned by the
/// calling task until the kernel call returns, or until the matching wait returns for
/// asynchronous reads.
pub unsafe trait UserMemory {
    fn check_area(&self, addr: usize, len: usize) -> bool;
}

/// Per-call context handed to every handler.
pub struct Context<'a, H: Hal, M: UserMemory> {
    pub facility: &'a Facility<H>,
    pub memory: &'a M,
}

/// Type alias for a kernel-call handler.
pub type Handler<H, M> = fn(&Context<'_, H, M>, &Args) -> KcallResult<usize>;

/// Dispatch table storing handlers by kernel-call number.
pub struct KcallTable<H: Hal, M: UserMemory> {
    handlers: [Option<Handler<H, M>>; MAX_KCALL],
}

impl<H: Hal, M: UserMemory> KcallTable<H, M> {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        Self { handlers: [None; MAX_KCALL] }
    }

    /// Creates a table with every mailbox kernel call registered.
    pub fn with_mailbox_calls() -> Self {
        let mut table = Self::new();
        table.register(KCALL_MAILBOX_CREATE, sys_mailbox_create);
        table.register(KCALL_MAILBOX_OPEN, sys_mailbox_open);
        table.register(KCALL_MAILBOX_UNLINK, sys_mailbox_unlink);
        table.register(KCALL_MAILBOX_CLOSE, sys_mailbox_close);
        table.register(KCALL_MAILBOX_AWRITE, sys_mailbox_awrite);
        table.register(KCALL_MAILBOX_AREAD, sys_mailbox_aread);
        table.register(KCALL_MAILBOX_WAIT, sys_mailbox_wait);
        table.register(KCALL_MAILBOX_IOCTL, sys_mailbox_ioctl);
        table
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler<H, M>) {
        if number < MAX_KCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: usize, ctx: &Context<'_, H, M>, args: &Args) -> KcallResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(KcallError::InvalidKcall)
            .and_then(|handler| handler(ctx, args))
    }

    /// Dispatches and folds the outcome into the register return value.
    pub fn invoke(&self, number: usize, ctx: &Context<'_, H, M>, args: &Args) -> isize {
        match self.dispatch(number, ctx, args) {
            Ok(value) => value as isize,
            Err(err) => err.errno(),
        }
    }
}

impl<H: Hal, M: UserMemory> Default for KcallTable<H, M> {
    fn default() -> Self {
        Self::with_mailbox_calls()
    }
}

/// Register values are signed at the ABI boundary.
fn non_negative(raw: usize) -> KcallResult<usize> {
    if (raw as isize) < 0 {
        return Err(Error::Invalid.into());
    }
    Ok(raw)
}

fn node_arg<H: Hal, M: UserMemory>(ctx: &Context<'_, H, M>, raw: usize) -> KcallResult<NodeNum> {
    let node = non_negative(raw)?;
    if node >= ctx.facility.hal().node_count() {
        return Err(Error::Invalid.into());
    }
    Ok(node)
}

fn vmbx_arg(raw: usize) -> KcallResult<VmbxId> {
    Ok(VmbxId::from_raw(non_negative(raw)?)?)
}

fn message_area<H: Hal, M: UserMemory>(
    ctx: &Context<'_, H, M>,
    addr: usize,
    size: usize,
) -> KcallResult<()> {
    if size != MSG_SIZE || addr == 0 {
        return Err(Error::Invalid.into());
    }
    if !ctx.memory.check_area(addr, size) {
        return Err(KcallError::BadAddress);
    }
    Ok(())
}

fn sys_mailbox_create<H: Hal, M: UserMemory>(ctx: &Context<'_, H, M>, args: &Args) -> KcallResult<usize> {
    let local = node_arg(ctx, args.get(0))?;
    let port = non_negative(args.get(1))?;
    Ok(ctx.facility.create(local, port)?.as_raw())
}

fn sys_mailbox_open<H: Hal, M: UserMemory>(ctx: &Context<'_, H, M>, args: &Args) -> KcallResult<usize> {
    let remote = node_arg(ctx, args.get(0))?;
    let port = non_negative(args.get(1))?;
    Ok(ctx.facility.open(remote, port)?.as_raw())
}

fn sys_mailbox_unlink<H: Hal, M: UserMemory>(ctx: &Context<'_, H, M>, args: &Args) -> KcallResult<usize> {
    ctx.facility.unlink(vmbx_arg(args.get(0))?)?;
    Ok(0)
}

fn sys_mailbox_close<H: Hal, M: UserMemory>(ctx: &Context<'_, H, M>, args: &Args) -> KcallResult<usize> {
    ctx.facility.close(vmbx_arg(args.get(0))?)?;
    Ok(0)
}

fn sys_mailbox_awrite<H: Hal, M: UserMemory>(ctx: &Context<'_, H, M>, args: &Args) -> KcallResult<usize> {
    let id = vmbx_arg(args.get(0))?;
    let (addr, size) = (args.get(1), args.get(2));
    message_area(ctx, addr, size)?;
    // SAFETY: `UserMemory` vouched for `size` readable bytes at `addr` for this call.
    let payload = unsafe { core::slice::from_raw_parts(addr as *const u8, size) };
    Ok(ctx.facility.awrite(id, payload)?)
}

fn sys_mailbox_aread<H: Hal, M: UserMemory>(ctx: &Context<'_, H, M>, args: &Args) -> KcallResult<usize> {
    let id = vmbx_arg(args.get(0))?;
    let (addr, size) = (args.get(1), args.get(2));
    message_area(ctx, addr, size)?;
    // SAFETY: `UserMemory` keeps the range valid and exclusive until the matching wait.
    let buffer = unsafe { UserBuffer::from_raw_parts(addr as *mut u8, size) }.ok_or(Error::Invalid)?;
    Ok(ctx.facility.aread(id, buffer)?)
}

fn sys_mailbox_wait<H: Hal, M: UserMemory>(ctx: &Context<'_, H, M>, args: &Args) -> KcallResult<usize> {
    let status = ctx.facility.wait(vmbx_arg(args.get(0))?)?;
    Ok(status.code())
}

fn sys_mailbox_ioctl<H: Hal, M: UserMemory>(ctx: &Context<'_, H, M>, args: &Args) -> KcallResult<usize> {
    let id = vmbx_arg(args.get(0))?;
    let code = u32::try_from(args.get(1)).map_err(|_| Error::NotSupported)?;
    let request = IoctlRequest::try_from(code)?;
    let out = args.get(2);
    if out == 0 {
        return Err(Error::Invalid.into());
    }
    if !ctx.memory.check_area(out, size_of::<u64>()) {
        return Err(KcallError::BadAddress);
    }
    let value = ctx.facility.ioctl(id, request)?;
    // SAFETY: `UserMemory` vouched for 8 writable bytes at `out`; no alignment is assumed.
    unsafe { core::ptr::write_unaligned(out as *mut u64, value) };
    ctx.facility.hal().fence().publish();
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_hal::sim::{SimNetwork, SimNode};

    struct NoMemory;

    // SAFETY: accepts nothing.
    unsafe impl UserMemory for NoMemory {
        fn check_area(&self, _addr: usize, _len: usize) -> bool {
            false
        }
    }

    fn facility() -> Facility<SimNode> {
        let facility = Facility::new(SimNetwork::new(2).node(0));
        facility.init();
        facility
    }

    #[test]
    fn unknown_number_is_rejected() {
        let facility = facility();
        let ctx = Context { facility: &facility, memory: &NoMemory };
        let table = KcallTable::with_mailbox_calls();
        assert_eq!(table.dispatch(0, &ctx, &Args::default()), Err(KcallError::InvalidKcall));
        assert_eq!(table.dispatch(MAX_KCALL + 1, &ctx, &Args::default()), Err(KcallError::InvalidKcall));
        assert_eq!(table.invoke(7, &ctx, &Args::default()), -38);
    }

    #[test]
    fn negative_arguments_are_invalid() {
        let facility = facility();
        let ctx = Context { facility: &facility, memory: &NoMemory };
        let table = KcallTable::with_mailbox_calls();
        let minus_one = -1isize as usize;
        for number in [KCALL_MAILBOX_UNLINK, KCALL_MAILBOX_CLOSE, KCALL_MAILBOX_WAIT] {
            assert_eq!(
                table.dispatch(number, &ctx, &Args::new([minus_one, 0, 0, 0, 0, 0])),
                Err(KcallError::Mailbox(Error::Invalid))
            );
        }
        assert_eq!(
            table.dispatch(KCALL_MAILBOX_CREATE, &ctx, &Args::new([minus_one, 0, 0, 0, 0, 0])),
            Err(KcallError::Mailbox(Error::Invalid))
        );
        assert_eq!(
            table.dispatch(KCALL_MAILBOX_OPEN, &ctx, &Args::new([2, 0, 0, 0, 0, 0])),
            Err(KcallError::Mailbox(Error::Invalid))
        );
    }

    #[test]
    fn unchecked_memory_is_a_bad_address() {
        let facility = facility();
        let ctx = Context { facility: &facility, memory: &NoMemory };
        let table = KcallTable::with_mailbox_calls();
        let id = table.dispatch(KCALL_MAILBOX_OPEN, &ctx, &Args::new([1, 0, 0, 0, 0, 0])).unwrap();
        assert_eq!(
            table.dispatch(KCALL_MAILBOX_AWRITE, &ctx, &Args::new([id, 0x1000, MSG_SIZE, 0, 0, 0])),
            Err(KcallError::BadAddress)
        );
        assert_eq!(
            table.dispatch(KCALL_MAILBOX_AWRITE, &ctx, &Args::new([id, 0, MSG_SIZE, 0, 0, 0])),
            Err(KcallError::Mailbox(Error::Invalid))
        );
        assert_eq!(
            table.dispatch(KCALL_MAILBOX_AWRITE, &ctx, &Args::new([id, 0x1000, MSG_SIZE - 1, 0, 0, 0])),
            Err(KcallError::Mailbox(Error::Invalid))
        );
        assert_eq!(KcallError::BadAddress.errno(), -14);
    }
}
