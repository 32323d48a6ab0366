//! Error types for the virtual-memory subsystem.
//!
//! Every fatal condition from the memory model (deadlocks, page-table
//! corruption, host protection failures, caller bugs in decoded guest
//! code) is a distinct variant. Benign outcomes such as a lost
//! store-conditional or an exhausted allocator are ordinary return
//! values, not errors.

use std::io;

use thiserror::Error;

use crate::profile::MemoryLocation;

/// Result alias for memory operations.
pub type VmResult<T> = Result<T, VmError>;

/// Errors raised by the virtual-memory subsystem.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("deadlock: reservation lock re-entered by the owning thread")]
    Deadlock,

    #[error("invalid arguments (addr=0x{addr:08x}, size=0x{size:x})")]
    InvalidArgs { addr: u32, size: u32 },

    #[error("invalid alignment (size=0x{size:x}, align=0x{align:x})")]
    InvalidAlignment { size: u32, align: u32 },

    #[error("invalid page flags (addr=0x{addr:08x}, size=0x{size:x}, flags=0x{flags:02x})")]
    InvalidPageFlags { addr: u32, size: u32, flags: u8 },

    #[error("invalid memory location ({0:?})")]
    InvalidLocation(MemoryLocation),

    #[error("memory already mapped (addr=0x{0:08x})")]
    AlreadyMapped(u32),

    #[error("memory not mapped (addr=0x{0:08x})")]
    NotMapped(u32),

    #[error("concurrent access to page table (addr=0x{0:08x})")]
    ConcurrentAccess(u32),

    #[error("unexpected memory amount used (0x{0:x})")]
    UsedBeyondCapacity(u32),

    #[error("waiter table limit exceeded ({0})")]
    WaiterLimit(usize),

    #[error("stack overflow (size=0x{size:x}, align=0x{align:x}, sp=0x{sp:x})")]
    StackOverflow { size: u32, align: u32, sp: u64 },

    #[error("stack inconsistency (addr=0x{addr:08x}, sp=0x{sp:x}, old_pos=0x{old_pos:08x})")]
    StackInconsistency { addr: u32, sp: u64, old_pos: u32 },

    #[error("stack pointer 0x{0:x} does not fit the guest address space")]
    AddressOverflow(u64),

    #[error("host protection failure (addr=0x{addr:08x})")]
    Protection {
        addr: u32,
        #[source]
        source: io::Error,
    },

    #[error("host backing failure")]
    Backing(#[from] io::Error),

    #[error("emulation stopped")]
    Stopped,
}
