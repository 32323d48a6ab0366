//! Page flags and the flat page table

use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use crate::constants::{PAGE_COUNT, PAGE_SIZE};

bitflags! {
    /// Per-page protection and state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u8 {
        /// Guest may read the page
        const READABLE = 1 << 0;
        /// Guest may write the page
        const WRITABLE = 1 << 1;
        /// Page is ineligible for the reservation protocol
        const NO_RESERVATIONS = 1 << 2;
        /// Page is mapped; owned exclusively by the allocator
        const ALLOCATED = 1 << 3;

        /// Read and write access
        const RW = Self::READABLE.bits() | Self::WRITABLE.bits();
        /// The bits that drive user-view host protection
        const VISIBLE = Self::READABLE.bits() | Self::WRITABLE.bits();
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// One atomic flag byte per 4 KB page over the whole 4 GB space.
pub struct PageTable {
    entries: Box<[AtomicU8]>,
}

impl PageTable {
    /// Create a table with every page unmapped.
    pub fn new() -> Self {
        let entries = (0..PAGE_COUNT).map(|_| AtomicU8::new(0)).collect();
        Self { entries }
    }

    /// Load the flags of one page.
    #[inline]
    pub fn load(&self, page: usize) -> PageFlags {
        PageFlags::from_bits_retain(self.entries[page].load(Ordering::Relaxed))
    }

    /// OR flags into one page, returning the previous flags.
    #[inline]
    pub(crate) fn fetch_or(&self, page: usize, flags: PageFlags) -> PageFlags {
        PageFlags::from_bits_retain(self.entries[page].fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear flags from one page, returning the previous flags.
    #[inline]
    pub(crate) fn fetch_and_not(&self, page: usize, flags: PageFlags) -> PageFlags {
        PageFlags::from_bits_retain(self.entries[page].fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Toggle flags of one page, returning the previous flags.
    #[inline]
    pub(crate) fn fetch_xor(&self, page: usize, flags: PageFlags) -> PageFlags {
        PageFlags::from_bits_retain(self.entries[page].fetch_xor(flags.bits(), Ordering::AcqRel))
    }

    /// Replace the flags of one page, returning the previous flags.
    #[inline]
    pub(crate) fn exchange(&self, page: usize, flags: PageFlags) -> PageFlags {
        PageFlags::from_bits_retain(self.entries[page].swap(flags.bits(), Ordering::AcqRel))
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Pages covered by `[addr, addr + size)`; `size` must be page-aligned.
#[inline]
pub(crate) fn page_range(addr: u32, size: u32) -> std::ops::Range<usize> {
    let first = (addr / PAGE_SIZE) as usize;
    first..first + (size / PAGE_SIZE) as usize
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    ((value as u64 + align as u64 - 1) & !(align as u64 - 1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits() {
        assert_eq!(PageFlags::READABLE.bits(), 1);
        assert_eq!(PageFlags::WRITABLE.bits(), 2);
        assert_eq!(PageFlags::NO_RESERVATIONS.bits(), 4);
        assert_eq!(PageFlags::ALLOCATED.bits(), 8);
        assert_eq!(PageFlags::RW, PageFlags::READABLE | PageFlags::WRITABLE);
    }

    #[test]
    fn test_table_updates() {
        let table = PageTable::new();

        assert!(table.load(42).is_empty());

        let prev = table.exchange(42, PageFlags::RW | PageFlags::ALLOCATED);
        assert!(prev.is_empty());
        assert_eq!(table.load(42), PageFlags::RW | PageFlags::ALLOCATED);

        let prev = table.fetch_and_not(42, PageFlags::WRITABLE);
        assert!(prev.contains(PageFlags::WRITABLE));
        assert_eq!(table.load(42), PageFlags::READABLE | PageFlags::ALLOCATED);

        let prev = table.fetch_xor(42, PageFlags::WRITABLE);
        assert!(!prev.contains(PageFlags::WRITABLE));
        assert!(table.load(42).contains(PageFlags::WRITABLE));
    }

    #[test]
    fn test_page_range() {
        assert_eq!(page_range(0x1000, 0x2000), 1..3);
        assert_eq!(page_range(0xFFFF_F000, 0x1000), 0xFFFFF..0x100000);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0, 0x1000), 0);
    }
}
