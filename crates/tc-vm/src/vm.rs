//! The guest address space.
//!
//! [`VmContext`] owns the dual host views, the page table, the global
//! block list and the reservation slot, and exposes the public
//! allocation, protection and mapping surface. One context models one
//! emulated machine; everything on it is safe to share across the CPU
//! threads.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use tc_core::EmuStatus;

use crate::backing::{HostBacking, Protection};
use crate::block::Block;
use crate::constants::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::pages::{page_range, PageFlags, PageTable};
use crate::profile::{MemoryLocation, MemoryProfile};
use crate::reservation::ReservationMutex;
use crate::waiter::WaiterRegistry;

/// State guarded by the reservation mutex: the reservation slot and
/// the global block list.
pub(crate) struct VmState {
    /// Address of the live reservation, 0 when none.
    pub(crate) raddr: u32,
    /// Size of the live reservation, 0 when none.
    pub(crate) rsize: u32,
    /// Blocks indexed by location slot.
    pub(crate) locations: Vec<Option<Arc<Block>>>,
}

/// User-view protection for a set of page flags.
fn protection_for(flags: PageFlags) -> Protection {
    if flags.contains(PageFlags::WRITABLE) {
        Protection::ReadWrite
    } else if flags.contains(PageFlags::READABLE) {
        Protection::ReadOnly
    } else {
        Protection::None
    }
}

fn ranges_overlap(a: u32, a_size: u32, b: u32, b_size: u32) -> bool {
    a_size != 0
        && b_size != 0
        && a as u64 + a_size as u64 - 1 >= b as u64
        && b as u64 + b_size as u64 - 1 >= a as u64
}

/// One emulated machine's guest address space.
pub struct VmContext {
    pub(crate) backing: HostBacking,
    pub(crate) pages: PageTable,
    pub(crate) state: ReservationMutex<VmState>,
    /// Owner of the live reservation; readable without the lock.
    pub(crate) res_owner: AtomicU64,
    pub(crate) waiters: Arc<WaiterRegistry>,
    pub(crate) emu: EmuStatus,
    self_weak: Weak<VmContext>,
    profile: MemoryProfile,
}

impl VmContext {
    /// Create the address space for `profile` and start the waiter
    /// poll thread. The blocks of the profile's fixed layout are
    /// registered immediately.
    pub fn new(profile: MemoryProfile, emu: EmuStatus) -> VmResult<Arc<Self>> {
        let backing = HostBacking::new()?;

        let vm = Arc::new_cyclic(|self_weak| Self {
            backing,
            pages: PageTable::new(),
            state: ReservationMutex::new(VmState {
                raddr: 0,
                rsize: 0,
                locations: Vec::new(),
            }),
            res_owner: AtomicU64::new(0),
            waiters: Arc::new(WaiterRegistry::new()),
            emu: emu.clone(),
            self_weak: self_weak.clone(),
            profile,
        });

        {
            let mut state = vm.state.lock()?;
            state.locations = profile
                .layout()
                .iter()
                .map(|slot| {
                    slot.map(|(base, size)| {
                        Arc::new(Block::new(vm.self_weak.clone(), base, size, 0))
                    })
                })
                .collect();
        }

        WaiterRegistry::start_poller(vm.waiters.clone(), emu);

        tracing::debug!(?profile, "guest address space initialized");

        Ok(vm)
    }

    /// Guest profile this context was created for.
    pub fn profile(&self) -> MemoryProfile {
        self.profile
    }

    /// Tear down every block and stop the waiter poll thread.
    pub fn close(&self) -> VmResult<()> {
        let blocks: Vec<_> = {
            let mut state = self.state.lock()?;
            state.locations.drain(..).collect()
        };
        // block teardown re-acquires the reservation lock per block
        drop(blocks);

        self.waiters.shutdown();

        tracing::debug!("guest address space closed");
        Ok(())
    }

    // ---- page layer ----

    /// Map `[addr, addr + size)` with `flags`; every covered page must
    /// be free. Commits both views and zero-fills the range.
    pub(crate) fn page_map(&self, addr: u32, size: u32, flags: PageFlags) -> VmResult<()> {
        debug_assert!(size != 0 && (size | addr) % PAGE_SIZE == 0);
        debug_assert!(!flags.contains(PageFlags::ALLOCATED));

        for page in page_range(addr, size) {
            if !self.pages.load(page).is_empty() {
                return Err(VmError::AlreadyMapped((page as u32) << 12));
            }
        }

        self.backing
            .commit(addr, size, protection_for(flags))
            .map_err(|source| VmError::Protection { addr, source })?;

        for page in page_range(addr, size) {
            if !self
                .pages
                .exchange(page, flags | PageFlags::ALLOCATED)
                .is_empty()
            {
                return Err(VmError::ConcurrentAccess((page as u32) << 12));
            }
        }

        self.backing.zero_priv(addr, size);

        tc_core::vm_trace!(addr, size, ?flags, "pages mapped");
        Ok(())
    }

    /// Unmap `[addr, addr + size)`; every covered page must be
    /// allocated. Breaks reservations on the way and revokes both
    /// views.
    pub(crate) fn page_unmap_locked(
        &self,
        state: &mut VmState,
        addr: u32,
        size: u32,
    ) -> VmResult<()> {
        debug_assert!(size != 0 && (size | addr) % PAGE_SIZE == 0);

        for page in page_range(addr, size) {
            if !self.pages.load(page).contains(PageFlags::ALLOCATED) {
                return Err(VmError::NotMapped((page as u32) << 12));
            }
        }

        for page in page_range(addr, size) {
            self.reservation_break_locked(state, (page as u32) << 12)?;

            if !self
                .pages
                .exchange(page, PageFlags::empty())
                .contains(PageFlags::ALLOCATED)
            {
                return Err(VmError::ConcurrentAccess((page as u32) << 12));
            }
        }

        self.backing
            .decommit(addr, size)
            .map_err(|source| VmError::Protection { addr, source })?;

        tc_core::vm_trace!(addr, size, "pages unmapped");
        Ok(())
    }

    /// Test-and-change flags over `[addr, addr + size)`.
    ///
    /// Returns false (changing nothing) unless every covered page is
    /// allocated and carries all bits of `test`. Overlapping bits of
    /// `set` and `clear` toggle. Reservations on touched pages break;
    /// user-view protection follows the visible bits.
    pub fn page_protect(
        &self,
        addr: u32,
        size: u32,
        test: PageFlags,
        set: PageFlags,
        clear: PageFlags,
    ) -> VmResult<bool> {
        let mut state = self.state.lock()?;

        if size == 0 || (size | addr) % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgs { addr, size });
        }

        let toggle = set & clear;
        let test = test | PageFlags::ALLOCATED;

        for page in page_range(addr, size) {
            if self.pages.load(page) & test != test {
                return Ok(false);
            }
        }

        if toggle.is_empty() && set.is_empty() && clear.is_empty() {
            return Ok(true);
        }

        for page in page_range(addr, size) {
            let page_addr = (page as u32) << 12;

            self.reservation_break_locked(&mut state, page_addr)?;

            let before = self.pages.fetch_or(page, set & !toggle) & PageFlags::VISIBLE;
            self.pages.fetch_and_not(page, clear & !toggle);
            let after = (self.pages.fetch_xor(page, toggle) ^ toggle) & PageFlags::VISIBLE;

            if before != after {
                self.backing
                    .protect_user(page_addr, PAGE_SIZE, protection_for(after))
                    .map_err(|source| VmError::Protection {
                        addr: page_addr,
                        source,
                    })?;
            }
        }

        Ok(true)
    }

    /// Whether `[addr, addr + size)` is fully inside mapped memory.
    pub fn check_addr(&self, addr: u32, size: u32) -> bool {
        if size == 0 {
            return false;
        }

        let Some(last) = addr.checked_add(size - 1) else {
            return false;
        };

        ((addr >> 12)..=(last >> 12))
            .all(|page| self.pages.load(page as usize).contains(PageFlags::ALLOCATED))
    }

    // ---- block list ----

    /// Register a new block over `[addr, addr + size)`.
    ///
    /// Returns `None` when the range overlaps an existing block; every
    /// covered page must be free of the allocator.
    pub fn map(&self, addr: u32, size: u32, flags: u64) -> VmResult<Option<Arc<Block>>> {
        let mut state = self.state.lock()?;

        if size == 0 || (size | addr) % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgs { addr, size });
        }

        for block in state.locations.iter().flatten() {
            if ranges_overlap(addr, size, block.addr(), block.size()) {
                return Ok(None);
            }
        }

        for page in page_range(addr, size) {
            if !self.pages.load(page).is_empty() {
                return Err(VmError::AlreadyMapped((page as u32) << 12));
            }
        }

        let block = Arc::new(Block::new(self.self_weak.clone(), addr, size, flags));
        state.locations.push(Some(block.clone()));

        tc_core::vm_trace!(addr, size, "block mapped");
        Ok(Some(block))
    }

    /// Remove the block whose base is exactly `addr` and return it.
    /// Its pages are released when the last reference drops.
    pub fn unmap(&self, addr: u32) -> VmResult<Option<Arc<Block>>> {
        let mut state = self.state.lock()?;

        for slot in state.locations.iter_mut() {
            if slot.as_ref().is_some_and(|block| block.addr() == addr) {
                tc_core::vm_trace!(addr, "block unmapped");
                return Ok(slot.take());
            }
        }

        Ok(None)
    }

    /// Look up a block by location, or by address with
    /// [`MemoryLocation::Any`].
    pub fn get(&self, location: MemoryLocation, addr: u32) -> VmResult<Option<Arc<Block>>> {
        let state = self.state.lock()?;

        if location != MemoryLocation::Any {
            let Some(index) = location.index(self.profile) else {
                return Ok(None);
            };
            return Ok(state.locations.get(index).and_then(Clone::clone));
        }

        // search the location by address
        for block in state.locations.iter().flatten() {
            if addr >= block.addr() && addr as u64 <= block.addr() as u64 + block.size() as u64 - 1
            {
                return Ok(Some(block.clone()));
            }
        }

        Ok(None)
    }

    /// Allocate `size` bytes in the named region. Returns 0 when the
    /// region is exhausted.
    pub fn alloc(&self, size: u32, location: MemoryLocation, align: u32) -> VmResult<u32> {
        let block = self
            .get(location, 0)?
            .ok_or(VmError::InvalidLocation(location))?;

        block.alloc(self, size, align)
    }

    /// Allocate `size` bytes at exactly `addr` in the named region.
    /// Returns 0 when the range is unavailable.
    pub fn falloc(&self, addr: u32, size: u32, location: MemoryLocation) -> VmResult<u32> {
        let block = self
            .get(location, addr)?
            .ok_or(VmError::InvalidLocation(location))?;

        block.falloc(self, addr, size)
    }

    /// Release the allocation starting at `addr` in the named region.
    /// Returns false if no allocation starts there.
    pub fn dealloc(&self, addr: u32, location: MemoryLocation) -> VmResult<bool> {
        let block = self
            .get(location, addr)?
            .ok_or(VmError::InvalidLocation(location))?;

        block.dealloc(self, addr)
    }

    // ---- guest access ----

    /// Check that every page of `[addr, addr + len)` is allocated and
    /// carries `need`.
    fn validate_access(&self, addr: u32, len: usize, need: PageFlags) -> VmResult<()> {
        let size = len as u32;

        let Some(last) = addr.checked_add(size - 1) else {
            return Err(VmError::InvalidArgs { addr, size });
        };

        for page in (addr >> 12)..=(last >> 12) {
            let flags = self.pages.load(page as usize);

            if !flags.contains(PageFlags::ALLOCATED) {
                return Err(VmError::NotMapped(page << 12));
            }
            if !flags.contains(need) {
                return Err(VmError::InvalidPageFlags {
                    addr,
                    size,
                    flags: flags.bits(),
                });
            }
        }

        Ok(())
    }

    /// Copy guest memory at `addr` into `buf`. The range must be
    /// mapped and readable.
    ///
    /// Reads go through the privileged view, so they cannot fault
    /// against a page the reservation engine has locked down.
    pub fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> VmResult<()> {
        if buf.is_empty() {
            return Ok(());
        }

        self.validate_access(addr, buf.len(), PageFlags::READABLE)?;

        unsafe { buf.copy_from_slice(self.backing.priv_slice(addr, buf.len())) };
        Ok(())
    }

    /// Copy `data` into guest memory at `addr`. The range must be
    /// mapped and writable.
    ///
    /// Behaves like a native store: an overlapping reservation is
    /// broken and its waiters notified, so a racing store-conditional
    /// observes the conflict.
    pub fn write_bytes(&self, addr: u32, data: &[u8]) -> VmResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.validate_access(addr, data.len(), PageFlags::WRITABLE)?;

        let mut state = self.state.lock()?;

        let raddr = state.raddr;
        let rsize = state.rsize;
        let conflict = ranges_overlap(addr, data.len() as u32, raddr, rsize);

        if conflict {
            self.reservation_break_locked(&mut state, raddr)?;
        }

        unsafe {
            self.backing
                .priv_slice_mut(addr, data.len())
                .copy_from_slice(data)
        };

        drop(state);
        if conflict {
            self.waiters.notify_range(raddr, rsize);
        }

        Ok(())
    }

    /// Read a big-endian u16 from guest memory.
    pub fn read_be16(&self, addr: u32) -> VmResult<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Read a big-endian u32 from guest memory.
    pub fn read_be32(&self, addr: u32) -> VmResult<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Read a big-endian u64 from guest memory.
    pub fn read_be64(&self, addr: u32) -> VmResult<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Write a big-endian u16 to guest memory.
    pub fn write_be16(&self, addr: u32, value: u16) -> VmResult<()> {
        self.write_bytes(addr, &value.to_be_bytes())
    }

    /// Write a big-endian u32 to guest memory.
    pub fn write_be32(&self, addr: u32, value: u32) -> VmResult<()> {
        self.write_bytes(addr, &value.to_be_bytes())
    }

    /// Write a big-endian u64 to guest memory.
    pub fn write_be64(&self, addr: u32, value: u64) -> VmResult<()> {
        self.write_bytes(addr, &value.to_be_bytes())
    }
}

impl Drop for VmContext {
    fn drop(&mut self) {
        self.waiters.shutdown();
    }
}
