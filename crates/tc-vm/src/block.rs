//! Named guest-memory regions and their page-granular sub-allocator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;

use crate::constants::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::pages::{align_up, page_range, PageFlags};
use crate::vm::VmContext;

/// A contiguous region of the guest address space with its own
/// first-fit page allocator.
///
/// Internal mutations are serialized by the block's own mutex; the
/// page-unmap step of a deallocation additionally takes the global
/// reservation lock.
pub struct Block {
    addr: u32,
    size: u32,
    flags: u64,
    used: AtomicU32,
    map: Mutex<BTreeMap<u32, u32>>,
    vm: Weak<VmContext>,
}

impl Block {
    pub(crate) fn new(vm: Weak<VmContext>, addr: u32, size: u32, flags: u64) -> Self {
        Self {
            addr,
            size,
            flags,
            used: AtomicU32::new(0),
            map: Mutex::new(BTreeMap::new()),
            vm,
        }
    }

    /// Base guest address of the region.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Opaque profile tag supplied at mapping time.
    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// Bytes currently allocated out of this region.
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Relaxed)
    }

    /// Map `size` bytes at `addr` if every covered page is free.
    ///
    /// Called with the block mutex held via the `map` guard.
    fn try_alloc(
        &self,
        vm: &VmContext,
        map: &mut BTreeMap<u32, u32>,
        addr: u32,
        size: u32,
    ) -> VmResult<bool> {
        // check if the memory area is already mapped
        for page in page_range(addr, size) {
            if !vm.pages.load(page).is_empty() {
                return Ok(false);
            }
        }

        // try to reserve "physical" memory
        loop {
            let used = self.used.load(Ordering::Relaxed);

            if used > self.size {
                return Err(VmError::UsedBeyondCapacity(used));
            }

            if used as u64 + size as u64 > self.size as u64 {
                return Ok(false);
            }

            if self
                .used
                .compare_exchange(used, used + size, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        vm.page_map(addr, size, PageFlags::READABLE | PageFlags::WRITABLE)?;

        map.insert(addr, size);

        Ok(true)
    }

    /// Allocate `size` bytes anywhere in the region at the given
    /// alignment. Returns the chosen address, or 0 when the region is
    /// exhausted.
    pub(crate) fn alloc(&self, vm: &VmContext, size: u32, align: u32) -> VmResult<u32> {
        let mut map = self.map.lock();

        // align to the minimal page size
        let size = align_up(size, PAGE_SIZE);

        // it's page allocation, so sub-page alignments are just silly
        if align < PAGE_SIZE || !align.is_power_of_two() {
            return Err(VmError::InvalidAlignment { size, align });
        }

        if size == 0 || size > self.size {
            return Ok(0);
        }

        let end = self.addr as u64 + self.size as u64;

        // search for an appropriate place (unoptimized); candidates
        // must fit entirely inside the block
        let mut addr = align_up(self.addr, align);
        while addr >= self.addr && addr as u64 + size as u64 <= end {
            if self.try_alloc(vm, &mut map, addr, size)? {
                return Ok(addr);
            }

            if self.used.load(Ordering::Relaxed) as u64 + size as u64 > self.size as u64 {
                return Ok(0);
            }

            addr = match addr.checked_add(align) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(0)
    }

    /// Allocate `size` bytes at exactly `addr`. Returns `addr`, or 0
    /// when out of bounds or already occupied.
    pub(crate) fn falloc(&self, vm: &VmContext, addr: u32, size: u32) -> VmResult<u32> {
        let mut map = self.map.lock();

        // align to the minimal page size
        let size = align_up(size, PAGE_SIZE);

        if size == 0 || size > self.size || addr < self.addr {
            return Ok(0);
        }

        let last = addr as u64 + size as u64 - 1;
        let block_last = self.addr as u64 + self.size as u64 - 1;

        if last >= block_last {
            return Ok(0);
        }

        if !self.try_alloc(vm, &mut map, addr, size)? {
            return Ok(0);
        }

        Ok(addr)
    }

    /// Release the allocation starting at `addr`. Returns false if no
    /// allocation starts there.
    pub(crate) fn dealloc(&self, vm: &VmContext, addr: u32) -> VmResult<bool> {
        let mut map = self.map.lock();

        let Some(size) = map.remove(&addr) else {
            return Ok(false);
        };

        // return "physical" memory
        self.used.fetch_sub(size, Ordering::Relaxed);

        // unmap under the reservation lock
        let mut state = vm.state.lock()?;
        vm.page_unmap_locked(&mut state, addr, size)?;

        Ok(true)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let map = self.map.get_mut();

        if map.is_empty() {
            return;
        }

        // If the owning context is already gone its backing dies with
        // it and there is nothing left to release.
        let Some(vm) = self.vm.upgrade() else {
            return;
        };

        match vm.state.lock() {
            Ok(mut state) => {
                for (&addr, &size) in map.iter() {
                    if let Err(err) = vm.page_unmap_locked(&mut state, addr, size) {
                        tracing::error!(addr, size, %err, "failed to release block pages");
                    }
                }
            }
            Err(err) => tracing::error!(addr = self.addr, %err, "failed to tear down block"),
        };
    }
}
