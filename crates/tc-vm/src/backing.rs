//! Dual-view host backing for the guest address space.
//!
//! The whole 4 GB guest space is reserved twice against one anonymous
//! shared object: a *user view* whose per-page host protection mirrors
//! guest page flags, and a *privileged view* that stays read-write for
//! every committed page so the emulator can bypass guest protection.
//! Both views start inaccessible; pages are promoted when mapped.
//!
//! # Safety
//! All host memory management is inherently unsafe. This module
//! encapsulates the raw mappings behind a small typed surface; callers
//! are responsible for only touching committed guest ranges.

use std::io;
use std::ptr::NonNull;

use crate::constants::ADDRESS_SPACE_SIZE;

/// Host protection of a page range in one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    /// No access
    None,
    /// Read-only
    ReadOnly,
    /// Read and write
    ReadWrite,
}

#[cfg(unix)]
mod platform {
    use std::ffi::CString;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::{Protection, ADDRESS_SPACE_SIZE};

    fn prot_bits(prot: Protection) -> libc::c_int {
        match prot {
            Protection::None => libc::PROT_NONE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }

    /// Map the shared backing object twice, both views inaccessible.
    pub fn map_views() -> io::Result<(*mut u8, *mut u8)> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        // The name must be unique per context; the object is unlinked
        // as soon as both views exist.
        let name = format!(
            "/tricell-vm-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad shm name"))?;

        unsafe {
            let fd = libc::shm_open(
                name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            );
            if fd == -1 {
                return Err(io::Error::last_os_error());
            }

            if libc::ftruncate(fd, ADDRESS_SPACE_SIZE as libc::off_t) == -1 {
                let err = io::Error::last_os_error();
                libc::shm_unlink(name.as_ptr());
                libc::close(fd);
                return Err(err);
            }

            let user = libc::mmap(
                std::ptr::null_mut(),
                ADDRESS_SPACE_SIZE as usize,
                libc::PROT_NONE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            let privileged = libc::mmap(
                std::ptr::null_mut(),
                ADDRESS_SPACE_SIZE as usize,
                libc::PROT_NONE,
                libc::MAP_SHARED,
                fd,
                0,
            );

            libc::shm_unlink(name.as_ptr());
            libc::close(fd);

            if user == libc::MAP_FAILED || privileged == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                if user != libc::MAP_FAILED {
                    libc::munmap(user, ADDRESS_SPACE_SIZE as usize);
                }
                if privileged != libc::MAP_FAILED {
                    libc::munmap(privileged, ADDRESS_SPACE_SIZE as usize);
                }
                return Err(err);
            }

            Ok((user as *mut u8, privileged as *mut u8))
        }
    }

    pub unsafe fn unmap_views(user: *mut u8, privileged: *mut u8) {
        libc::munmap(user as *mut libc::c_void, ADDRESS_SPACE_SIZE as usize);
        libc::munmap(privileged as *mut libc::c_void, ADDRESS_SPACE_SIZE as usize);
    }

    /// Change protection of a committed range in one view.
    pub unsafe fn protect(ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
        if libc::mprotect(ptr as *mut libc::c_void, len, prot_bits(prot)) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Commit a range in one view with the given protection.
    pub unsafe fn commit(ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
        // Pages of the shared object materialize on first touch.
        protect(ptr, len, prot)
    }
}

#[cfg(windows)]
mod platform {
    use std::io;

    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, VirtualAlloc, VirtualProtect,
        FILE_MAP_WRITE, MEMORY_MAPPED_VIEW_ADDRESS, MEM_COMMIT, PAGE_NOACCESS, PAGE_READONLY,
        PAGE_READWRITE, SEC_RESERVE,
    };

    use super::{Protection, ADDRESS_SPACE_SIZE};

    fn prot_bits(prot: Protection) -> u32 {
        match prot {
            Protection::None => PAGE_NOACCESS,
            Protection::ReadOnly => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
        }
    }

    /// Map the shared backing object twice, both views reserved only.
    pub fn map_views() -> io::Result<(*mut u8, *mut u8)> {
        unsafe {
            let handle = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE | SEC_RESERVE,
                0x1,
                0x0,
                std::ptr::null(),
            );
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }

            let user = MapViewOfFile(handle, FILE_MAP_WRITE, 0, 0, ADDRESS_SPACE_SIZE as usize);
            let privileged =
                MapViewOfFile(handle, FILE_MAP_WRITE, 0, 0, ADDRESS_SPACE_SIZE as usize);

            CloseHandle(handle);

            if user.Value.is_null() || privileged.Value.is_null() {
                let err = io::Error::last_os_error();
                if !user.Value.is_null() {
                    UnmapViewOfFile(user);
                }
                if !privileged.Value.is_null() {
                    UnmapViewOfFile(privileged);
                }
                return Err(err);
            }

            Ok((user.Value as *mut u8, privileged.Value as *mut u8))
        }
    }

    pub unsafe fn unmap_views(user: *mut u8, privileged: *mut u8) {
        UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
            Value: user as *mut _,
        });
        UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
            Value: privileged as *mut _,
        });
    }

    /// Change protection of a committed range in one view.
    pub unsafe fn protect(ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
        let mut old = 0;
        if VirtualProtect(ptr as *mut _, len, prot_bits(prot), &mut old) == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Commit a range in one view with the given protection.
    pub unsafe fn commit(ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
        if VirtualAlloc(ptr as *mut _, len, MEM_COMMIT, prot_bits(prot)).is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// The two host views over the guest address space.
pub struct HostBacking {
    user: NonNull<u8>,
    privileged: NonNull<u8>,
}

// The raw views are plain shared memory; synchronization of guest
// contents is the callers' contract.
unsafe impl Send for HostBacking {}
unsafe impl Sync for HostBacking {}

impl HostBacking {
    /// Reserve both views. Everything starts inaccessible.
    pub fn new() -> io::Result<Self> {
        let (user, privileged) = platform::map_views()?;
        tracing::debug!(?user, ?privileged, "guest backing views mapped");
        Ok(Self {
            user: NonNull::new(user).ok_or_else(|| io::Error::other("null user view"))?,
            privileged: NonNull::new(privileged)
                .ok_or_else(|| io::Error::other("null privileged view"))?,
        })
    }

    /// Raw user-view pointer for a guest address.
    #[inline]
    pub(crate) fn user_ptr(&self, addr: u32) -> *mut u8 {
        unsafe { self.user.as_ptr().add(addr as usize) }
    }

    /// Raw privileged-view pointer for a guest address.
    #[inline]
    pub(crate) fn priv_ptr(&self, addr: u32) -> *mut u8 {
        unsafe { self.privileged.as_ptr().add(addr as usize) }
    }

    /// Commit `[addr, addr + size)` in both views; the privileged view
    /// becomes read-write, the user view gets `user_prot`.
    pub(crate) fn commit(&self, addr: u32, size: u32, user_prot: Protection) -> io::Result<()> {
        unsafe {
            platform::commit(self.priv_ptr(addr), size as usize, Protection::ReadWrite)?;
            platform::commit(self.user_ptr(addr), size as usize, user_prot)
        }
    }

    /// Revoke all access to `[addr, addr + size)` in both views.
    pub(crate) fn decommit(&self, addr: u32, size: u32) -> io::Result<()> {
        unsafe {
            platform::protect(self.user_ptr(addr), size as usize, Protection::None)?;
            platform::protect(self.priv_ptr(addr), size as usize, Protection::None)
        }
    }

    /// Reprotect `[addr, addr + size)` in the user view only.
    pub(crate) fn protect_user(&self, addr: u32, size: u32, prot: Protection) -> io::Result<()> {
        unsafe { platform::protect(self.user_ptr(addr), size as usize, prot) }
    }

    /// Zero `[addr, addr + size)` through the privileged view.
    ///
    /// The range must be committed.
    pub(crate) fn zero_priv(&self, addr: u32, size: u32) {
        unsafe { std::ptr::write_bytes(self.priv_ptr(addr), 0, size as usize) }
    }

    /// Borrow `[addr, addr + len)` of the user view.
    ///
    /// # Safety
    /// The range must be committed and readable in the user view, and
    /// must not be concurrently reprotected for the borrow's lifetime.
    #[inline]
    pub(crate) unsafe fn user_slice(&self, addr: u32, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.user_ptr(addr), len)
    }

    /// Borrow `[addr, addr + len)` of the privileged view.
    ///
    /// # Safety
    /// The range must be committed.
    #[inline]
    pub(crate) unsafe fn priv_slice(&self, addr: u32, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.priv_ptr(addr), len)
    }

    /// Borrow `[addr, addr + len)` of the privileged view mutably.
    ///
    /// # Safety
    /// The range must be committed. Guest memory is shared; racing
    /// guest-visible writes is the callers' contract.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn priv_slice_mut(&self, addr: u32, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.priv_ptr(addr), len)
    }
}

impl Drop for HostBacking {
    fn drop(&mut self) {
        unsafe { platform::unmap_views(self.user.as_ptr(), self.privileged.as_ptr()) }
    }
}
