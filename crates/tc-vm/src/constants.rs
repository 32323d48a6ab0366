//! Guest memory geometry and profile layout constants

/// Standard page size (4 KB)
pub const PAGE_SIZE: u32 = 0x1000;

/// Total address space size (4 GB, 32-bit)
pub const ADDRESS_SPACE_SIZE: u64 = 0x1_0000_0000;

/// Number of pages in the address space
pub const PAGE_COUNT: usize = (ADDRESS_SPACE_SIZE / PAGE_SIZE as u64) as usize;

/// Largest reservation (and waiter range) size, one page
pub const MAX_RESERVATION_SIZE: u32 = 0x1000;

/// Capacity of the waiter table
pub const WAITER_LIMIT: usize = 1024;

// PS3 memory map

/// Main memory base address
pub const PS3_MAIN_BASE: u32 = 0x0001_0000;
/// Main memory size
pub const PS3_MAIN_SIZE: u32 = 0x1FFF_0000;

/// User memory base address
pub const PS3_USER_BASE: u32 = 0x2000_0000;
/// User memory size (256 MB)
pub const PS3_USER_SIZE: u32 = 0x1000_0000;

/// RSX local memory (VRAM) base
pub const PS3_VIDEO_BASE: u32 = 0xC000_0000;
/// RSX local memory size (256 MB)
pub const PS3_VIDEO_SIZE: u32 = 0x1000_0000;

/// Stack area base
pub const PS3_STACK_BASE: u32 = 0xD000_0000;
/// Stack area size
pub const PS3_STACK_SIZE: u32 = 0x1000_0000;

/// SPU local storage window base
pub const PS3_SPU_BASE: u32 = 0xE000_0000;
/// SPU local storage window size
pub const PS3_SPU_SIZE: u32 = 0x2000_0000;

// PS Vita memory map

/// RAM base address
pub const PSV_RAM_BASE: u32 = 0x8100_0000;
/// RAM size (256 MB)
pub const PSV_RAM_SIZE: u32 = 0x1000_0000;

/// User memory base address
pub const PSV_USER_BASE: u32 = 0x9100_0000;
/// User memory size
pub const PSV_USER_SIZE: u32 = 0x2F00_0000;

// PSP memory map

/// RAM base address
pub const PSP_RAM_BASE: u32 = 0x0800_0000;
/// RAM size (32 MB)
pub const PSP_RAM_SIZE: u32 = 0x0200_0000;

/// User memory base address
pub const PSP_USER_BASE: u32 = 0x0880_0000;
/// User memory size (24 MB)
pub const PSP_USER_SIZE: u32 = 0x0180_0000;

/// VRAM base address
pub const PSP_VRAM_BASE: u32 = 0x0400_0000;
/// VRAM size (2 MB)
pub const PSP_VRAM_SIZE: u32 = 0x0020_0000;

/// Scratchpad base address
pub const PSP_SCRATCHPAD_BASE: u32 = 0x0001_0000;
/// Scratchpad size (16 KB)
pub const PSP_SCRATCHPAD_SIZE: u32 = 0x0000_4000;

/// Kernel memory base address
pub const PSP_KERNEL_BASE: u32 = 0x8800_0000;
/// Kernel memory size (8 MB)
pub const PSP_KERNEL_SIZE: u32 = 0x0080_0000;
