//! Guest address-space profiles and region naming.

use crate::constants::*;

/// Guest platform whose memory map is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryProfile {
    /// PlayStation 3
    Ps3,
    /// PlayStation Vita
    Psv,
    /// PlayStation Portable
    Psp,
}

impl MemoryProfile {
    /// Fixed `(base, size)` block layout for this profile, in slot
    /// order. Absent slots keep their index so locations stay stable.
    pub(crate) fn layout(self) -> &'static [Option<(u32, u32)>] {
        match self {
            Self::Ps3 => &[
                Some((PS3_MAIN_BASE, PS3_MAIN_SIZE)),   // main
                Some((PS3_USER_BASE, PS3_USER_SIZE)),   // user
                Some((PS3_VIDEO_BASE, PS3_VIDEO_SIZE)), // video
                Some((PS3_STACK_BASE, PS3_STACK_SIZE)), // stack
                Some((PS3_SPU_BASE, PS3_SPU_SIZE)),     // SPU
            ],
            Self::Psv => &[
                Some((PSV_RAM_BASE, PSV_RAM_SIZE)),   // RAM
                Some((PSV_USER_BASE, PSV_USER_SIZE)), // user
                None,                                 // video
                None,                                 // stack
            ],
            Self::Psp => &[
                Some((PSP_RAM_BASE, PSP_RAM_SIZE)),               // RAM
                Some((PSP_USER_BASE, PSP_USER_SIZE)),             // user
                Some((PSP_VRAM_BASE, PSP_VRAM_SIZE)),             // VRAM
                None,                                             // stack
                Some((PSP_SCRATCHPAD_BASE, PSP_SCRATCHPAD_SIZE)), // scratchpad
                Some((PSP_KERNEL_BASE, PSP_KERNEL_SIZE)),         // kernel
            ],
        }
    }
}

/// Named block slot in the global block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Main / RAM region
    Main,
    /// User-allocatable region
    User,
    /// Video memory
    Video,
    /// Thread stacks
    Stack,
    /// SPU local storage window (PS3)
    Spu,
    /// Scratchpad (PSP)
    Scratchpad,
    /// Kernel region (PSP)
    Kernel,
    /// Resolve the block by address instead of by slot
    Any,
}

impl MemoryLocation {
    /// Slot index of this location under `profile`, if it has one.
    pub(crate) fn index(self, profile: MemoryProfile) -> Option<usize> {
        match (self, profile) {
            (Self::Main, _) => Some(0),
            (Self::User, _) => Some(1),
            (Self::Video, _) => Some(2),
            (Self::Stack, _) => Some(3),
            (Self::Spu, MemoryProfile::Ps3) => Some(4),
            (Self::Scratchpad, MemoryProfile::Psp) => Some(4),
            (Self::Kernel, MemoryProfile::Psp) => Some(5),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ps3_layout() {
        let layout = MemoryProfile::Ps3.layout();

        assert_eq!(layout.len(), 5);
        assert_eq!(layout[0], Some((0x0001_0000, 0x1FFF_0000)));
        assert_eq!(layout[1], Some((0x2000_0000, 0x1000_0000)));
        assert_eq!(layout[2], Some((0xC000_0000, 0x1000_0000)));
        assert_eq!(layout[3], Some((0xD000_0000, 0x1000_0000)));
        assert_eq!(layout[4], Some((0xE000_0000, 0x2000_0000)));
    }

    #[test]
    fn test_psv_layout() {
        let layout = MemoryProfile::Psv.layout();

        assert_eq!(layout.len(), 4);
        assert_eq!(layout[0], Some((0x8100_0000, 0x1000_0000)));
        assert_eq!(layout[1], Some((0x9100_0000, 0x2F00_0000)));
        assert_eq!(layout[2], None);
        assert_eq!(layout[3], None);
    }

    #[test]
    fn test_psp_layout() {
        let layout = MemoryProfile::Psp.layout();

        assert_eq!(layout.len(), 6);
        assert_eq!(layout[0], Some((0x0800_0000, 0x0200_0000)));
        assert_eq!(layout[1], Some((0x0880_0000, 0x0180_0000)));
        assert_eq!(layout[2], Some((0x0400_0000, 0x0020_0000)));
        assert_eq!(layout[3], None);
        assert_eq!(layout[4], Some((0x0001_0000, 0x0000_4000)));
        assert_eq!(layout[5], Some((0x8800_0000, 0x0080_0000)));
    }

    #[test]
    fn test_location_indices() {
        assert_eq!(MemoryLocation::Main.index(MemoryProfile::Ps3), Some(0));
        assert_eq!(MemoryLocation::Spu.index(MemoryProfile::Ps3), Some(4));
        assert_eq!(MemoryLocation::Spu.index(MemoryProfile::Psp), None);
        assert_eq!(MemoryLocation::Scratchpad.index(MemoryProfile::Psp), Some(4));
        assert_eq!(MemoryLocation::Kernel.index(MemoryProfile::Psp), Some(5));
        assert_eq!(MemoryLocation::Kernel.index(MemoryProfile::Psv), None);
        assert_eq!(MemoryLocation::Any.index(MemoryProfile::Ps3), None);
    }
}
