//! Guest CPU execution contexts.
//!
//! Register state and stack bounds for the three guest processors,
//! plus the discriminated [`CpuContext`] handed to memory-layer
//! helpers that manipulate guest stacks. Instruction execution lives
//! elsewhere; these types only carry architectural state.

pub mod arm;
pub mod ppu;
pub mod spu;

pub use arm::ArmContext;
pub use ppu::PpuContext;
pub use spu::SpuContext;

/// Guest CPU kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuKind {
    /// PowerPC Processing Unit (PS3)
    Ppu,
    /// Synergistic Processing Unit thread (PS3)
    Spu,
    /// Raw SPU, directly mapped local storage (PS3)
    RawSpu,
    /// ARMv7 core (PS Vita / PSP profiles)
    Arm,
}

/// Execution context of one emulated CPU, discriminated by kind.
pub enum CpuContext {
    Ppu(PpuContext),
    Spu(SpuContext),
    RawSpu(SpuContext),
    Arm(ArmContext),
}

impl CpuContext {
    /// Get the CPU kind tag
    pub fn kind(&self) -> CpuKind {
        match self {
            Self::Ppu(_) => CpuKind::Ppu,
            Self::Spu(_) => CpuKind::Spu,
            Self::RawSpu(_) => CpuKind::RawSpu,
            Self::Arm(_) => CpuKind::Arm,
        }
    }
}
