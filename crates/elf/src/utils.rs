//! Small predicates shared by the accessor and loader layers.

use crate::section::{SectionFlags, SHT_NOBITS};
use crate::vpu::{VPU_SHT_CMX_METADATA, VPU_SHT_CMX_WORKSPACE};

/// Rounds `size` up to the next multiple of `alignment`.
///
/// Zero `size` or zero `alignment` is passed through unchanged.
#[must_use]
pub fn align_up(size: usize, alignment: usize) -> usize {
    if size == 0 || alignment == 0 {
        return size;
    }
    size.div_ceil(alignment) * alignment
}

/// Returns true when `value` is a non-zero power of two.
#[must_use]
pub fn is_power_of_two(value: u64) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// Returns true when the flag word marks a section the accelerator itself
/// reaches: executable code or data owned by one of the processor kinds.
#[must_use]
pub fn has_npu_access(sh_flags: u64) -> bool {
    SectionFlags::from_bits_retain(sh_flags).intersects(
        SectionFlags::EXECINSTR
            | SectionFlags::VPU_PROC_DPU
            | SectionFlags::VPU_PROC_DMA
            | SectionFlags::VPU_PROC_SHAVE,
    )
}

/// Returns true when the flag word marks a symbol table describing the
/// user-visible I/O surface.
#[must_use]
pub fn is_network_io(sh_flags: u64) -> bool {
    SectionFlags::from_bits_retain(sh_flags).intersects(
        SectionFlags::VPU_USERINPUT
            | SectionFlags::VPU_USEROUTPUT
            | SectionFlags::VPU_PROFOUTPUT,
    )
}

/// Returns true when sections of the given type carry payload bytes in the
/// container file. `NOBITS` and the CMX scratch types occupy memory only at
/// run time.
#[must_use]
pub fn has_memory_footprint(sh_type: u32) -> bool {
    !matches!(
        sh_type,
        SHT_NOBITS | VPU_SHT_CMX_METADATA | VPU_SHT_CMX_WORKSPACE
    )
}
