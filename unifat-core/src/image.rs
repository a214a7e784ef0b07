use std::path::Path;

use anyhow::{Context, Result};
use goblin::mach::MachO;

use crate::header::fat::FatArch;
use crate::header::mach::MachImage;
use crate::CpuIdentity;

/// One architecture slice of a universal binary.
///
/// `offset` and `size` locate the slice in the container file, so it can be
/// re-read through [`crate::UniversalBinary::image_bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableImage {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub offset: u64,
    pub size: u64,
    /// Alignment as a power of two, as stored in the record.
    pub align: u32,
    pub image: MachImage,
}

impl ExecutableImage {
    pub fn new(arch: &FatArch, image: MachImage) -> Self {
        Self {
            cpu_type: arch.cputype,
            cpu_subtype: arch.cpusubtype,
            offset: arch.offset,
            size: arch.size,
            align: arch.align,
            image,
        }
    }

    pub fn cpu(&self) -> CpuIdentity {
        CpuIdentity::new(self.cpu_type, self.cpu_subtype)
    }

    /// Alignment in bytes, or `None` if the exponent does not fit in 64 bits.
    pub fn alignment(&self) -> Option<u64> {
        1u64.checked_shl(self.align)
    }
}

/// Parses one slice of a universal binary as a single-architecture image.
pub trait ImageParser {
    /// `data` holds exactly the slice; `offset` is where it starts in `path`.
    fn parse_image(&self, path: &Path, offset: u64, data: &[u8]) -> Result<MachImage>;
}

/// Parses slices with goblin.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachImageParser;

impl ImageParser for MachImageParser {
    fn parse_image(&self, path: &Path, offset: u64, data: &[u8]) -> Result<MachImage> {
        let macho = MachO::parse(data, 0).with_context(|| {
            format!(
                "failed to parse Mach-O slice at {:#x} in {}",
                offset,
                path.display()
            )
        })?;
        Ok(MachImage::from_goblin(&macho))
    }
}
