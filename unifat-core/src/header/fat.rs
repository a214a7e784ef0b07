use std::io::{self, Cursor, Read};
use std::ops::Range;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};

use crate::{CpuIdentity, Error, Result};

pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;
pub const FAT_MAGIC_64: u32 = 0xcafe_babf;
pub const FAT_CIGAM_64: u32 = 0xbfba_feca;

/// Record layout selected by the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatVariant {
    /// `fat_arch`: 32-bit offset and size.
    Fat32,
    /// `fat_arch_64`: 64-bit offset and size, plus a reserved word.
    Fat64,
}

impl FatVariant {
    pub fn record_size(self) -> usize {
        match self {
            FatVariant::Fat32 => 20,
            FatVariant::Fat64 => 32,
        }
    }
}

/// The header at the very start of a universal binary (`struct fat_header`).
///
/// Universal binaries are written big-endian. A byte-swapped magic means the
/// writer used little-endian order, and every following field is read that way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatHeader {
    /// Magic as read big-endian from the first four bytes.
    pub magic: u32,

    /// Number of `fat_arch` records that follow the header.
    pub nfat_arch: u32,

    pub variant: FatVariant,

    /// True if the header and records are stored little-endian.
    pub little_endian: bool,
}

/// One architecture record (`struct fat_arch` / `struct fat_arch_64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,

    /// Absolute file offset of the image.
    pub offset: u64,

    /// Size of the image in bytes.
    pub size: u64,

    /// Alignment of the image as a power of two.
    pub align: u32,
}

impl FatArch {
    pub fn cpu(&self) -> CpuIdentity {
        CpuIdentity::new(self.cputype, self.cpusubtype)
    }

    /// Byte range of the image within a file of `file_len` bytes, if it fits.
    pub fn slice_range(&self, file_len: usize) -> Option<Range<usize>> {
        let start = usize::try_from(self.offset).ok()?;
        let end = start.checked_add(usize::try_from(self.size).ok()?)?;
        (end <= file_len).then_some(start..end)
    }
}

impl FatHeader {
    pub const SIZE: usize = 8;

    pub fn from_reader<R: Read>(cur: &mut R) -> Result<FatHeader> {
        let magic = cur
            .read_u32::<BigEndian>()
            .map_err(|_| Error::InvalidFormat("file too short for a fat header".into()))?;

        let (variant, little_endian) = match magic {
            FAT_MAGIC => (FatVariant::Fat32, false),
            FAT_MAGIC_64 => (FatVariant::Fat64, false),
            FAT_CIGAM => (FatVariant::Fat32, true),
            FAT_CIGAM_64 => (FatVariant::Fat64, true),
            MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64 => {
                return Err(Error::UnsupportedVariant(
                    "single-architecture Mach-O image, not a universal binary".into(),
                ));
            }
            _ => return Err(Error::InvalidFormat(format!("bad magic {:#010x}", magic))),
        };

        let nfat_arch = if little_endian {
            cur.read_u32::<LittleEndian>()
        } else {
            cur.read_u32::<BigEndian>()
        }
        .map_err(|_| Error::InvalidFormat("truncated fat header".into()))?;

        Ok(FatHeader {
            magic,
            nfat_arch,
            variant,
            little_endian,
        })
    }

    /// Reads the record table that follows the header, in file order.
    pub fn read_arches<R: Read>(&self, cur: &mut R) -> Result<Vec<FatArch>> {
        let mut arches = Vec::new();
        for i in 0..self.nfat_arch {
            let arch = if self.little_endian {
                read_arch::<LittleEndian, _>(cur, self.variant)
            } else {
                read_arch::<BigEndian, _>(cur, self.variant)
            }
            .map_err(|_| {
                Error::InvalidFormat(format!(
                    "architecture table truncated at record {} of {}",
                    i, self.nfat_arch
                ))
            })?;
            arches.push(arch);
        }
        Ok(arches)
    }
}

fn read_arch<B: ByteOrder, R: Read>(cur: &mut R, variant: FatVariant) -> io::Result<FatArch> {
    let cputype = cur.read_u32::<B>()?;
    let cpusubtype = cur.read_u32::<B>()?;
    let (offset, size) = match variant {
        FatVariant::Fat32 => (cur.read_u32::<B>()? as u64, cur.read_u32::<B>()? as u64),
        FatVariant::Fat64 => (cur.read_u64::<B>()?, cur.read_u64::<B>()?),
    };
    let align = cur.read_u32::<B>()?;
    if variant == FatVariant::Fat64 {
        let _reserved = cur.read_u32::<B>()?;
    }

    Ok(FatArch {
        cputype,
        cpusubtype,
        offset,
        size,
        align,
    })
}

/// Parses the header and the complete record table of a universal binary.
pub fn parse(data: &[u8]) -> Result<(FatHeader, Vec<FatArch>)> {
    let mut cursor = Cursor::new(data);
    let header = FatHeader::from_reader(&mut cursor)?;

    let table_len = (header.nfat_arch as u64) * header.variant.record_size() as u64;
    if FatHeader::SIZE as u64 + table_len > data.len() as u64 {
        return Err(Error::InvalidFormat(format!(
            "{} architecture records do not fit in {} bytes",
            header.nfat_arch,
            data.len()
        )));
    }

    let arches = header.read_arches(&mut cursor)?;
    Ok((header, arches))
}
