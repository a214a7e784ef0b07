//! Synthetic universal binaries for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use unifat_core::header::fat::{FAT_MAGIC, FAT_MAGIC_64};
use unifat_core::CpuIdentity;

pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_RPATH: u32 = 0x8000_001c;

static NEXT: AtomicUsize = AtomicUsize::new(0);

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn arch(name: &str) -> CpuIdentity {
    CpuIdentity::from_name(name).unwrap()
}

/// A file under the system temp directory, removed on drop.
pub struct TempFile(pub PathBuf);

impl TempFile {
    pub fn with_contents(tag: &str, bytes: &[u8]) -> Self {
        let path = unique_path(tag);
        fs::write(&path, bytes).unwrap();
        TempFile(path)
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

pub fn unique_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "unifat-test-{}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::SeqCst),
        tag
    ))
}

fn put32(out: &mut Vec<u8>, v: u32, little_endian: bool) {
    out.extend_from_slice(&if little_endian {
        v.to_le_bytes()
    } else {
        v.to_be_bytes()
    });
}

fn put64(out: &mut Vec<u8>, v: u64, little_endian: bool) {
    out.extend_from_slice(&if little_endian {
        v.to_le_bytes()
    } else {
        v.to_be_bytes()
    });
}

fn padded_cstr(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 8 != 0 {
        bytes.push(0);
    }
    bytes
}

/// A little-endian Mach-O image with no load commands.
pub fn mach_image(cpu: CpuIdentity, filetype: u32) -> Vec<u8> {
    mach_dylib_with(cpu, filetype, &[], &[])
}

/// goblin rejects any slice shorter than a 64-bit `mach_header`, even for 32-bit images.
const MIN_IMAGE_SIZE: usize = 32;

/// A little-endian Mach-O image with `LC_LOAD_DYLIB` and `LC_RPATH` commands.
pub fn mach_dylib_with(
    cpu: CpuIdentity,
    filetype: u32,
    libs: &[&str],
    rpaths: &[&str],
) -> Vec<u8> {
    let mut cmds = Vec::new();
    let mut ncmds = 0;
    for lib in libs {
        let name = padded_cstr(lib);
        put32(&mut cmds, LC_LOAD_DYLIB, true);
        put32(&mut cmds, 24 + name.len() as u32, true);
        put32(&mut cmds, 24, true);
        put32(&mut cmds, 2, true);
        put32(&mut cmds, 0x1_0000, true);
        put32(&mut cmds, 0x1_0000, true);
        cmds.extend_from_slice(&name);
        ncmds += 1;
    }
    for rpath in rpaths {
        let path = padded_cstr(rpath);
        put32(&mut cmds, LC_RPATH, true);
        put32(&mut cmds, 12 + path.len() as u32, true);
        put32(&mut cmds, 12, true);
        cmds.extend_from_slice(&path);
        ncmds += 1;
    }

    let mut out = Vec::new();
    let magic = if cpu.is_64() { 0xfeed_facf } else { 0xfeed_face };
    put32(&mut out, magic, true);
    put32(&mut out, cpu.cpu_type, true);
    put32(&mut out, cpu.cpu_subtype, true);
    put32(&mut out, filetype, true);
    put32(&mut out, ncmds, true);
    put32(&mut out, cmds.len() as u32, true);
    put32(&mut out, 0, true);
    if cpu.is_64() {
        put32(&mut out, 0, true);
    }
    out.extend_from_slice(&cmds);
    if out.len() < MIN_IMAGE_SIZE {
        out.resize(MIN_IMAGE_SIZE, 0);
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub wide: bool,
    pub little_endian: bool,
    pub align: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            wide: false,
            little_endian: false,
            align: 12,
        }
    }
}

/// A record as written to the architecture table.
#[derive(Debug, Clone, Copy)]
pub struct Record {
    pub cpu: CpuIdentity,
    pub offset: u64,
    pub size: u64,
    pub align: u32,
}

/// Builds a universal binary from `(record cpu, slice bytes)` pairs.
pub fn fat(slices: &[(CpuIdentity, Vec<u8>)]) -> (Vec<u8>, Vec<Record>) {
    fat_with(Layout::default(), slices)
}

pub fn fat_with(layout: Layout, slices: &[(CpuIdentity, Vec<u8>)]) -> (Vec<u8>, Vec<Record>) {
    let record_size = if layout.wide { 32 } else { 20 };
    let alignment = 1u64 << layout.align;

    let mut cursor = 8 + (slices.len() * record_size) as u64;
    let mut records = Vec::new();
    for (cpu, bytes) in slices {
        let offset = cursor.div_ceil(alignment) * alignment;
        records.push(Record {
            cpu: *cpu,
            offset,
            size: bytes.len() as u64,
            align: layout.align,
        });
        cursor = offset + bytes.len() as u64;
    }

    let mut out = raw_fat(layout, &records);
    for (record, (_, bytes)) in records.iter().zip(slices) {
        out.resize(record.offset as usize, 0);
        out.extend_from_slice(bytes);
    }
    (out, records)
}

/// Just the header and architecture table, with no slice data.
pub fn raw_fat(layout: Layout, records: &[Record]) -> Vec<u8> {
    let le = layout.little_endian;
    let magic = if layout.wide { FAT_MAGIC_64 } else { FAT_MAGIC };

    let mut out = Vec::new();
    put32(&mut out, magic, le);
    put32(&mut out, records.len() as u32, le);
    for record in records {
        put32(&mut out, record.cpu.cpu_type, le);
        put32(&mut out, record.cpu.cpu_subtype, le);
        if layout.wide {
            put64(&mut out, record.offset, le);
            put64(&mut out, record.size, le);
        } else {
            put32(&mut out, record.offset as u32, le);
            put32(&mut out, record.size as u32, le);
        }
        put32(&mut out, record.align, le);
        if layout.wide {
            put32(&mut out, 0, le);
        }
    }
    out
}
