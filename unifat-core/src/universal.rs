use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail};
use memmap2::Mmap;

use crate::header::fat::{self, FatArch, FatHeader};
use crate::header::Header;
use crate::{
    CpuIdentity, DlopenLoader, Error, ExecutableImage, HostArchitecture, HostLoader, ImageLocator,
    ImageParser, MachImageParser, NativeHost, Result,
};

/// A multi-architecture Mach-O file and the valid images inside it.
///
/// The file stays memory-mapped for the lifetime of the value.
#[derive(Debug)]
pub struct UniversalBinary {
    path: PathBuf,
    header: FatHeader,
    executables: Vec<ExecutableImage>,
    map: Mmap,
}

impl UniversalBinary {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &MachImageParser)
    }

    /// Opens `path`, parsing each architecture slice with `parser`.
    ///
    /// Records whose slice cannot be parsed are skipped. Fails with
    /// [`Error::NoValidArchitectures`] only if every record is skipped.
    pub fn open_with<P: AsRef<Path>>(path: P, parser: &dyn ImageParser) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
            _ => Error::Io(e),
        })?;

        if file.metadata()?.len() == 0 {
            return Err(Error::InvalidFormat("empty file".into()));
        }
        // Read-only mapping; the file must not be truncated while the container is alive.
        let map = unsafe { Mmap::map(&file)? };

        let (header, arches) = fat::parse(&map)?;
        log::info!(
            "{}: {} architecture record(s) ({:?})",
            path.display(),
            arches.len(),
            header.variant
        );

        let mut executables = Vec::with_capacity(arches.len());
        for (i, arch) in arches.iter().enumerate() {
            match parse_record(path, &map, arch, parser) {
                Ok(exe) => {
                    log::debug!(
                        "record {}: {} {}-bit {} at {:#x}, {} bytes",
                        i,
                        exe.cpu(),
                        if exe.image.is_64() { 64 } else { 32 },
                        exe.image.format_name(),
                        exe.offset,
                        exe.size
                    );
                    executables.push(exe);
                }
                Err(e) => log::warn!(
                    "{}: skipping record {} ({}): {:#}",
                    path.display(),
                    i,
                    arch.cpu(),
                    e
                ),
            }
        }

        if executables.is_empty() {
            return Err(Error::NoValidArchitectures(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            executables,
            map,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FatHeader {
        &self.header
    }

    /// Valid images in file order.
    pub fn executables(&self) -> &[ExecutableImage] {
        &self.executables
    }

    /// The bytes of an image's slice, re-located through its offset and size.
    pub fn image_bytes(&self, exe: &ExecutableImage) -> Option<&[u8]> {
        let start = usize::try_from(exe.offset).ok()?;
        let end = start.checked_add(usize::try_from(exe.size).ok()?)?;
        self.map.get(start..end)
    }

    pub fn executable_matching_current_architecture(&self) -> Result<&ExecutableImage> {
        self.executable_matching(&NativeHost)
    }

    /// Returns the first image, in file order, that can run on `host`.
    ///
    /// The host is queried on every call. An earlier generic image wins over a
    /// later exact one, matching the host loader's own selection order.
    pub fn executable_matching(&self, host: &dyn HostArchitecture) -> Result<&ExecutableImage> {
        let host = host.current();
        self.executables
            .iter()
            .find(|exe| exe.cpu().is_compatible_with(&host))
            .ok_or(Error::NoMatchingArchitecture { host })
    }

    /// Returns the image built for exactly `cpu`, ignoring wildcard subtypes.
    pub fn executable_for(&self, cpu: CpuIdentity) -> Option<&ExecutableImage> {
        self.executables.iter().find(|exe| {
            let ours = exe.cpu();
            ours.cpu_type == cpu.cpu_type && ours.masked_subtype() == cpu.masked_subtype()
        })
    }

    /// Loads the image matching this host with `dlopen`, applying `rpaths` as
    /// search overrides for its `@rpath/` dependencies.
    pub fn load_library_with_rpaths(&self, rpaths: &[String]) -> Result<()> {
        self.load_library_with(&NativeHost, &DlopenLoader::default(), rpaths)
    }

    pub fn load_library_with(
        &self,
        host: &dyn HostArchitecture,
        loader: &dyn HostLoader,
        rpaths: &[String],
    ) -> Result<()> {
        let exe = self.executable_matching(host)?;
        let data = self.image_bytes(exe).ok_or_else(|| {
            Error::LoadFailed(format!("slice at {:#x} is outside the file", exe.offset))
        })?;

        let locator = ImageLocator {
            path: &self.path,
            arch: exe.cpu(),
            offset: exe.offset,
            size: exe.size,
            data,
            whole_file: exe.offset == 0 && exe.size == self.map.len() as u64,
            libraries: &exe.image.libraries,
            embedded_rpaths: &exe.image.rpaths,
        };

        if !exe.image.is_loadable() {
            log::warn!(
                "{} slice is a {} file of type {:#x}; the host loader may reject it",
                locator.arch,
                exe.image.format_name(),
                exe.image.filetype
            );
        }

        log::info!(
            "loading {} slice of {} with {} rpath override(s)",
            locator.arch,
            self.path.display(),
            rpaths.len()
        );
        loader
            .load(&locator, rpaths)
            .map_err(|e| Error::LoadFailed(format!("{:#}", e)))
    }
}

fn parse_record(
    path: &Path,
    data: &[u8],
    arch: &FatArch,
    parser: &dyn ImageParser,
) -> anyhow::Result<ExecutableImage> {
    let range = arch.slice_range(data.len()).ok_or_else(|| {
        anyhow!(
            "slice {:#x}+{:#x} extends past end of file ({:#x} bytes)",
            arch.offset,
            arch.size,
            data.len()
        )
    })?;

    let image = parser.parse_image(path, arch.offset, &data[range])?;
    let image_cpu = image.cpu();
    if image_cpu.cpu_type != arch.cputype {
        bail!(
            "image is built for {} but the record says {}",
            image_cpu,
            arch.cpu()
        );
    }
    Ok(ExecutableImage::new(arch, image))
}
