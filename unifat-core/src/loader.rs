//! Handing a selected image to the host's dynamic loader.
//!
//! The host facility sits behind [`HostLoader`] so the container logic can be
//! exercised without a real loader. [`DlopenLoader`] is the `dlopen(3)`
//! implementation used on unix hosts.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

use crate::CpuIdentity;

/// Everything a host loader needs to find the selected slice.
#[derive(Debug, Clone, Copy)]
pub struct ImageLocator<'a> {
    /// Path of the universal binary.
    pub path: &'a Path,
    pub arch: CpuIdentity,
    pub offset: u64,
    pub size: u64,
    /// The slice bytes, for loaders that cannot map a region at an offset.
    pub data: &'a [u8],
    /// True if the slice spans the entire file.
    pub whole_file: bool,
    /// Install names of the image's dependent libraries.
    pub libraries: &'a [String],
    /// `LC_RPATH` entries embedded in the image, searched after the overrides.
    pub embedded_rpaths: &'a [String],
}

/// The host's dynamic-loading facility.
pub trait HostLoader {
    /// Loads the located image into the process namespace.
    ///
    /// `rpaths` are searched in order, earliest first, when resolving the
    /// image's `@rpath/` dependencies. An empty list applies no overrides.
    fn load(&self, locator: &ImageLocator<'_>, rpaths: &[String]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Where slices that do not span the whole file are written before loading.
    pub extract_dir: PathBuf,
    /// Load with `RTLD_GLOBAL` instead of `RTLD_LOCAL`.
    pub global: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            extract_dir: std::env::temp_dir().join("unifat"),
            global: true,
        }
    }
}

/// An `@rpath/` dependency and the override locations that exist for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpathDependency {
    pub install_name: String,
    /// Existing files, in override order.
    pub candidates: Vec<PathBuf>,
}

/// Expands `@loader_path` and `@executable_path` at the start of an rpath entry.
pub fn expand_rpath(entry: &str, loader_dir: &Path) -> PathBuf {
    if let Some(rest) = strip_token(entry, "@loader_path") {
        return loader_dir.join(rest);
    }
    if let Some(rest) = strip_token(entry, "@executable_path") {
        match std::env::current_exe() {
            Ok(exe) => {
                let dir = exe.parent().unwrap_or(Path::new("/"));
                return dir.join(rest);
            }
            Err(e) => log::warn!("cannot expand {}: {}", entry, e),
        }
    }
    PathBuf::from(entry)
}

/// Strips a whole leading path component such as `@loader_path`.
fn strip_token<'e>(entry: &'e str, token: &str) -> Option<&'e str> {
    let rest = entry.strip_prefix(token)?;
    if rest.is_empty() {
        return Some(rest);
    }
    rest.strip_prefix('/').map(|r| r.trim_start_matches('/'))
}

/// Directories searched for `@rpath/` dependencies: overrides in the given
/// order, then the image's own `LC_RPATH` entries.
pub fn rpath_search_order(locator: &ImageLocator<'_>, rpaths: &[String]) -> Vec<String> {
    rpaths
        .iter()
        .chain(locator.embedded_rpaths)
        .cloned()
        .collect()
}

static NEXT_EXTRACTION: AtomicU64 = AtomicU64::new(0);

/// Finds, for each `@rpath/` library, the override directories that contain it.
///
/// Libraries referenced by absolute or other relative install names are not
/// affected by overrides and are left out.
pub fn rpath_candidates(
    libraries: &[String],
    rpaths: &[String],
    loader_dir: &Path,
) -> Vec<RpathDependency> {
    libraries
        .iter()
        .filter_map(|lib| {
            let suffix = lib.strip_prefix("@rpath/")?;
            let candidates = rpaths
                .iter()
                .map(|dir| expand_rpath(dir, loader_dir).join(suffix))
                .filter(|p| p.is_file())
                .collect();
            Some(RpathDependency {
                install_name: lib.clone(),
                candidates,
            })
        })
        .collect()
}

/// Loads images with `dlopen(3)`.
///
/// Overrides are applied by preloading each `@rpath/` dependency from the first
/// override directory that provides it, so the image binds to that copy. The
/// process environment is left untouched.
#[derive(Debug, Clone, Default)]
pub struct DlopenLoader {
    config: LoaderConfig,
}

impl DlopenLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn preload_dependencies(&self, locator: &ImageLocator<'_>, rpaths: &[String]) {
        let loader_dir = locator.path.parent().unwrap_or(Path::new("."));
        let search = rpath_search_order(locator, rpaths);
        for dep in rpath_candidates(locator.libraries, &search, loader_dir) {
            let mut loaded = false;
            for candidate in &dep.candidates {
                match self.dlopen(candidate) {
                    Ok(()) => {
                        log::debug!("{} -> {}", dep.install_name, candidate.display());
                        loaded = true;
                        break;
                    }
                    Err(e) => log::warn!("skipping {}: {:#}", candidate.display(), e),
                }
            }
            if !loaded {
                log::debug!(
                    "{} not found in rpath search paths; leaving it to the host loader",
                    dep.install_name
                );
            }
        }
    }

    /// Writes the slice to its own file so the host loader sees it at offset zero.
    ///
    /// Every call gets a fresh path; the host loader identifies images by path,
    /// so a reused name would hand back whatever was loaded under it before.
    fn extract(&self, locator: &ImageLocator<'_>) -> Result<PathBuf> {
        let dir = &self.config.extract_dir;
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let stem = locator
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let (target, mut file) = loop {
            let target = dir.join(format!(
                "{}-{}-{}-{:x}-{}",
                stem,
                locator.arch,
                std::process::id(),
                locator.offset,
                NEXT_EXTRACTION.fetch_add(1, Ordering::Relaxed)
            ));
            match OpenOptions::new().write(true).create_new(true).open(&target) {
                Ok(file) => break (target, file),
                // Left behind by an earlier process with the same pid.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to create {}", target.display()))
                }
            }
        };

        if let Err(e) = file.write_all(locator.data) {
            let _ = fs::remove_file(&target);
            return Err(e)
                .with_context(|| format!("failed to extract slice to {}", target.display()));
        }
        log::debug!(
            "extracted {} bytes at {:#x} to {}",
            locator.size,
            locator.offset,
            target.display()
        );
        Ok(target)
    }

    #[cfg(unix)]
    fn dlopen(&self, path: &Path) -> Result<()> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .with_context(|| format!("path contains a NUL byte: {}", path.display()))?;
        let scope = if self.config.global {
            libc::RTLD_GLOBAL
        } else {
            libc::RTLD_LOCAL
        };

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | scope) };
        if handle.is_null() {
            anyhow::bail!("{}", last_dl_error());
        }
        // The image stays in the process namespace; the handle is not needed.
        Ok(())
    }

    #[cfg(not(unix))]
    fn dlopen(&self, path: &Path) -> Result<()> {
        anyhow::bail!(
            "cannot load {}: dynamic loading is not supported on {}",
            path.display(),
            std::env::consts::OS
        )
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        return "unknown dlopen error".to_string();
    }
    unsafe { std::ffi::CStr::from_ptr(msg) }
        .to_string_lossy()
        .into_owned()
}

impl HostLoader for DlopenLoader {
    fn load(&self, locator: &ImageLocator<'_>, rpaths: &[String]) -> Result<()> {
        self.preload_dependencies(locator, rpaths);

        if locator.whole_file {
            return self
                .dlopen(locator.path)
                .with_context(|| format!("dlopen {}", locator.path.display()));
        }

        let extracted = self.extract(locator)?;
        let result = self
            .dlopen(&extracted)
            .with_context(|| format!("dlopen {} ({})", locator.path.display(), locator.arch));
        if let Err(e) = fs::remove_file(&extracted) {
            log::warn!("failed to remove {}: {}", extracted.display(), e);
        }
        result
    }
}
