use goblin::mach::header::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE};
use goblin::mach::MachO;

use crate::header::Header;
use crate::CpuIdentity;

/// Owned summary of a single-architecture Mach-O image.
///
/// Built from goblin's borrowed parse so the descriptor can outlive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachImage {
    pub cputype: u32,
    pub cpusubtype: u32,

    /// `MH_EXECUTE`, `MH_DYLIB`, `MH_BUNDLE`, ...
    pub filetype: u32,

    pub is_64: bool,
    pub little_endian: bool,

    /// `LC_ID_DYLIB` install name, for dylibs.
    pub install_name: Option<String>,

    /// Install names of the dependent libraries, in load command order.
    pub libraries: Vec<String>,

    /// Embedded `LC_RPATH` entries.
    pub rpaths: Vec<String>,
}

impl MachImage {
    pub fn from_goblin(macho: &MachO) -> Self {
        Self {
            cputype: macho.header.cputype,
            cpusubtype: macho.header.cpusubtype,
            filetype: macho.header.filetype,
            is_64: macho.is_64,
            little_endian: macho.little_endian,
            install_name: macho.name.map(str::to_string),
            // goblin reserves the first slot for the image itself
            libraries: macho
                .libs
                .iter()
                .filter(|lib| **lib != "self")
                .map(|lib| lib.to_string())
                .collect(),
            rpaths: macho.rpaths.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl Header for MachImage {
    fn cpu(&self) -> CpuIdentity {
        CpuIdentity::new(self.cputype, self.cpusubtype)
    }

    fn is_64(&self) -> bool {
        self.is_64
    }

    fn format_name(&self) -> &'static str {
        "Mach-O"
    }

    fn is_loadable(&self) -> bool {
        matches!(self.filetype, MH_EXECUTE | MH_DYLIB | MH_BUNDLE)
    }
}
