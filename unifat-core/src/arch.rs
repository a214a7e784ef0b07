//! Processor identities and the rules for matching them against a host.
//!
//! Mach-O identifies a processor with a `(cputype, cpusubtype)` pair. The upper
//! byte of the subtype carries capability bits (e.g. the arm64e pointer
//! authentication ABI version) that do not take part in matching.

use std::fmt;

pub use goblin::mach::cputype::{CpuSubType, CpuType};
use goblin::mach::cputype::{
    CPU_SUBTYPE_MASK, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_POWERPC, CPU_TYPE_POWERPC64,
    CPU_TYPE_X86, CPU_TYPE_X86_64,
};

pub const CPU_TYPE_ANY: CpuType = u32::MAX;
pub const CPU_SUBTYPE_MULTIPLE: CpuSubType = u32::MAX;

pub const CPU_SUBTYPE_I386_ALL: CpuSubType = 3;
pub const CPU_SUBTYPE_X86_64_ALL: CpuSubType = 3;
pub const CPU_SUBTYPE_X86_64_H: CpuSubType = 8;

pub const CPU_SUBTYPE_ARM_ALL: CpuSubType = 0;
pub const CPU_SUBTYPE_ARM_V6: CpuSubType = 6;
pub const CPU_SUBTYPE_ARM_V7: CpuSubType = 9;
pub const CPU_SUBTYPE_ARM_V7S: CpuSubType = 11;
pub const CPU_SUBTYPE_ARM_V7K: CpuSubType = 12;

pub const CPU_SUBTYPE_ARM64_ALL: CpuSubType = 0;
pub const CPU_SUBTYPE_ARM64_V8: CpuSubType = 1;
pub const CPU_SUBTYPE_ARM64E: CpuSubType = 2;

pub const CPU_SUBTYPE_POWERPC_ALL: CpuSubType = 0;

/// Conventional architecture names, as accepted by `lipo -arch`.
const ARCH_NAMES: &[(&str, CpuType, CpuSubType)] = &[
    ("i386", CPU_TYPE_X86, CPU_SUBTYPE_I386_ALL),
    ("x86_64", CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL),
    ("x86_64h", CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H),
    ("arm", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_ALL),
    ("armv6", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6),
    ("armv7", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7),
    ("armv7s", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7S),
    ("armv7k", CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7K),
    ("arm64", CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL),
    ("arm64v8", CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_V8),
    ("arm64e", CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E),
    ("ppc", CPU_TYPE_POWERPC, CPU_SUBTYPE_POWERPC_ALL),
    ("ppc64", CPU_TYPE_POWERPC64, CPU_SUBTYPE_POWERPC_ALL),
];

/// The "any variant" subtype of a processor family, if the family defines one.
fn family_all_subtype(cpu_type: CpuType) -> Option<CpuSubType> {
    match cpu_type {
        CPU_TYPE_X86 => Some(CPU_SUBTYPE_I386_ALL),
        CPU_TYPE_X86_64 => Some(CPU_SUBTYPE_X86_64_ALL),
        CPU_TYPE_ARM => Some(CPU_SUBTYPE_ARM_ALL),
        CPU_TYPE_ARM64 => Some(CPU_SUBTYPE_ARM64_ALL),
        CPU_TYPE_POWERPC | CPU_TYPE_POWERPC64 => Some(CPU_SUBTYPE_POWERPC_ALL),
        _ => None,
    }
}

/// A processor family and variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuIdentity {
    pub cpu_type: CpuType,
    pub cpu_subtype: CpuSubType,
}

impl CpuIdentity {
    pub const fn new(cpu_type: CpuType, cpu_subtype: CpuSubType) -> Self {
        Self {
            cpu_type,
            cpu_subtype,
        }
    }

    /// The subtype with capability bits cleared.
    pub fn masked_subtype(&self) -> CpuSubType {
        if self.cpu_subtype == CPU_SUBTYPE_MULTIPLE {
            return CPU_SUBTYPE_MULTIPLE;
        }
        self.cpu_subtype & !CPU_SUBTYPE_MASK
    }

    /// Returns true if code built for `self` can be selected on `host`.
    ///
    /// Processor types must be equal. Subtypes are compatible when they are
    /// equal after masking, or when either side is `CPU_SUBTYPE_MULTIPLE` or the
    /// family's "ALL" subtype. Families without an "ALL" subtype only match exactly.
    pub fn is_compatible_with(&self, host: &CpuIdentity) -> bool {
        if self.cpu_type != host.cpu_type {
            return false;
        }
        if self.cpu_subtype == CPU_SUBTYPE_MULTIPLE || host.cpu_subtype == CPU_SUBTYPE_MULTIPLE {
            return true;
        }

        let (ours, theirs) = (self.masked_subtype(), host.masked_subtype());
        if ours == theirs {
            return true;
        }
        match family_all_subtype(self.cpu_type) {
            Some(all) => ours == all || theirs == all,
            None => false,
        }
    }

    /// Looks up a conventional architecture name such as `x86_64` or `arm64e`.
    pub fn from_name(name: &str) -> Option<Self> {
        ARCH_NAMES
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|&(_, cpu_type, cpu_subtype)| Self::new(cpu_type, cpu_subtype))
    }

    /// The conventional name of this architecture, if it has one.
    pub fn name(&self) -> Option<&'static str> {
        let subtype = self.masked_subtype();
        ARCH_NAMES
            .iter()
            .find(|(_, t, s)| *t == self.cpu_type && *s == subtype)
            .map(|(n, _, _)| *n)
    }

    pub fn is_64(&self) -> bool {
        self.cpu_type & goblin::mach::cputype::CPU_ARCH_ABI64 != 0
    }
}

impl std::str::FromStr for CpuIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("Unknown architecture: {}", s))
    }
}

impl fmt::Display for CpuIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "cpu({:#x},{:#x})", self.cpu_type, self.cpu_subtype),
        }
    }
}

/// Source of the processor identity that images are matched against.
///
/// Queried on every match, never cached, so implementations may report a
/// different identity from one call to the next.
pub trait HostArchitecture {
    fn current(&self) -> CpuIdentity;
}

/// A fixed identity forces selection of that architecture.
impl HostArchitecture for CpuIdentity {
    fn current(&self) -> CpuIdentity {
        *self
    }
}

impl<F> HostArchitecture for F
where
    F: Fn() -> CpuIdentity,
{
    fn current(&self) -> CpuIdentity {
        self()
    }
}

/// The processor this process is running on.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeHost;

impl HostArchitecture for NativeHost {
    #[cfg(target_os = "macos")]
    fn current(&self) -> CpuIdentity {
        // Reports the translated architecture when running under Rosetta.
        match (sysctl_u32(c"hw.cputype"), sysctl_u32(c"hw.cpusubtype")) {
            (Some(cpu_type), Some(cpu_subtype)) => CpuIdentity::new(cpu_type, cpu_subtype),
            _ => {
                log::warn!("sysctl hw.cputype failed; using compile-time architecture");
                compile_time_identity()
            }
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn current(&self) -> CpuIdentity {
        compile_time_identity()
    }
}

#[cfg(target_os = "macos")]
fn sysctl_u32(name: &std::ffi::CStr) -> Option<u32> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>();
    let rc = unsafe {
        libc::sysctlbyname(
            name.as_ptr(),
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    (rc == 0).then_some(value as u32)
}

fn compile_time_identity() -> CpuIdentity {
    if cfg!(target_arch = "x86_64") {
        CpuIdentity::new(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL)
    } else if cfg!(target_arch = "aarch64") {
        CpuIdentity::new(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL)
    } else if cfg!(target_arch = "x86") {
        CpuIdentity::new(CPU_TYPE_X86, CPU_SUBTYPE_I386_ALL)
    } else if cfg!(target_arch = "arm") {
        CpuIdentity::new(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_ALL)
    } else if cfg!(target_arch = "powerpc64") {
        CpuIdentity::new(CPU_TYPE_POWERPC64, CPU_SUBTYPE_POWERPC_ALL)
    } else if cfg!(target_arch = "powerpc") {
        CpuIdentity::new(CPU_TYPE_POWERPC, CPU_SUBTYPE_POWERPC_ALL)
    } else {
        CpuIdentity::new(CPU_TYPE_ANY, CPU_SUBTYPE_MULTIPLE)
    }
}
