pub mod fat;
pub mod mach;

use crate::CpuIdentity;

pub trait Header: std::fmt::Debug + Send + Sync {
    /// Returns the processor the image was built for.
    fn cpu(&self) -> CpuIdentity;

    /// Returns true if this is a 64-bit image.
    fn is_64(&self) -> bool;

    /// Returns a short human-readable name, e.g. "Mach-O".
    fn format_name(&self) -> &'static str;

    /// Returns true if a dynamic loader can map the image (executable, dylib or bundle).
    fn is_loadable(&self) -> bool;
}
