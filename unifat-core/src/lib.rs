pub mod arch;
mod error;
pub mod header;
pub mod image;
pub mod loader;
pub mod universal;

pub use arch::*;
pub use error::*;
pub use image::*;
pub use loader::*;
pub use universal::*;
