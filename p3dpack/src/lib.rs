//! Reading, writing and verifying Multifile packages.
mod error;
pub mod filespec;
pub mod manifest;
pub mod multifile;

pub use error::{PackError, Result};
pub use filespec::{FileSpec, Verification, VerifyMode};
pub use manifest::{ExtractFilter, PackageManifest};
