use std::io;
use std::num;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PackError>;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("int conversion error: {0}")]
    TryFromIntError(#[from] num::TryFromIntError),
    #[error("failed to parse archive: {0}")]
    ParsingError(String),
    #[error("incompatible multifile version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("unsupported scale factor {0}")]
    UnsupportedScaleFactor(u32),
    #[error("failed to find file entry '{0}'")]
    EntryNotFound(String),
    #[error("unable to extract '{filename}': expected {expected} bytes, got {copied}")]
    TruncatedSubfile {
        filename: String,
        expected: u64,
        copied: u64,
    },
    #[error("unable to write to '{}': {}", .path.display(), .source)]
    OutputUnwritable { path: PathBuf, source: io::Error },
    #[error("refusing to overwrite '{}'", .0.display())]
    OutputExists(PathBuf),
    #[error("unsafe member path '{0}'")]
    UnsafePath(String),
    #[error("invalid package manifest: {0}")]
    ManifestError(String),
    #[error("failed to serialize data: {0}")]
    SerializationError(String),
}

impl PackError {
    pub fn parsing_error(msg: impl Into<String>) -> Self {
        Self::ParsingError(msg.into())
    }

    pub fn manifest_error(msg: impl Into<String>) -> Self {
        Self::ManifestError(msg.into())
    }

    pub fn serialization_error(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    pub(crate) fn output_unwritable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::OutputUnwritable {
            path: path.into(),
            source,
        }
    }
}
