//! Expected size, timestamp and MD5 digest of a package file.
use std::convert::TryFrom;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::{PackError, Result};
use filetime::FileTime;
use hex::FromHex;
use md5::{Digest, Md5};
use quick_xml::events::BytesStart;

/// Size in bytes of the digests stored in a `FileSpec`
pub const HASH_SIZE: usize = 16;
const HASH_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Trusts matching size and modification time, hashes otherwise
    Quick,
    /// Always hashes the file's content
    Full,
}

impl Default for VerifyMode {
    fn default() -> Self {
        VerifyMode::Quick
    }
}

/// Outcome of a file verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Intact,
    /// Content matched but the modification time had to be reset
    Repaired,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch,
    /// No digest to compare the content against
    NoHash,
    Unreadable,
}

impl Verification {
    pub fn is_valid(self) -> bool {
        matches!(self, Verification::Intact | Verification::Repaired)
    }
}

/// Description of a file as listed in a package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileSpec {
    pub filename: String,
    pub size: u64,
    pub timestamp: u64,
    pub hash: Option<[u8; HASH_SIZE]>,
}

impl FileSpec {
    pub fn new(
        filename: impl Into<String>,
        size: u64,
        timestamp: u64,
        hash: Option<[u8; HASH_SIZE]>,
    ) -> Self {
        Self {
            filename: filename.into(),
            size,
            timestamp,
            hash,
        }
    }

    /// Describes an existing file located at `base_dir/filename`.
    pub fn from_file<P: AsRef<Path>>(base_dir: P, filename: &str) -> Result<Self> {
        let pathname = base_dir.as_ref().join(filename);
        let metadata = fs::metadata(&pathname)?;
        let mtime = FileTime::from_last_modification_time(&metadata).unix_seconds();
        Ok(Self {
            filename: filename.to_string(),
            size: metadata.len(),
            timestamp: u64::try_from(mtime.max(0))?,
            hash: Some(compute_hash(&pathname)?),
        })
    }

    /// Reads a FileSpec from the attributes of an XML element.
    ///
    /// `filename` is mandatory. Missing or malformed `size` and `timestamp`
    /// attributes default to 0, and a `hash` that isn't exactly 32 hex digits
    /// is treated as absent.
    pub fn load_xml(element: &BytesStart) -> Result<Self> {
        let mut filename = None;
        let mut spec = Self::default();
        for attribute in element.attributes() {
            let attribute = attribute.map_err(|e| PackError::manifest_error(e.to_string()))?;
            let value = attribute
                .unescape_value()
                .map_err(|e| PackError::manifest_error(e.to_string()))?;
            match attribute.key.as_ref() {
                b"filename" => filename = Some(value.into_owned()),
                b"size" => spec.size = parse_unsigned(&value),
                b"timestamp" => spec.timestamp = parse_unsigned(&value),
                b"hash" => spec.hash = decode_hash(&value),
                _ => {}
            }
        }
        spec.filename = filename.ok_or_else(|| {
            PackError::manifest_error(format!(
                "<{}> element without a filename",
                String::from_utf8_lossy(element.name().as_ref())
            ))
        })?;
        Ok(spec)
    }

    /// Writes this FileSpec as attributes of `element`.
    pub fn store_xml(&self, element: &mut BytesStart) {
        element.push_attribute(("filename", self.filename.as_str()));
        element.push_attribute(("size", self.size.to_string().as_str()));
        element.push_attribute(("timestamp", self.timestamp.to_string().as_str()));
        if let Some(hash_hex) = self.hash_hex() {
            element.push_attribute(("hash", hash_hex.as_str()));
        }
    }

    pub fn hash_hex(&self) -> Option<String> {
        self.hash.as_ref().map(hex::encode)
    }

    pub fn get_pathname<P: AsRef<Path>>(&self, base_dir: P) -> PathBuf {
        base_dir.as_ref().join(&self.filename)
    }

    /// Checks the file against this FileSpec, hashing only if its
    /// modification time differs from the expected timestamp.
    ///
    /// When the hash matches despite the mismatched modification time, the
    /// file's modification time is reset to the expected timestamp (access
    /// time is preserved) so that the next call takes the fast path.
    pub fn quick_verify<P: AsRef<Path>>(&self, base_dir: P) -> bool {
        self.verify(base_dir, VerifyMode::Quick).is_valid()
    }

    /// Checks the file's size and hash regardless of its modification time.
    ///
    /// Resets the modification time like `quick_verify` when the content
    /// matches.
    pub fn full_verify<P: AsRef<Path>>(&self, base_dir: P) -> bool {
        self.verify(base_dir, VerifyMode::Full).is_valid()
    }

    pub fn verify<P: AsRef<Path>>(&self, base_dir: P, mode: VerifyMode) -> Verification {
        let pathname = self.get_pathname(base_dir);
        let metadata = match fs::metadata(&pathname) {
            Ok(metadata) => metadata,
            Err(err) => {
                log::debug!("'{}' is missing: {}", pathname.display(), err);
                return Verification::Missing;
            }
        };
        if metadata.len() != self.size {
            log::debug!(
                "'{}' has size {} instead of {}",
                pathname.display(),
                metadata.len(),
                self.size
            );
            return Verification::SizeMismatch {
                expected: self.size,
                actual: metadata.len(),
            };
        }

        let expected_mtime = self.expected_mtime();
        let actual_mtime = FileTime::from_last_modification_time(&metadata);
        let mtime_matches =
            expected_mtime.map(|mtime| mtime.unix_seconds()) == Some(actual_mtime.unix_seconds());
        if mode == VerifyMode::Quick && mtime_matches {
            return Verification::Intact;
        }
        if !mtime_matches {
            log::debug!(
                "'{}' has timestamp {} instead of {}",
                pathname.display(),
                actual_mtime.unix_seconds(),
                self.timestamp
            );
        }

        let expected_hash = match self.hash {
            Some(hash) => hash,
            None => {
                log::debug!("No hash to check '{}' against", pathname.display());
                return Verification::NoHash;
            }
        };
        let actual_hash = match compute_hash(&pathname) {
            Ok(hash) => hash,
            Err(err) => {
                log::debug!("Unable to read '{}': {}", pathname.display(), err);
                return Verification::Unreadable;
            }
        };
        if actual_hash != expected_hash {
            log::debug!("'{}' has the wrong hash", pathname.display());
            return Verification::HashMismatch;
        }

        match expected_mtime {
            Some(expected_mtime) if !mtime_matches => {
                restore_mtime(&pathname, &metadata, expected_mtime);
                Verification::Repaired
            }
            _ => Verification::Intact,
        }
    }

    /// Returns true if the content of the file at `pathname` matches the
    /// expected hash. Unreadable files and FileSpecs without a hash never
    /// match.
    pub fn check_hash<P: AsRef<Path>>(&self, pathname: P) -> bool {
        match (self.hash, compute_hash(pathname)) {
            (Some(expected_hash), Ok(actual_hash)) => expected_hash == actual_hash,
            _ => false,
        }
    }

    fn expected_mtime(&self) -> Option<FileTime> {
        i64::try_from(self.timestamp)
            .ok()
            .map(|seconds| FileTime::from_unix_time(seconds, 0))
    }
}

/// Computes the MD5 digest of a file's content.
pub fn compute_hash<P: AsRef<Path>>(pathname: P) -> io::Result<[u8; HASH_SIZE]> {
    let mut file = File::open(pathname)?;
    let mut hasher = Md5::new();
    let mut buffer = [0_u8; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(bytes_read) => bytes_read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..bytes_read]);
    }
    let mut hash = [0_u8; HASH_SIZE];
    hash.copy_from_slice(&hasher.finalize());
    Ok(hash)
}

fn restore_mtime(pathname: &Path, metadata: &Metadata, mtime: FileTime) {
    let atime = FileTime::from_last_access_time(metadata);
    match filetime::set_file_times(pathname, atime, mtime) {
        Ok(()) => log::debug!(
            "Reset timestamp of '{}' to {}",
            pathname.display(),
            mtime.unix_seconds()
        ),
        Err(err) => log::warn!(
            "Unable to reset timestamp of '{}': {}",
            pathname.display(),
            err
        ),
    }
}

/// Decodes a digest written as exactly 32 hex digits, in either case.
fn decode_hash(value: &str) -> Option<[u8; HASH_SIZE]> {
    <[u8; HASH_SIZE]>::from_hex(value).ok()
}

// Leading decimal digits, saturating on overflow. Anything else yields 0.
fn parse_unsigned(value: &str) -> u64 {
    value
        .trim_start()
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0_u64, |acc, digit| {
            acc.saturating_mul(10)
                .saturating_add(u64::from(digit - b'0'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use tempfile::{tempdir, TempDir};

    const HELLO_MD5: [u8; 16] = hex!("5d41402abc4b2a76b9719d911017c592");
    const HELLO_TIMESTAMP: u64 = 1_000_000_000;

    fn hello_spec() -> FileSpec {
        FileSpec::new("a.txt", 5, HELLO_TIMESTAMP, Some(HELLO_MD5))
    }

    fn write_file(dir: &TempDir, name: &str, content: &[u8], mtime: i64) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
        path
    }

    fn modification_time(path: &Path) -> i64 {
        let metadata = fs::metadata(path).unwrap();
        FileTime::from_last_modification_time(&metadata).unix_seconds()
    }

    #[test]
    fn test_quick_verify_fast_path() {
        let temp_dir = tempdir().unwrap();
        write_file(&temp_dir, "a.txt", b"hello", 1_000_000_000);
        assert!(hello_spec().quick_verify(temp_dir.path()));

        // Content is never hashed when size and mtime match
        let wrong_hash = FileSpec::new("a.txt", 5, HELLO_TIMESTAMP, Some([0; 16]));
        assert_eq!(
            wrong_hash.verify(temp_dir.path(), VerifyMode::Quick),
            Verification::Intact
        );
        assert_eq!(
            wrong_hash.verify(temp_dir.path(), VerifyMode::Full),
            Verification::HashMismatch
        );
        let no_hash = FileSpec::new("a.txt", 5, HELLO_TIMESTAMP, None);
        assert!(no_hash.quick_verify(temp_dir.path()));
        assert!(!no_hash.full_verify(temp_dir.path()));
    }

    #[test]
    fn test_quick_verify_restores_mtime() {
        let temp_dir = tempdir().unwrap();
        let path = write_file(&temp_dir, "a.txt", b"hello", 999_999_999);
        assert_eq!(
            hello_spec().verify(temp_dir.path(), VerifyMode::Quick),
            Verification::Repaired
        );
        assert_eq!(modification_time(&path), 1_000_000_000);
        // Now takes the fast path
        assert_eq!(
            hello_spec().verify(temp_dir.path(), VerifyMode::Quick),
            Verification::Intact
        );
    }

    #[test]
    fn test_full_verify_restores_mtime() {
        let temp_dir = tempdir().unwrap();
        let path = write_file(&temp_dir, "a.txt", b"hello", 123);
        assert!(hello_spec().full_verify(temp_dir.path()));
        assert_eq!(modification_time(&path), 1_000_000_000);
        assert_eq!(
            hello_spec().verify(temp_dir.path(), VerifyMode::Full),
            Verification::Intact
        );
    }

    #[test]
    fn test_size_mismatch() {
        let temp_dir = tempdir().unwrap();
        let path = write_file(&temp_dir, "a.txt", b"hello!", 1_000_000_000);
        assert!(!hello_spec().quick_verify(temp_dir.path()));
        assert!(!hello_spec().full_verify(temp_dir.path()));
        assert_eq!(
            hello_spec().verify(temp_dir.path(), VerifyMode::Quick),
            Verification::SizeMismatch {
                expected: 5,
                actual: 6
            }
        );
        assert_eq!(modification_time(&path), 1_000_000_000);
    }

    #[test]
    fn test_content_mismatch() {
        let temp_dir = tempdir().unwrap();
        let path = write_file(&temp_dir, "a.txt", b"jello", 999_999_999);
        assert!(!hello_spec().quick_verify(temp_dir.path()));
        assert!(!hello_spec().full_verify(temp_dir.path()));
        assert_eq!(
            hello_spec().verify(temp_dir.path(), VerifyMode::Full),
            Verification::HashMismatch
        );
        // Left untouched
        assert_eq!(modification_time(&path), 999_999_999);
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = tempdir().unwrap();
        assert!(!hello_spec().quick_verify(temp_dir.path()));
        assert_eq!(
            hello_spec().verify(temp_dir.path(), VerifyMode::Full),
            Verification::Missing
        );
    }

    #[test]
    fn test_check_hash() {
        let temp_dir = tempdir().unwrap();
        let path = write_file(&temp_dir, "a.txt", b"hello", 0);
        assert!(hello_spec().check_hash(&path));
        assert!(!hello_spec().check_hash(temp_dir.path().join("missing")));
        assert!(!FileSpec::new("a.txt", 5, 0, None).check_hash(&path));

        // Larger than the read buffer
        let content: Vec<u8> = (0..3000_u32).map(|i| (i % 251) as u8).collect();
        let big_path = write_file(&temp_dir, "big.bin", &content, 0);
        let mut expected = [0_u8; 16];
        expected.copy_from_slice(&Md5::digest(&content));
        assert_eq!(compute_hash(&big_path).unwrap(), expected);
    }

    #[test]
    fn test_from_file() {
        let temp_dir = tempdir().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        let path = temp_dir.path().join("sub").join("a.txt");
        fs::write(&path, b"hello").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_000_000_000, 0)).unwrap();

        let spec = FileSpec::from_file(temp_dir.path(), "sub/a.txt").unwrap();
        assert_eq!(
            spec,
            FileSpec::new("sub/a.txt", 5, HELLO_TIMESTAMP, Some(HELLO_MD5))
        );
        assert_eq!(
            spec.hash_hex().unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert!(FileSpec::from_file(temp_dir.path(), "missing").is_err());
    }

    #[test]
    fn test_load_xml() {
        let element = BytesStart::from_content(
            r#"extract filename="a.txt" size="5" timestamp="1000000000" hash="5D41402ABC4B2A76B9719D911017C592""#,
            7,
        );
        assert_eq!(FileSpec::load_xml(&element).unwrap(), hello_spec());
    }

    #[test]
    fn test_load_xml_defaults() {
        let element = BytesStart::from_content(
            r#"extract filename="dir/b.bin" size="12abc" hash="5d41""#,
            7,
        );
        let spec = FileSpec::load_xml(&element).unwrap();
        assert_eq!(spec.filename, "dir/b.bin");
        assert_eq!(spec.size, 12);
        assert_eq!(spec.timestamp, 0);
        assert_eq!(spec.hash, None);

        let bad_digit = BytesStart::from_content(
            r#"extract filename="c" hash="zd41402abc4b2a76b9719d911017c592""#,
            7,
        );
        assert_eq!(FileSpec::load_xml(&bad_digit).unwrap().hash, None);

        let no_filename = BytesStart::from_content(r#"extract size="5""#, 7);
        assert!(matches!(
            FileSpec::load_xml(&no_filename),
            Err(PackError::ManifestError(_))
        ));
    }

    #[test]
    fn test_store_xml() {
        let mut element = BytesStart::new("extract");
        hello_spec().store_xml(&mut element);
        assert_eq!(FileSpec::load_xml(&element).unwrap(), hello_spec());

        let mut element = BytesStart::new("extract");
        FileSpec::new("b", 1, 2, None).store_xml(&mut element);
        assert!(element.try_get_attribute("hash").unwrap().is_none());
    }

    #[test]
    fn test_decode_hash() {
        assert_eq!(
            decode_hash("5d41402abc4b2a76b9719d911017c592"),
            Some(HELLO_MD5)
        );
        assert_eq!(
            decode_hash("5D41402ABC4B2A76B9719D911017C592"),
            Some(HELLO_MD5)
        );
        // Wrong lengths
        assert_eq!(decode_hash(""), None);
        assert_eq!(decode_hash("5d41402abc4b2a76b9719d911017c5"), None);
        assert_eq!(decode_hash("5d41402abc4b2a76b9719d911017c59200"), None);
        // Illegal digit in first, middle and last position
        assert_eq!(decode_hash("xd41402abc4b2a76b9719d911017c592"), None);
        assert_eq!(decode_hash("5d41402abc4b2a7gb9719d911017c592"), None);
        assert_eq!(decode_hash("5d41402abc4b2a76b9719d911017c59 "), None);
    }

    #[test]
    fn test_hash_hex_round_trip() {
        let digests: [[u8; HASH_SIZE]; 3] = [
            [0; 16],
            [0xFF; 16],
            hex!("000102030405060708090a0b0c0d0e0f"),
        ];
        for digest in digests.iter() {
            let spec = FileSpec::new("f", 0, 0, Some(*digest));
            let encoded = spec.hash_hex().unwrap();
            assert_eq!(encoded, encoded.to_lowercase());
            assert_eq!(decode_hash(&encoded), Some(*digest));
        }
        assert_eq!(FileSpec::new("f", 0, 0, None).hash_hex(), None);
    }

    #[test]
    fn test_parse_unsigned() {
        assert_eq!(parse_unsigned("1000000000"), 1_000_000_000);
        assert_eq!(parse_unsigned("  42"), 42);
        assert_eq!(parse_unsigned("7 bytes"), 7);
        assert_eq!(parse_unsigned(""), 0);
        assert_eq!(parse_unsigned("-5"), 0);
        assert_eq!(parse_unsigned("99999999999999999999999"), u64::MAX);
    }
}
