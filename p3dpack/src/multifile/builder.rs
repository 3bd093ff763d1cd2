use std::boxed::Box;
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::multifile::{
    xor_file_name, CURRENT_MAJOR_VERSION, CURRENT_MINOR_VERSION, INDEX_RECORD_FIXED_SIZE,
    MULTIFILE_HEADER_MAGIC, SUPPORTED_SCALE_FACTOR,
};
use crate::{PackError, Result};
use filetime::FileTime;
use serde::Serialize;

// Offset of the length field inside an index record
const RECORD_LENGTH_FIELD_OFFSET: u64 = 0x8;

/// Writes Multifile archives containing plain subfiles.
///
/// Each index record is immediately followed by the subfile's data. Lengths
/// and next-record offsets are patched once the data has been streamed.
pub struct MultifileBuilder<W: Write + Seek> {
    obj: Box<W>,
    last_record_offset: Option<u64>,
    subfile_count: usize,
    finished: bool,
}

#[derive(Debug, Serialize)]
struct SerializableMultifileHeader {
    magic: [u8; 6],
    version_major: u16,
    version_minor: u16,
    scale_factor: u32,
    timestamp: u32,
}

#[derive(Debug, Serialize)]
struct SerializableIndexRecord {
    next_record_offset: u32,
    start: u32,
    length: u32,
    flags: u16,
    timestamp: u32,
    name_length: u16,
    // name_length bytes of XORed name follow, see `xor_file_name`
}

impl<W: Write + Seek> MultifileBuilder<W> {
    pub fn new(obj: W, timestamp: u32) -> Result<Self> {
        Self::with_header_prefix(obj, "", timestamp)
    }

    /// Creates an archive preceded by `prefix`, a block of '#' comment lines
    /// (typically a `#!` line) that lets the archive run as a script.
    ///
    /// The first line must be at least 6 characters long, newline included:
    /// readers always consume 6 bytes before looking for the end of the line.
    pub fn with_header_prefix(mut obj: W, prefix: &str, timestamp: u32) -> Result<Self> {
        validate_header_prefix(prefix)?;
        obj.write_all(prefix.as_bytes())?;
        let header = SerializableMultifileHeader {
            magic: *MULTIFILE_HEADER_MAGIC,
            version_major: CURRENT_MAJOR_VERSION,
            version_minor: CURRENT_MINOR_VERSION,
            scale_factor: SUPPORTED_SCALE_FACTOR,
            timestamp,
        };
        bincode::serialize_into(obj.by_ref(), &header)?;
        Ok(Self {
            obj: Box::new(obj),
            last_record_offset: None,
            subfile_count: 0,
            finished: false,
        })
    }

    pub fn subfile_count(&self) -> usize {
        self.subfile_count
    }

    pub fn append_subfile<R>(&mut self, filename: &str, mut data: R, timestamp: u32) -> Result<()>
    where
        R: Read,
    {
        if self.finished {
            return Err(PackError::serialization_error("Archive is already finished"));
        }
        let name = xor_file_name(filename.as_bytes());
        let record_offset = self.obj.seek(SeekFrom::Current(0))?;
        let data_offset = record_offset + (INDEX_RECORD_FIXED_SIZE + name.len()) as u64;
        let record = SerializableIndexRecord {
            next_record_offset: 0, // Patched by the next record or by `finish`
            start: u32::try_from(data_offset)?,
            length: 0, // Patched once the data has been copied
            flags: 0,
            timestamp,
            name_length: u16::try_from(name.len())?,
        };
        bincode::serialize_into(self.obj.by_ref(), &record)?;
        self.obj.write_all(&name)?;
        let data_size = io::copy(&mut data, self.obj.by_ref())?;
        let end_offset = self.obj.seek(SeekFrom::Current(0))?;

        self.patch_u32(
            record_offset + RECORD_LENGTH_FIELD_OFFSET,
            u32::try_from(data_size)?,
        )?;
        self.link_previous_record(record_offset)?;
        self.obj.seek(SeekFrom::Start(end_offset))?;
        self.last_record_offset = Some(record_offset);
        self.subfile_count += 1;
        log::trace!("Appended '{}' ({} bytes)", filename, data_size);
        Ok(())
    }

    /// Appends a file from disk, archiving its modification time.
    pub fn append_file<P: AsRef<Path>>(&mut self, filename: &str, file_path: P) -> Result<()> {
        let metadata = fs::metadata(file_path.as_ref())?;
        let mtime = FileTime::from_last_modification_time(&metadata).unix_seconds();
        let timestamp = u32::try_from(mtime.max(0))?;
        let file = File::open(file_path)?;
        self.append_subfile(filename, file, timestamp)
    }

    /// Terminates the index chain. Called automatically on drop.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let terminator_offset = self.obj.seek(SeekFrom::Current(0))?;
        bincode::serialize_into(self.obj.by_ref(), &0_u32)?;
        self.link_previous_record(terminator_offset)?;
        self.obj.seek(SeekFrom::End(0))?;
        self.obj.flush()?;
        Ok(())
    }

    /// Points the previous record (if any) to `offset`.
    fn link_previous_record(&mut self, offset: u64) -> Result<()> {
        if let Some(previous_offset) = self.last_record_offset {
            self.patch_u32(previous_offset, u32::try_from(offset)?)?;
        }
        Ok(())
    }

    fn patch_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.obj.seek(SeekFrom::Start(offset))?;
        bincode::serialize_into(self.obj.by_ref(), &value)?;
        Ok(())
    }
}

impl<W: Write + Seek> Drop for MultifileBuilder<W> {
    // Automatically call finish on destruction
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

fn validate_header_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Ok(());
    }
    if !prefix.ends_with('\n') {
        return Err(PackError::serialization_error(
            "Header prefix must end with a newline",
        ));
    }
    if prefix.lines().any(|line| !line.starts_with('#')) {
        return Err(PackError::serialization_error(
            "Header prefix lines must start with '#'",
        ));
    }
    match prefix.find('\n') {
        Some(first_newline) if first_newline >= MULTIFILE_HEADER_MAGIC.len() => Ok(()),
        _ => Err(PackError::serialization_error(
            "First header prefix line is too short",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multifile::{MultifileReader, Subfile};
    use std::collections::HashMap;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_empty() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut builder = MultifileBuilder::new(&mut cursor, 1234).unwrap();
            builder.finish().unwrap();
        }
        // Header followed by a zero next-record offset
        assert_eq!(cursor.get_ref().len(), 18 + 4);
        let multifile = MultifileReader::new(cursor).unwrap();
        assert_eq!(multifile.subfile_count(), 0);
        assert_eq!(multifile.version(), (1, 1));
        assert_eq!(multifile.archive_timestamp(), 1234);
    }

    #[test]
    fn test_layout() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut builder = MultifileBuilder::new(&mut cursor, 0).unwrap();
            builder
                .append_subfile("a.txt", &b"hello"[..], 1_000_000_000)
                .unwrap();
        }
        let bytes = cursor.into_inner();
        let mut expected = b"pmf\0\n\r".to_vec();
        expected.extend_from_slice(&[1, 0, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
        expected.extend_from_slice(&48_u32.to_le_bytes()); // next record
        expected.extend_from_slice(&43_u32.to_le_bytes()); // start
        expected.extend_from_slice(&5_u32.to_le_bytes()); // length
        expected.extend_from_slice(&0_u16.to_le_bytes()); // flags
        expected.extend_from_slice(&1_000_000_000_u32.to_le_bytes());
        expected.extend_from_slice(&5_u16.to_le_bytes());
        expected.extend_from_slice(&[0x9E, 0xD1, 0x8B, 0x87, 0x8B]);
        expected.extend_from_slice(b"hello");
        expected.extend_from_slice(&0_u32.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_append_subfiles() {
        let expected_content: HashMap<&str, Vec<u8>> = [
            ("data/test1", vec![1, 2, 3]),
            ("data/test2", vec![5, 6]),
            ("empty", vec![]),
            ("big.bin", (0..5000_u32).map(|x| x as u8).collect()),
        ]
        .iter()
        .cloned()
        .collect();
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut builder = MultifileBuilder::new(&mut cursor, 0).unwrap();
            for (name, content) in &expected_content {
                builder
                    .append_subfile(name, content.as_slice(), 42)
                    .unwrap();
            }
            assert_eq!(builder.subfile_count(), expected_content.len());
        }
        let mut multifile = MultifileReader::new(cursor).unwrap();
        assert_eq!(multifile.subfile_count(), expected_content.len());
        let subfiles: Vec<Subfile> = multifile.subfiles().to_vec();
        for subfile in subfiles {
            assert_eq!(subfile.timestamp, 42);
            let expected = &expected_content[subfile.filename.as_str()];
            assert_eq!(subfile.length, expected.len() as u64);
            assert_eq!(&multifile.read_subfile(&subfile.filename).unwrap(), expected);
        }
    }

    #[test]
    fn test_header_prefix() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut builder = MultifileBuilder::with_header_prefix(
                &mut cursor,
                "#! /usr/bin/env panda3d\n# packed for testing\n",
                0,
            )
            .unwrap();
            builder
                .append_subfile("main.py", &b"print('hi')"[..], 7)
                .unwrap();
        }
        assert!(cursor.get_ref().starts_with(b"#! /usr/bin/env panda3d\n"));
        let mut multifile = MultifileReader::new(cursor).unwrap();
        assert_eq!(multifile.read_subfile("main.py").unwrap(), b"print('hi')");
    }

    #[test]
    fn test_invalid_header_prefix() {
        for prefix in ["#!/sh\n", "#! /usr/bin/env panda3d", "not a comment\n"].iter() {
            let mut cursor = Cursor::new(Vec::new());
            assert!(matches!(
                MultifileBuilder::with_header_prefix(&mut cursor, prefix, 0),
                Err(PackError::SerializationError(_))
            ));
        }
    }

    #[test]
    fn test_append_file() {
        let temp_dir = tempdir().unwrap();
        let source_path = temp_dir.path().join("source.txt");
        fs::write(&source_path, b"on disk").unwrap();
        filetime::set_file_mtime(&source_path, FileTime::from_unix_time(1_234_567_890, 0))
            .unwrap();

        let archive_path = temp_dir.path().join("archive.mf");
        {
            let mut builder =
                MultifileBuilder::new(File::create(&archive_path).unwrap(), 0).unwrap();
            builder.append_file("dir/source.txt", &source_path).unwrap();
        }
        let mut multifile = MultifileReader::open(&archive_path).unwrap();
        let subfile = multifile.find_subfile("dir/source.txt").unwrap().clone();
        assert_eq!(subfile.timestamp, 1_234_567_890);
        assert_eq!(multifile.read_subfile("dir/source.txt").unwrap(), b"on disk");
    }

    #[test]
    fn test_append_after_finish() {
        let mut cursor = Cursor::new(Vec::new());
        let mut builder = MultifileBuilder::new(&mut cursor, 0).unwrap();
        builder.finish().unwrap();
        assert!(builder.append_subfile("late", &b""[..], 0).is_err());
    }
}
