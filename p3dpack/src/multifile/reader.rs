use std::boxed::Box;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::multifile::{
    has_uncompressed_length, xor_file_name, CURRENT_MAJOR_VERSION, CURRENT_MINOR_VERSION,
    MULTIFILE_HEADER_MAGIC, MULTIFILE_HEADER_SIZE, SUPPORTED_SCALE_FACTOR,
};
use crate::{PackError, Result};
use filetime::FileTime;
use nom::number::complete::{le_u16, le_u32};
use nom::*;

// Largest fixed part of an index record (uncompressed length included)
const INDEX_RECORD_HEAD_MAX_SIZE: usize = 0x18;

/// Decides which subfiles `extract_all` writes to disk.
pub trait SubfileFilter {
    fn is_extractable(&self, filename: &str) -> bool;

    /// Number of subfiles the caller expects to be extracted, used to scale
    /// progress reports. `None` means "whatever the filter selects".
    fn expected_count(&self) -> Option<usize> {
        None
    }
}

impl<F> SubfileFilter for F
where
    F: Fn(&str) -> bool,
{
    fn is_extractable(&self, filename: &str) -> bool {
        self(filename)
    }
}

/// What to do when an extracted subfile's destination already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Truncate and rewrite the existing file
    Overwrite,
    /// Fail the extraction with `PackError::OutputExists`
    Refuse,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub progress_start: f64,
    pub progress_span: f64,
    pub overwrite: OverwritePolicy,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            progress_start: 0.0,
            progress_span: 1.0,
            overwrite: OverwritePolicy::Overwrite,
        }
    }
}

/// Opens the Multifile at `archive_path` and extracts every subfile selected
/// by `filter` into `output_dir`.
///
/// `progress` is called once per extracted subfile with a value going from
/// `options.progress_start` to `options.progress_start + options.progress_span`.
/// Extraction stops at the first failure; files already written are left in
/// place.
pub fn extract_all<F, P>(
    archive_path: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    filter: &F,
    options: &ExtractOptions,
    progress: P,
) -> Result<usize>
where
    F: SubfileFilter + ?Sized,
    P: FnMut(f64),
{
    let mut multifile = MultifileReader::open(archive_path)?;
    multifile.extract_all(output_dir, filter, options, progress)
}

/// Opens the Multifile at `archive_path` and writes the content of the
/// subfile named `filename` into `out`.
pub fn extract_one<W: Write + ?Sized>(
    archive_path: impl AsRef<Path>,
    out: &mut W,
    filename: &str,
) -> Result<()> {
    let mut multifile = MultifileReader::open(archive_path)?;
    multifile.extract_one(out, filename)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultifileHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub scale_factor: u32,
    pub timestamp: u32,
}

/// Index record of a plain (uncompressed, unencrypted) member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subfile {
    pub filename: String,
    pub start: u64,
    pub length: u64,
    pub timestamp: u32,
}

#[derive(Debug)]
pub struct MultifileReader<R: ?Sized> {
    header: MultifileHeader,
    subfiles: Vec<Subfile>,
    obj: Box<R>,
}

impl MultifileReader<File> {
    pub fn open<P: AsRef<Path>>(multifile_path: P) -> Result<Self> {
        let multifile_path = multifile_path.as_ref();
        let file = File::open(multifile_path).map_err(|e| {
            log::debug!("Couldn't open {}", multifile_path.display());
            e
        })?;
        Self::new(file).map_err(|e| {
            log::debug!("Failed to read {}: {}", multifile_path.display(), e);
            e
        })
    }
}

impl<R: Read + Seek> MultifileReader<R> {
    /// Validates the header and parses the whole index, using the underlying
    /// object as the reader for later extractions.
    pub fn new(mut obj: R) -> Result<Self> {
        obj.seek(SeekFrom::Start(0))?;
        let header = read_header(&mut obj)?;
        let subfiles = read_index(&mut obj)?;
        Ok(Self {
            header,
            subfiles,
            obj: Box::new(obj),
        })
    }

    pub fn version(&self) -> (u16, u16) {
        (self.header.version_major, self.header.version_minor)
    }

    /// Archive-wide timestamp. Extraction never uses it.
    pub fn archive_timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn subfile_count(&self) -> usize {
        self.subfiles.len()
    }

    /// Retained subfiles, in index order.
    pub fn subfiles(&self) -> &[Subfile] {
        &self.subfiles
    }

    /// Returns the first subfile named `filename`. Names are not unique in
    /// the format; later duplicates are only reachable through `subfiles`.
    pub fn find_subfile(&self, filename: &str) -> Option<&Subfile> {
        self.subfiles.iter().find(|s| s.filename == filename)
    }

    pub fn read_subfile(&mut self, filename: &str) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.extract_one(&mut content, filename)?;
        Ok(content)
    }

    /// Copies the bytes of `filename` into `out`. Nothing is written when no
    /// subfile matches.
    pub fn extract_one<W: Write + ?Sized>(&mut self, out: &mut W, filename: &str) -> Result<()> {
        let Self { obj, subfiles, .. } = self;
        let subfile = subfiles
            .iter()
            .find(|s| s.filename == filename)
            .ok_or_else(|| {
                log::debug!("Could not extract {}: not found", filename);
                PackError::EntryNotFound(filename.to_string())
            })?;
        copy_subfile(obj.as_mut(), out, subfile)
    }

    /// Extracts the subfiles selected by `filter` under `output_dir`, in index
    /// order, restoring each file's archived modification time. Only the first
    /// subfile of a given name is extracted.
    ///
    /// Returns the number of extracted subfiles.
    pub fn extract_all<F, P>(
        &mut self,
        output_dir: impl AsRef<Path>,
        filter: &F,
        options: &ExtractOptions,
        mut progress: P,
    ) -> Result<usize>
    where
        F: SubfileFilter + ?Sized,
        P: FnMut(f64),
    {
        let output_dir = output_dir.as_ref();
        let Self { obj, subfiles, .. } = self;
        // Same first-match-wins rule as `find_subfile`
        let mut seen_names: HashSet<&str> = HashSet::new();
        let selected: Vec<&Subfile> = subfiles
            .iter()
            .filter(|s| seen_names.insert(s.filename.as_str()))
            .filter(|s| filter.is_extractable(&s.filename))
            .collect();
        let num_expected = filter.expected_count().unwrap_or_else(|| selected.len());
        let mut num_processed: usize = 0;
        for subfile in selected {
            let output_path = member_output_path(output_dir, &subfile.filename)?;
            extract_subfile_to_path(obj.as_mut(), subfile, &output_path, options.overwrite)?;

            num_processed += 1;
            let denominator = num_expected.max(num_processed) as f64;
            let fraction = num_processed as f64 / denominator;
            progress(options.progress_start + fraction * options.progress_span);
        }
        Ok(num_processed)
    }
}

named!(parse_multifile_header<&[u8], MultifileHeader>,
    do_parse!(
        tag!(MULTIFILE_HEADER_MAGIC)
            >> version_major: le_u16
            >> version_minor: le_u16
            >> scale_factor: le_u32
            >> timestamp: le_u32
            >> (MultifileHeader {
                version_major,
                version_minor,
                scale_factor,
                timestamp,
            }
    )
));

named!(parse_next_record_offset<&[u8], u32>, call!(le_u32));

#[derive(Debug)]
struct IndexRecordHead {
    start: u32,
    length: u32,
    flags: u16,
    timestamp: u32,
    name_length: u16,
}

named!(parse_index_record_head<&[u8], IndexRecordHead>,
    do_parse!(
        start: le_u32
            >> length: le_u32
            >> flags: le_u16
            // Only present for compressed/encrypted members, which are skipped
            >> _uncompressed_length: cond!(has_uncompressed_length(flags), le_u32)
            >> timestamp: le_u32
            >> name_length: le_u16
            >> (IndexRecordHead {
                start,
                length,
                flags,
                timestamp,
                name_length,
            }
    )
));

fn read_header<R: Read + Seek>(reader: &mut R) -> Result<MultifileHeader> {
    let mut header_buf = [0_u8; MULTIFILE_HEADER_SIZE];
    let magic_window = read_magic_window(reader)?;
    header_buf[..MULTIFILE_HEADER_MAGIC.len()].copy_from_slice(&magic_window);
    if &magic_window != MULTIFILE_HEADER_MAGIC {
        return Err(PackError::parsing_error("Failed header check"));
    }
    reader
        .read_exact(&mut header_buf[MULTIFILE_HEADER_MAGIC.len()..])
        .map_err(|_| PackError::parsing_error("Unable to read Multifile header"))?;
    let (_, header) = parse_multifile_header(&header_buf)
        .map_err(|_| PackError::parsing_error("Failed header check"))?;

    if header.version_major != CURRENT_MAJOR_VERSION
        || header.version_minor != CURRENT_MINOR_VERSION
    {
        return Err(PackError::UnsupportedVersion {
            major: header.version_major,
            minor: header.version_minor,
        });
    }
    if header.scale_factor != SUPPORTED_SCALE_FACTOR {
        return Err(PackError::UnsupportedScaleFactor(header.scale_factor));
    }
    Ok(header)
}

/// Reads the 6 bytes that should hold the magic.
///
/// A Multifile may start with '#' comment lines so that it can be run as a
/// script on Unix. In that case at least 6 bytes are skipped, then whole lines
/// are discarded until a non-blank line that doesn't start with '#', and the
/// magic is read from its first character.
fn read_magic_window<R: Read>(reader: &mut R) -> Result<[u8; 6]> {
    let mut window = [0_u8; 6];
    reader
        .read_exact(&mut window)
        .map_err(|_| PackError::parsing_error("Unable to read Multifile header"))?;
    if window[0] != b'#' {
        return Ok(window);
    }

    let mut ch = Some(b'#');
    while ch == Some(b'#') {
        // Skip to the end of the line
        while ch.is_some() && ch != Some(b'\n') {
            ch = next_byte(reader)?;
        }
        // Skip to the first non-whitespace character of the next line
        while matches!(ch, Some(c) if c.is_ascii_whitespace() || c == 0x0B) {
            ch = next_byte(reader)?;
        }
    }
    window[0] = ch.ok_or_else(|| PackError::parsing_error("Unable to read Multifile header"))?;
    reader
        .read_exact(&mut window[1..])
        .map_err(|_| PackError::parsing_error("Unable to read Multifile header"))?;
    Ok(window)
}

fn next_byte<R: Read>(reader: &mut R) -> Result<Option<u8>> {
    let mut byte = [0_u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Walks the index chain starting at the reader's current position.
///
/// Records with flags are parsed to stay in sync but aren't retained. Plain
/// records whose name isn't valid UTF-8 are skipped with a warning.
fn read_index<R: Read + Seek>(reader: &mut R) -> Result<Vec<Subfile>> {
    let mut subfiles: Vec<Subfile> = Vec::new();
    let mut retained_names: HashSet<String> = HashSet::new();
    let mut visited_offsets: HashSet<u64> = HashSet::new();
    let mut record_offset = reader.seek(SeekFrom::Current(0))?;
    loop {
        if !visited_offsets.insert(record_offset) {
            return Err(PackError::parsing_error("Multifile index contains a cycle"));
        }
        let mut head_buf = Vec::with_capacity(INDEX_RECORD_HEAD_MAX_SIZE);
        let mut head_chunk = reader.by_ref().take(head_buf.capacity() as u64);
        head_chunk.read_to_end(&mut head_buf)?;
        let (output, next_record_offset) = parse_next_record_offset(&head_buf)
            .map_err(|_| PackError::parsing_error("Error reading Multifile index"))?;
        if next_record_offset == 0 {
            break;
        }

        let (output, head) = parse_index_record_head(output)
            .map_err(|_| PackError::parsing_error("Error reading Multifile index"))?;
        let consumed_bytes = (head_buf.len() - output.len()) as u64;
        reader.seek(SeekFrom::Start(record_offset + consumed_bytes))?;
        let mut name_buf = vec![0_u8; head.name_length as usize];
        reader
            .read_exact(&mut name_buf)
            .map_err(|_| PackError::parsing_error("Error reading Multifile index"))?;
        let name_bytes = xor_file_name(&name_buf);
        log::trace!(
            "Index record @{}: '{}' start={} length={} flags={:#06x}",
            record_offset,
            String::from_utf8_lossy(&name_bytes),
            head.start,
            head.length,
            head.flags
        );

        // Names of discarded records are never decoded
        if head.flags == 0 {
            match String::from_utf8(name_bytes) {
                Ok(filename) => {
                    if !retained_names.insert(filename.clone()) {
                        log::warn!("Duplicate subfile name '{}' in Multifile index", filename);
                    }
                    subfiles.push(Subfile {
                        filename,
                        start: u64::from(head.start),
                        length: u64::from(head.length),
                        timestamp: head.timestamp,
                    });
                }
                Err(_) => log::warn!(
                    "Skipping subfile @{}: name is not valid UTF-8",
                    record_offset
                ),
            }
        }

        record_offset = u64::from(next_record_offset);
        reader.seek(SeekFrom::Start(record_offset))?;
    }
    Ok(subfiles)
}

/// Streams exactly `subfile.length` bytes from the archive into `out`.
///
/// On a short read the bytes already written stay in `out`.
fn copy_subfile<R, W>(reader: &mut R, out: &mut W, subfile: &Subfile) -> Result<()>
where
    R: Read + Seek,
    W: Write + ?Sized,
{
    reader.seek(SeekFrom::Start(subfile.start))?;
    let mut subfile_chunk = reader.by_ref().take(subfile.length);
    let copied = io::copy(&mut subfile_chunk, out)?;
    if copied != subfile.length {
        log::debug!("Unable to extract {}", subfile.filename);
        return Err(PackError::TruncatedSubfile {
            filename: subfile.filename.clone(),
            expected: subfile.length,
            copied,
        });
    }
    Ok(())
}

fn extract_subfile_to_path<R: Read + Seek>(
    reader: &mut R,
    subfile: &Subfile,
    output_path: &Path,
    overwrite: OverwritePolicy,
) -> Result<()> {
    // Create parent directory if needed
    if let Some(parent_dir) = output_path.parent() {
        fs::create_dir_all(parent_dir)
            .map_err(|e| PackError::output_unwritable(parent_dir, e))?;
    }
    let mut open_options = OpenOptions::new();
    match overwrite {
        OverwritePolicy::Overwrite => open_options.write(true).create(true).truncate(true),
        OverwritePolicy::Refuse => open_options.write(true).create_new(true),
    };
    let mut output_file = open_options.open(output_path).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            PackError::OutputExists(output_path.to_path_buf())
        } else {
            PackError::output_unwritable(output_path, e)
        }
    })?;
    copy_subfile(reader, &mut output_file, subfile)?;
    output_file.flush()?;
    drop(output_file);

    // Restore the archived modification time
    let mtime = FileTime::from_unix_time(i64::from(subfile.timestamp), 0);
    if let Err(e) = filetime::set_file_times(output_path, FileTime::now(), mtime) {
        log::warn!(
            "Failed to set the modification time of '{}': {}",
            output_path.display(),
            e
        );
    }
    log::debug!("Extracted '{}'", subfile.filename);
    Ok(())
}

/// Joins a subfile name to the output directory, refusing names that would
/// land outside of it.
fn member_output_path(output_dir: &Path, filename: &str) -> Result<PathBuf> {
    let relative_path = Path::new(filename);
    let is_safe = !filename.is_empty()
        && relative_path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if !is_safe {
        return Err(PackError::UnsafePath(filename.to_string()));
    }
    Ok(output_dir.join(relative_path))
}
