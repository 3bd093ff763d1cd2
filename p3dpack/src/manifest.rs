use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::filespec::{FileSpec, Verification, VerifyMode};
use crate::multifile::SubfileFilter;
use crate::{PackError, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

const PACKAGE_TAG: &str = "package";
const EXTRACT_TAG: &str = "extract";
const UNCOMPRESSED_ARCHIVE_TAG: &str = "uncompressed_archive";

/// Package description listing the files a package installs.
///
/// ```xml
/// <package name="demo" version="1.0">
///   <uncompressed_archive filename="demo.mf" size="48" timestamp="0" hash="..."/>
///   <extract filename="a.txt" size="5" timestamp="1000000000" hash="..."/>
/// </package>
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageManifest {
    pub name: String,
    pub version: Option<String>,
    pub uncompressed_archive: Option<FileSpec>,
    /// Files extracted from the archive on installation
    pub extracts: Vec<FileSpec>,
}

impl PackageManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn open<P: AsRef<Path>>(manifest_path: P) -> Result<Self> {
        let content = fs::read_to_string(manifest_path)?;
        Self::from_xml_str(&content)
    }

    pub fn from_xml_str(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut manifest: Option<PackageManifest> = None;
        let mut depth = 0_usize;
        loop {
            let (element, is_empty) = match reader.read_event() {
                Ok(Event::Start(e)) => (e, false),
                Ok(Event::Empty(e)) => (e, true),
                Ok(Event::End(_)) => {
                    depth = depth.saturating_sub(1);
                    continue;
                }
                Ok(Event::Eof) => break,
                Ok(_) => continue,
                Err(e) => return Err(PackError::manifest_error(e.to_string())),
            };

            if depth == 0 {
                if manifest.is_some() {
                    return Err(PackError::manifest_error("multiple root elements"));
                }
                if element.name().as_ref() != PACKAGE_TAG.as_bytes() {
                    return Err(PackError::manifest_error(format!(
                        "expected a <{}> root element",
                        PACKAGE_TAG
                    )));
                }
                manifest = Some(parse_package_attributes(&element)?);
            } else if depth == 1 {
                // Direct children of <package>
                if let Some(package) = manifest.as_mut() {
                    match element.name().as_ref() {
                        b"extract" => package.extracts.push(FileSpec::load_xml(&element)?),
                        b"uncompressed_archive" => {
                            package.uncompressed_archive = Some(FileSpec::load_xml(&element)?)
                        }
                        other => {
                            log::debug!("Ignoring <{}> element", String::from_utf8_lossy(other))
                        }
                    }
                }
            }
            if !is_empty {
                depth += 1;
            }
        }

        manifest.ok_or_else(|| PackError::manifest_error("no root element found"))
    }

    pub fn to_xml_string(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        write_event(
            &mut writer,
            Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)),
        )?;

        let mut package = BytesStart::new(PACKAGE_TAG);
        package.push_attribute(("name", self.name.as_str()));
        if let Some(version) = &self.version {
            package.push_attribute(("version", version.as_str()));
        }
        write_event(&mut writer, Event::Start(package))?;
        if let Some(archive) = &self.uncompressed_archive {
            let mut element = BytesStart::new(UNCOMPRESSED_ARCHIVE_TAG);
            archive.store_xml(&mut element);
            write_event(&mut writer, Event::Empty(element))?;
        }
        for extract in &self.extracts {
            let mut element = BytesStart::new(EXTRACT_TAG);
            extract.store_xml(&mut element);
            write_event(&mut writer, Event::Empty(element))?;
        }
        write_event(&mut writer, Event::End(BytesEnd::new(PACKAGE_TAG)))?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| PackError::serialization_error(e.to_string()))
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, manifest_path: P) -> Result<()> {
        let content = self.to_xml_string()?;
        fs::write(manifest_path, content)?;
        Ok(())
    }

    pub fn find_extract(&self, filename: &str) -> Option<&FileSpec> {
        self.extracts
            .iter()
            .find(|extract| extract.filename == filename)
    }

    pub fn is_extractable(&self, filename: &str) -> bool {
        self.find_extract(filename).is_some()
    }

    /// Indexes the extracted file names, for use with `extract_all`.
    pub fn extract_filter(&self) -> ExtractFilter<'_> {
        ExtractFilter {
            names: self
                .extracts
                .iter()
                .map(|extract| extract.filename.as_str())
                .collect(),
            expected_count: self.extracts.len(),
        }
    }

    /// Verifies every extracted file under `base_dir`, in manifest order.
    pub fn verify_extracts<P: AsRef<Path>>(
        &self,
        base_dir: P,
        mode: VerifyMode,
    ) -> Vec<(&FileSpec, Verification)> {
        self.extracts
            .iter()
            .map(|extract| (extract, extract.verify(base_dir.as_ref(), mode)))
            .collect()
    }
}

/// Selects the `<extract>` entries of a manifest.
#[derive(Debug, Clone)]
pub struct ExtractFilter<'a> {
    names: HashSet<&'a str>,
    expected_count: usize,
}

impl SubfileFilter for ExtractFilter<'_> {
    fn is_extractable(&self, filename: &str) -> bool {
        self.names.contains(filename)
    }

    fn expected_count(&self) -> Option<usize> {
        Some(self.expected_count)
    }
}

fn parse_package_attributes(element: &BytesStart) -> Result<PackageManifest> {
    let mut manifest = PackageManifest::default();
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|e| PackError::manifest_error(e.to_string()))?;
        let value = attribute
            .unescape_value()
            .map_err(|e| PackError::manifest_error(e.to_string()))?;
        match attribute.key.as_ref() {
            b"name" => manifest.name = value.into_owned(),
            b"version" => manifest.version = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(manifest)
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| PackError::serialization_error(e.to_string()))
}
