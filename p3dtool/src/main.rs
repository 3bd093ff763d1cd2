mod config;

use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::process;

use anyhow::{anyhow, Context, Result};
use config::{retrieve_tool_configuration, ToolConfiguration};
use filetime::FileTime;
use log::LevelFilter;
use p3dpack::multifile::{self, ExtractOptions, MultifileBuilder, MultifileReader, OverwritePolicy};
use p3dpack::{FileSpec, PackageManifest, VerifyMode};
use simple_logger::SimpleLogger;
use structopt::StructOpt;
use walkdir::WalkDir;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const LIB_NAME: &str = "p3dpack";
// First line of self-executing archives
const EXECUTABLE_HEADER_PREFIX: &str = "#! /usr/bin/env panda3d\n";

#[derive(Debug, StructOpt)]
#[structopt(name = PKG_NAME, about = PKG_DESCRIPTION, author = PKG_AUTHORS)]
struct Opt {
    #[structopt(short, long, help = "Enable verbose logging")]
    verbose: bool,
    #[structopt(
        parse(from_os_str),
        short,
        long,
        help = "Path to a configuration file (default: <executable_name>.yml, if present)"
    )]
    config: Option<PathBuf>,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    #[structopt(about = "List the subfiles of a Multifile")]
    List {
        #[structopt(parse(from_os_str), help = "Path to a Multifile")]
        archive: PathBuf,
    },
    #[structopt(about = "Extract subfiles from a Multifile")]
    Extract {
        #[structopt(parse(from_os_str), help = "Path to a Multifile")]
        archive: PathBuf,
        #[structopt(
            parse(from_os_str),
            short,
            long,
            help = "Path to the output directory (default: current working directory)"
        )]
        output_directory: Option<PathBuf>,
        #[structopt(
            parse(from_os_str),
            short,
            long,
            help = "Package manifest selecting the subfiles to extract (default: all subfiles)"
        )]
        manifest: Option<PathBuf>,
        #[structopt(long, help = "Fail instead of replacing existing files")]
        no_overwrite: bool,
    },
    #[structopt(about = "Write the content of a single subfile")]
    Cat {
        #[structopt(parse(from_os_str), help = "Path to a Multifile")]
        archive: PathBuf,
        #[structopt(help = "Name of the subfile")]
        subfile: String,
        #[structopt(
            parse(from_os_str),
            short,
            long,
            help = "Path to the output file (default: standard output)"
        )]
        output_file: Option<PathBuf>,
    },
    #[structopt(about = "Verify the files described by a package manifest")]
    Verify {
        #[structopt(parse(from_os_str), help = "Path to a package manifest")]
        manifest: PathBuf,
        #[structopt(
            parse(from_os_str),
            short,
            long,
            help = "Directory containing the package's files (default: current working directory)"
        )]
        directory: Option<PathBuf>,
        #[structopt(long, help = "Hash every file, even when timestamps match")]
        full: bool,
    },
    #[structopt(about = "Build a Multifile from a directory")]
    Pack {
        #[structopt(parse(from_os_str), help = "Directory to archive")]
        source_directory: PathBuf,
        #[structopt(parse(from_os_str), short, long, help = "Path to the output archive")]
        output_file: PathBuf,
        #[structopt(
            parse(from_os_str),
            short,
            long,
            help = "Also write a package manifest describing the archive and its content"
        )]
        manifest: Option<PathBuf>,
        #[structopt(long, help = "Prefix the archive with a '#!' line")]
        executable: bool,
    },
}

fn run(cli_args: Opt) -> Result<()> {
    let config = retrieve_tool_configuration(cli_args.config.as_deref())
        .context("Failed to retrieve the configuration")?;

    match cli_args.command {
        Command::List { archive } => list_subfiles(&archive),
        Command::Extract {
            archive,
            output_directory,
            manifest,
            no_overwrite,
        } => {
            let output_directory = output_directory.unwrap_or_else(|| PathBuf::from("."));
            extract_subfiles(
                &config,
                &archive,
                &output_directory,
                manifest.as_deref(),
                no_overwrite,
            )
        }
        Command::Cat {
            archive,
            subfile,
            output_file,
        } => cat_subfile(&archive, &subfile, output_file.as_deref()),
        Command::Verify {
            manifest,
            directory,
            full,
        } => {
            let directory = directory.unwrap_or_else(|| PathBuf::from("."));
            let mode = if full || config.verification.full {
                VerifyMode::Full
            } else {
                VerifyMode::Quick
            };
            verify_package(&manifest, &directory, mode)
        }
        Command::Pack {
            source_directory,
            output_file,
            manifest,
            executable,
        } => pack_directory(
            &source_directory,
            &output_file,
            manifest.as_deref(),
            executable,
        ),
    }
}

fn list_subfiles(archive_path: &Path) -> Result<()> {
    let multifile = MultifileReader::open(archive_path)
        .with_context(|| format!("Failed to open '{}'", archive_path.to_string_lossy()))?;
    let (major, minor) = multifile.version();
    log::info!(
        "Multifile v{}.{}, {} subfile(s)",
        major,
        minor,
        multifile.subfile_count()
    );
    for subfile in multifile.subfiles() {
        println!(
            "{}\t{}\t{}",
            subfile.length, subfile.timestamp, subfile.filename
        );
    }
    Ok(())
}

fn extract_subfiles(
    config: &ToolConfiguration,
    archive_path: &Path,
    output_directory: &Path,
    manifest_path: Option<&Path>,
    no_overwrite: bool,
) -> Result<()> {
    let options = ExtractOptions {
        overwrite: if no_overwrite || !config.extraction.overwrite {
            OverwritePolicy::Refuse
        } else {
            OverwritePolicy::Overwrite
        },
        ..ExtractOptions::default()
    };
    let report_progress = |progress: f64| log::debug!("{:.0}%", progress * 100.0);

    log::info!("Extracting '{}'", archive_path.to_string_lossy());
    let manifest = match manifest_path {
        Some(manifest_path) => Some(
            PackageManifest::open(manifest_path)
                .with_context(|| format!("Failed to load '{}'", manifest_path.to_string_lossy()))?,
        ),
        None => None,
    };
    let extracted_count = match &manifest {
        Some(manifest) => multifile::extract_all(
            archive_path,
            output_directory,
            &manifest.extract_filter(),
            &options,
            report_progress,
        ),
        None => multifile::extract_all(
            archive_path,
            output_directory,
            &|_: &str| true,
            &options,
            report_progress,
        ),
    }
    .context("Extraction failed")?;
    log::info!(
        "Extracted {} file(s) into '{}'",
        extracted_count,
        output_directory.to_string_lossy()
    );

    match manifest {
        Some(manifest) => {
            let mode = if config.verification.full {
                VerifyMode::Full
            } else {
                VerifyMode::Quick
            };
            check_extracts(&manifest, output_directory, mode)
        }
        None => Ok(()),
    }
}

fn cat_subfile(archive_path: &Path, subfile: &str, output_path: Option<&Path>) -> Result<()> {
    match output_path {
        Some(output_path) => {
            let mut output_file = File::create(output_path).with_context(|| {
                format!("Failed to create '{}'", output_path.to_string_lossy())
            })?;
            multifile::extract_one(archive_path, &mut output_file, subfile)?;
            output_file.flush()?;
        }
        None => {
            let stdout = io::stdout();
            let mut stdout = stdout.lock();
            multifile::extract_one(archive_path, &mut stdout, subfile)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn verify_package(manifest_path: &Path, directory: &Path, mode: VerifyMode) -> Result<()> {
    let manifest = PackageManifest::open(manifest_path)
        .with_context(|| format!("Failed to load '{}'", manifest_path.to_string_lossy()))?;
    log::info!(
        "Verifying package '{}' ({} file(s))",
        manifest.name,
        manifest.extracts.len()
    );
    check_extracts(&manifest, directory, mode)
}

fn check_extracts(manifest: &PackageManifest, directory: &Path, mode: VerifyMode) -> Result<()> {
    let mut failure_count: usize = 0;
    for (spec, verification) in manifest.verify_extracts(directory, mode) {
        if verification.is_valid() {
            log::debug!("'{}': {:?}", spec.filename, verification);
        } else {
            log::error!("'{}': {:?}", spec.filename, verification);
            failure_count += 1;
        }
    }
    if failure_count > 0 {
        return Err(anyhow!("{} file(s) failed verification", failure_count));
    }
    log::info!("All files are valid");
    Ok(())
}

fn pack_directory(
    source_directory: &Path,
    output_path: &Path,
    manifest_path: Option<&Path>,
    executable: bool,
) -> Result<()> {
    let header_prefix = if executable {
        EXECUTABLE_HEADER_PREFIX
    } else {
        ""
    };
    let archive_timestamp = u32::try_from(FileTime::now().unix_seconds())?;
    let output_file = File::create(output_path)
        .with_context(|| format!("Failed to create '{}'", output_path.to_string_lossy()))?;
    let mut archive_builder =
        MultifileBuilder::with_header_prefix(output_file, header_prefix, archive_timestamp)?;
    let mut manifest = PackageManifest::new(
        output_path
            .file_stem()
            .ok_or_else(|| anyhow!("Invalid output file name"))?
            .to_string_lossy(),
    );

    let walker = WalkDir::new(source_directory)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = entry.path().strip_prefix(source_directory)?;
        let subfile_name = subfile_name_from_path(rel_path)?;
        log::trace!("'{}' will be ADDED", subfile_name);
        archive_builder.append_file(&subfile_name, entry.path())?;
        if manifest_path.is_some() {
            manifest
                .extracts
                .push(FileSpec::from_file(source_directory, &subfile_name)?);
        }
    }
    let subfile_count = archive_builder.subfile_count();
    archive_builder.finish()?;
    drop(archive_builder);
    log::info!(
        "Archive with {} subfile(s) generated at '{}'",
        subfile_count,
        output_path.to_string_lossy()
    );

    if let Some(manifest_path) = manifest_path {
        let archive_name = output_path
            .file_name()
            .ok_or_else(|| anyhow!("Invalid output file name"))?
            .to_string_lossy();
        let archive_directory = output_path.parent().unwrap_or_else(|| Path::new(""));
        manifest.uncompressed_archive = Some(FileSpec::from_file(
            archive_directory,
            &archive_name,
        )?);
        manifest
            .write_to_file(manifest_path)
            .context("Failed to write the package manifest")?;
        log::info!(
            "Package manifest generated at '{}'",
            manifest_path.to_string_lossy()
        );
    }
    Ok(())
}

/// Converts a path relative to the packed directory into a '/'-separated
/// subfile name.
fn subfile_name_from_path(rel_path: &Path) -> Result<String> {
    let mut components = Vec::new();
    for component in rel_path.components() {
        match component {
            Component::Normal(name) => components.push(
                name.to_str()
                    .ok_or_else(|| anyhow!("'{}' is not valid UTF-8", rel_path.to_string_lossy()))?,
            ),
            _ => {
                return Err(anyhow!(
                    "Unexpected path component in '{}'",
                    rel_path.to_string_lossy()
                ))
            }
        }
    }
    Ok(components.join("/"))
}

fn main() {
    const SUCCESS_EXIT_CODE: i32 = 0;
    const FAILURE_EXIT_CODE: i32 = 1;

    // Parse CLI arguments
    let cli_args = Opt::from_args();
    // Initialize the logger
    if let Err(err) = init_logger(cli_args.verbose) {
        eprintln!("Failed to initialize the logger: {}", err);
        process::exit(FAILURE_EXIT_CODE);
    }

    // Run the actual program
    let result = run(cli_args);
    match result {
        Ok(()) => {
            process::exit(SUCCESS_EXIT_CODE);
        }
        Err(err) => {
            log::error!("{:#}", err);
            process::exit(FAILURE_EXIT_CODE);
        }
    }
}

fn init_logger(verbose: bool) -> Result<()> {
    let level_filter = if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };

    SimpleLogger::new()
        .with_level(LevelFilter::Off)
        .with_module_level(PKG_NAME, level_filter)
        .with_module_level(LIB_NAME, level_filter)
        .init()?;
    Ok(())
}
