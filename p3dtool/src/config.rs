use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ToolConfiguration {
    pub extraction: ExtractionConfiguration,
    pub verification: VerificationConfiguration,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExtractionConfiguration {
    pub overwrite: bool, // Replace files that already exist in the output directory
}

impl Default for ExtractionConfiguration {
    fn default() -> Self {
        Self { overwrite: true }
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct VerificationConfiguration {
    pub full: bool, // Always hash files, even when their timestamps match
}

/// Loads the configuration from `config_path` if given, otherwise from
/// `<tool name>.yml` in the working directory if that file exists.
pub fn retrieve_tool_configuration(config_path: Option<&Path>) -> Result<ToolConfiguration> {
    if let Some(config_path) = config_path {
        return parse_configuration(config_path);
    }
    let default_config_path = PathBuf::from(get_tool_name()?).with_extension("yml");
    if default_config_path.is_file() {
        parse_configuration(default_config_path)
    } else {
        Ok(ToolConfiguration::default())
    }
}

fn get_tool_name() -> Result<OsString> {
    let current_exe_path = env::current_exe()?;
    Ok(current_exe_path
        .file_stem()
        .context("Current executable path is invalid")?
        .to_os_string())
}

fn parse_configuration<P: AsRef<Path>>(config_file_path: P) -> Result<ToolConfiguration> {
    let config_file = File::open(config_file_path.as_ref()).with_context(|| {
        format!(
            "Failed to open '{}'",
            config_file_path.as_ref().to_string_lossy()
        )
    })?;
    let config_reader = BufReader::new(config_file);
    Ok(serde_yaml::from_reader(config_reader).context("Invalid configuration")?)
}
