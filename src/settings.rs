use std::{
    fs,
    path::{Path, PathBuf},
};

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    answers::ResolveOptions,
    environment::EnvironmentOptions,
    errors::{FileOperation, IoError, ParseError},
};

pub const DEFAULT_NAMESPACE: &str = "kopye:test";
pub const DEFAULT_CONFIG_FILE: &str = ".kopye-rc.json";

#[derive(Debug, Error, Diagnostic)]
pub enum SettingsError {
    #[error("I/O error within settings domain")]
    #[diagnostic(code(kopye_test::settings::io))]
    Io(#[from] IoError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),
}

/// Knobs of one run. Every field has a default, so a settings file may set only a few.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Namespace a factory-built generator is registered under.
    pub namespace: String,
    /// Where the generator runs. `None` means a fresh temporary directory.
    pub target_directory: Option<PathBuf>,
    /// Switch the process working directory into the target directory for the run.
    pub change_cwd: bool,
    pub environment: EnvironmentOptions,
    pub resolve: ResolveOptions,
    /// Turn generator panics into run errors instead of unwinding into the caller.
    pub catch_run_errors: bool,
    /// Commit the store to the target directory before the run completes.
    pub commit_on_completion: bool,
    /// JSON document that local config seeding merges into.
    pub config_file: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            target_directory: None,
            change_cwd: false,
            environment: EnvironmentOptions::default(),
            resolve: ResolveOptions::default(),
            catch_run_errors: true,
            commit_on_completion: false,
            config_file: DEFAULT_CONFIG_FILE.to_string(),
        }
    }
}

impl RunSettings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .map_err(|error| IoError::new(FileOperation::Read, path.to_path_buf(), error))?;

        let parsed: RunSettings =
            toml::from_str(&content).map_err(|error| ParseError::toml(path.to_path_buf(), error))?;

        Ok(parsed)
    }
}
