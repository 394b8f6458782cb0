use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// The file-system step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Diagnostic)]
pub enum FileOperation {
    #[error("read")]
    Read,
    #[error("write")]
    Write,
    #[error("create directory")]
    Mkdir,
    #[error("remove")]
    Remove,
    #[error("change working directory")]
    Chdir,
}

#[derive(Debug, Error, Diagnostic)]
#[error("unable to {operation} '{path}'")]
#[diagnostic(
    code(kopye_test::io),
    help("Check that the path exists and the test process may write to it")
)]
pub struct IoError {
    pub operation: FileOperation,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}
impl IoError {
    pub fn new(operation: FileOperation, path: PathBuf, source: std::io::Error) -> Self {
        Self {
            operation,
            path,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Diagnostic)]
pub enum FileFormat {
    #[error("TOML")]
    Toml,
    #[error("JSON")]
    Json,
}

#[derive(Debug, Error)]
pub enum ParseSource {
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A fixture, settings file or stored JSON document that does not parse.
#[derive(Debug, Error, Diagnostic)]
#[error("invalid {file_format} in '{path}'")]
#[diagnostic(
    code(kopye_test::parse),
    help("Fix the file contents; stored JSON documents must be objects to merge into")
)]
pub struct ParseError {
    pub file_format: FileFormat,
    pub path: PathBuf,
    #[source]
    pub source: ParseSource,
}
impl ParseError {
    pub fn toml(path: PathBuf, error: toml::de::Error) -> Self {
        Self {
            file_format: FileFormat::Toml,
            path,
            source: error.into(),
        }
    }

    pub fn json(path: PathBuf, error: serde_json::Error) -> Self {
        Self {
            file_format: FileFormat::Json,
            path,
            source: error.into(),
        }
    }
}
