use std::{
    env,
    path::{Path, PathBuf},
    sync::Mutex,
};

use miette::Diagnostic;
use tempfile::TempDir;
use thiserror::Error;

use crate::errors::{FileOperation, IoError};

#[derive(Debug, Error, Diagnostic)]
pub enum WorkspaceError {
    #[error("I/O error within workspace domain")]
    #[diagnostic(code(kopye_test::workspace::io))]
    Io(#[from] IoError),

    #[error("a workspace is already active at '{active}'")]
    #[diagnostic(
        code(kopye_test::workspace::already_acquired),
        help("Release the active workspace before acquiring another one")
    )]
    AlreadyAcquired { active: PathBuf },
}

/// Path of the workspace the process is currently switched into, if any.
static ACTIVE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// A working directory the process is switched into until released.
///
/// Only one workspace can be active at a time: the working directory is process-wide. Release
/// is idempotent and also happens on drop, so every exit path restores the previous directory.
#[derive(Debug)]
pub struct TemporaryWorkspace {
    path: PathBuf,
    previous_directory: PathBuf,
    _dir: Option<TempDir>,
    released: bool,
}

impl TemporaryWorkspace {
    /// Creates a fresh temporary directory and switches into it.
    pub fn acquire() -> Result<Self, WorkspaceError> {
        let dir = tempfile::tempdir()
            .map_err(|error| IoError::new(FileOperation::Mkdir, env::temp_dir(), error))?;

        let path = dir.path().to_path_buf();

        Self::enter(path, Some(dir))
    }

    /// Switches into `path`, creating it when missing. The directory is left on disk on release.
    pub fn acquire_in(path: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let path = path.as_ref();

        std::fs::create_dir_all(path)
            .map_err(|error| IoError::new(FileOperation::Mkdir, path.to_path_buf(), error))?;

        Self::enter(path.to_path_buf(), None)
    }

    fn enter(path: PathBuf, dir: Option<TempDir>) -> Result<Self, WorkspaceError> {
        // canonical so callers can compare against `env::current_dir`
        let path = path
            .canonicalize()
            .map_err(|error| IoError::new(FileOperation::Read, path.clone(), error))?;

        let mut active = ACTIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(active) = active.as_ref() {
            return Err(WorkspaceError::AlreadyAcquired {
                active: active.clone(),
            });
        }

        let previous_directory = env::current_dir()
            .map_err(|error| IoError::new(FileOperation::Chdir, PathBuf::from("."), error))?;

        env::set_current_dir(&path)
            .map_err(|error| IoError::new(FileOperation::Chdir, path.clone(), error))?;

        log::debug!(
            "entered workspace {} (previous: {})",
            path.display(),
            previous_directory.display()
        );

        *active = Some(path.clone());

        Ok(Self {
            path,
            previous_directory,
            _dir: dir,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn previous_directory(&self) -> &Path {
        &self.previous_directory
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Switches back to the previous directory. Calling it again does nothing.
    pub fn release(&mut self) -> Result<(), WorkspaceError> {
        if self.released {
            return Ok(());
        }

        self.released = true;

        let mut active = ACTIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = None;

        env::set_current_dir(&self.previous_directory).map_err(|error| {
            IoError::new(FileOperation::Chdir, self.previous_directory.clone(), error)
        })?;

        log::debug!("left workspace {}", self.path.display());

        Ok(())
    }
}

impl Drop for TemporaryWorkspace {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            log::warn!("unable to restore working directory: {}", error);
        }
    }
}

/// Whether some workspace currently holds the process working directory.
pub fn is_active() -> bool {
    ACTIVE
        .lock()
        .map(|active| active.is_some())
        .unwrap_or(true)
}
