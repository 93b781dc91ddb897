use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// PID file held by a running supervisor and read by the controller.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the current process id.
    pub fn write_current(&self) -> Result<()> {
        self.write(std::process::id())
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, format!("{pid}\n"))
            .with_context(|| format!("failed to write PID file {}", self.path.display()))
    }

    /// The recorded PID, `None` when the file is missing or unparsable.
    pub fn read(&self) -> Result<Option<i32>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let pid = raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0);
                if pid.is_none() {
                    tracing::warn!(path = %self.path.display(), "ignoring malformed PID file");
                }
                Ok(pid)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read PID file {}", self.path.display())),
        }
    }

    /// Removes the file; a missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove PID file {}", self.path.display())),
        }
    }
}
