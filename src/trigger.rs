//! Cross-run memory of "a device arrived before anyone logged in".

use std::{fs, io, path::PathBuf};

/// A single boolean fact that outlives the process that set it.
pub trait FlagStore {
    fn is_set(&self) -> bool;
    fn set(&self) -> io::Result<()>;
    /// Clearing an absent flag succeeds.
    fn clear(&self) -> io::Result<()>;
}

/// Flag kept as the existence of a file. Content is never read.
#[derive(Clone, Debug)]
pub struct FileFlag {
    path: PathBuf,
}

impl FileFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FlagStore for FileFlag {
    fn is_set(&self) -> bool {
        self.path.exists()
    }

    fn set(&self) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, b"")
    }

    fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
