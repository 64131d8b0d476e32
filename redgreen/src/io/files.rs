//! File access abstraction used by actions and the checkpoint engine.
//!
//! Tests substitute an in-memory implementation (see `test_support`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Minimal text file access keyed by caller-supplied paths.
pub trait FileAccess {
    /// Read a file, returning `None` if it does not exist.
    fn read(&self, path: &Path) -> io::Result<Option<String>>;

    /// Write a file verbatim, creating parent directories as needed.
    fn write(&self, path: &Path, contents: &str) -> io::Result<()>;
}

/// Filesystem access resolving relative paths against a project root.
#[derive(Debug, Clone)]
pub struct FsFiles {
    root: PathBuf,
}

impl FsFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl FileAccess for FsFiles {
    fn read(&self, path: &Path) -> io::Result<Option<String>> {
        let full = self.resolve(path);
        match fs::read_to_string(&full) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        debug!(path = %full.display(), bytes = contents.len(), "writing file");
        fs::write(&full, contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = FsFiles::new(temp.path());
        assert_eq!(files.read(Path::new("nope.js")).expect("read"), None);
    }

    #[test]
    fn write_creates_parents_relative_to_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = FsFiles::new(temp.path());
        files
            .write(Path::new("src/deep/sum.js"), "module.exports = 1;\n")
            .expect("write");
        let on_disk = fs::read_to_string(temp.path().join("src/deep/sum.js")).expect("read");
        assert_eq!(on_disk, "module.exports = 1;\n");
        assert_eq!(
            files.read(Path::new("src/deep/sum.js")).expect("read"),
            Some(on_disk)
        );
    }
}
