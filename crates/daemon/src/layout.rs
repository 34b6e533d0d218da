//! Managed directory layout under the work path.

use std::io;
use std::path::{Path, PathBuf};

/// Fixed set of roots the daemon works in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    pub root: PathBuf,
    pub input: PathBuf,
    pub processing: PathBuf,
    pub output: PathBuf,
    pub failed: PathBuf,
    pub temp: PathBuf,
    pub trash: PathBuf,
    pub log: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            input: root.join("Input"),
            processing: root.join("Processing"),
            output: root.join("Output"),
            failed: root.join("Failed"),
            temp: root.join("Temp"),
            trash: root.join("Trash"),
            log: root.join("Log"),
            root,
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join("catalog.db")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.log.join("reports")
    }

    fn dirs(&self) -> [&Path; 8] {
        [
            &self.root,
            &self.input,
            &self.processing,
            &self.output,
            &self.failed,
            &self.temp,
            &self.trash,
            &self.log,
        ]
    }

    /// Create every root that is missing. Safe to call repeatedly.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in self.dirs() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Whether `path` lies inside the work tree.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(temp_dir.path().join("Data"));

        layout.ensure().unwrap();
        layout.ensure().unwrap();

        for dir in layout.dirs() {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
        assert_eq!(layout.catalog_path(), temp_dir.path().join("Data/catalog.db"));
    }

    #[test]
    fn test_contains() {
        let layout = WorkLayout::new("/srv/squeeze");
        assert!(layout.contains(Path::new("/srv/squeeze/Temp/x.mp4")));
        assert!(!layout.contains(Path::new("/srv/media/x.mp4")));
    }
}
