//! Scratch resources removed on drop

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

/// Whether `name` is exactly one normal path component
///
/// Rejects empty names, `.`, `..`, absolute paths and nested paths, so a
/// scratch directory can never resolve to its parent or escape it.
pub fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Benchmark directory emptied of its own files and removed when dropped
///
/// Only regular files directly inside the directory are deleted; nested
/// directories are left alone, in which case the directory itself stays.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `name` under `parent`, creating missing parents
    pub fn create_in(parent: &Path, name: &str) -> io::Result<Self> {
        if !is_single_component(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("scratch directory name must be a single component: {:?}", name),
            ));
        }
        let path = parent.join(name);
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remove_files(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = self.remove_files() {
            debug!(path = %self.path.display(), error = %e, "Scratch file cleanup failed");
        }
        if let Err(e) = fs::remove_dir(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Scratch directory cleanup failed");
        }
    }
}

/// Backing file of a fixed size, removed when dropped
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Create or truncate the file and size it to `len` bytes
    pub fn create(path: impl Into<PathBuf>, len: u64) -> io::Result<Self> {
        let path = path.into();
        let file = fs::File::create(&path)?;
        let guard = Self { path };
        file.set_len(len)?;
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Scratch file cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_dir_removed_with_contents() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("fio-multifile");

        {
            let dir = ScratchDir::create_in(root.path(), "fio-multifile").unwrap();
            fs::write(dir.path().join("readtest.0.0"), b"data").unwrap();
            fs::write(dir.path().join("readtest.1.0"), b"data").unwrap();
            assert!(path.is_dir());
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_file_sized_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("gds_testfile.bin");

        {
            let file = ScratchFile::create(&path, 4096).unwrap();
            assert_eq!(fs::metadata(file.path()).unwrap().len(), 4096);
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_cleanup_tolerates_missing() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("gone");
        let dir = ScratchDir::create_in(root.path(), "gone").unwrap();
        fs::remove_dir(&path).unwrap();
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_dir_removed_on_panic() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("fio-multifile");
        let parent = root.path().to_path_buf();

        let result = std::panic::catch_unwind(move || {
            let _dir = ScratchDir::create_in(&parent, "fio-multifile").unwrap();
            panic!("benchmark aborted");
        });

        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_single_component_names() {
        assert!(is_single_component("fio-multifile"));
        assert!(!is_single_component(""));
        assert!(!is_single_component("."));
        assert!(!is_single_component(".."));
        assert!(!is_single_component("/"));
        assert!(!is_single_component("/tmp/fio"));
        assert!(!is_single_component("a/b"));
        assert!(!is_single_component("../fio"));
    }

    #[test]
    fn test_scratch_dir_rejects_parent_names() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("keep.bin"), b"data").unwrap();

        for name in ["", ".", "..", "/tmp"] {
            let err = ScratchDir::create_in(root.path(), name).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }

        assert!(root.path().join("keep.bin").exists());
    }

    #[test]
    fn test_scratch_dir_keeps_nested_and_sibling_data() {
        let root = tempfile::tempdir().unwrap();
        let sibling = root.path().join("userdata");
        fs::create_dir(&sibling).unwrap();
        fs::write(sibling.join("important.bin"), b"keep").unwrap();

        {
            let dir = ScratchDir::create_in(root.path(), "fio-multifile").unwrap();
            fs::write(dir.path().join("readtest.0.0"), b"data").unwrap();
            fs::create_dir(dir.path().join("nested")).unwrap();
            fs::write(dir.path().join("nested").join("user.txt"), b"keep").unwrap();
        }

        assert!(sibling.join("important.bin").exists());
        let bench = root.path().join("fio-multifile");
        assert!(!bench.join("readtest.0.0").exists());
        assert!(bench.join("nested").join("user.txt").exists());
    }
}
