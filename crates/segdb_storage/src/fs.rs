//! File-system directory for persistent storage.

use crate::directory::{Directory, FileLock};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Suffix for temporary files used by atomic writes.
const TEMP_SUFFIX: &str = ".tmp";

/// A directory backed by an OS directory.
///
/// Every logical file is a regular file directly under the root path.
///
/// # Durability
///
/// `write_file` follows write-then-rename:
/// 1. Write to `<name>.tmp`
/// 2. Sync the temporary file
/// 3. Rename it over `<name>`
/// 4. Fsync the directory so the rename itself is durable
///
/// # Example
///
/// ```no_run
/// use segdb_storage::{Directory, FsDirectory};
/// use std::path::Path;
///
/// let dir = FsDirectory::open(Path::new("my_index")).unwrap();
/// dir.write_file("index.map", b"persistent data").unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Opens a directory, creating it (and its parents) if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the path exists but is not a directory, or if it
    /// cannot be created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("path is not a directory: {}", path.display()),
            )));
        }

        Ok(Self {
            root: path.to_path_buf(),
        })
    }

    /// Returns the root path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Syncs the directory so renames and deletions are durable.
    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        let dir = File::open(&self.root)?;
        dir.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced
        Ok(())
    }
}

fn not_found_as(name: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        StorageError::Io(err)
    }
}

impl Directory for FsDirectory {
    fn read_file(&self, name: &str) -> StorageResult<Vec<u8>> {
        fs::read(self.file_path(name)).map_err(|e| not_found_as(name, e))
    }

    fn write_file(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let target = self.file_path(name);
        let temp = self.file_path(&format!("{name}{TEMP_SUFFIX}"));

        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &target)?;
        self.sync_directory()
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    fn rename_file(&self, from: &str, to: &str) -> StorageResult<()> {
        fs::rename(self.file_path(from), self.file_path(to)).map_err(|e| not_found_as(from, e))?;
        self.sync_directory()
    }

    fn delete_file(&self, name: &str) -> StorageResult<bool> {
        match fs::remove_file(self.file_path(name)) {
            Ok(()) => {
                self.sync_directory()?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_files(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(TEMP_SUFFIX) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn get_lock(&self, name: &str) -> StorageResult<Box<dyn FileLock>> {
        Ok(Box::new(FsFileLock {
            name: name.to_string(),
            path: self.file_path(name),
            file: None,
        }))
    }
}

/// Advisory lock implemented with `flock`/`LockFileEx` through `fs2`.
#[derive(Debug)]
struct FsFileLock {
    name: String,
    path: PathBuf,
    /// Open handle while locked; closing it releases the OS lock.
    file: Option<File>,
}

impl FileLock for FsFileLock {
    fn lock(&mut self) -> StorageResult<()> {
        if self.file.is_some() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(self.name.clone()));
        }

        // Record the holder for operators inspecting a stale lock
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        self.file = Some(file);
        Ok(())
    }

    fn unlock(&mut self) -> StorageResult<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        // Remove first so nobody mistakes a cleanly released lock for a stale one
        let removed = fs::remove_file(&self.path);
        FileExt::unlock(&file)?;
        drop(file);

        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_locked(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for FsFileLock {
    fn drop(&mut self) {
        // Closing the handle releases the OS lock; the file stays behind on purpose
        self.file.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("index");

        let dir = FsDirectory::open(&path).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.path(), path);
    }

    #[test]
    fn write_and_read() {
        let temp = tempdir().unwrap();
        let dir = FsDirectory::open(temp.path()).unwrap();

        dir.write_file("a.bin", b"hello").unwrap();
        assert!(dir.file_exists("a.bin"));
        assert_eq!(dir.read_file("a.bin").unwrap(), b"hello");

        dir.write_file("a.bin", b"replaced").unwrap();
        assert_eq!(dir.read_file("a.bin").unwrap(), b"replaced");
    }

    #[test]
    fn read_missing_is_not_found() {
        let temp = tempdir().unwrap();
        let dir = FsDirectory::open(temp.path()).unwrap();

        let result = dir.read_file("missing");
        assert!(matches!(result, Err(StorageError::NotFound(name)) if name == "missing"));
    }

    #[test]
    fn list_skips_temporary_files() {
        let temp = tempdir().unwrap();
        let dir = FsDirectory::open(temp.path()).unwrap();

        dir.write_file("b", b"2").unwrap();
        dir.write_file("a", b"1").unwrap();
        fs::write(temp.path().join("c.tmp"), b"partial").unwrap();

        assert_eq!(dir.list_files().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn rename_and_delete() {
        let temp = tempdir().unwrap();
        let dir = FsDirectory::open(temp.path()).unwrap();

        dir.write_file("old", b"x").unwrap();
        dir.rename_file("old", "new").unwrap();
        assert!(!dir.file_exists("old"));
        assert!(dir.file_exists("new"));

        assert!(dir.delete_file("new").unwrap());
        assert!(!dir.delete_file("new").unwrap());
        assert!(matches!(
            dir.rename_file("new", "other"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn lock_prevents_second_holder() {
        let temp = tempdir().unwrap();
        let dir = FsDirectory::open(temp.path()).unwrap();

        let mut first = dir.get_lock(".lock").unwrap();
        first.lock().unwrap();
        assert!(first.is_locked());

        let mut second = dir.get_lock(".lock").unwrap();
        assert!(matches!(second.lock(), Err(StorageError::Locked(_))));
        assert!(!second.is_locked());
    }

    #[test]
    fn unlock_removes_lock_file() {
        let temp = tempdir().unwrap();
        let dir = FsDirectory::open(temp.path()).unwrap();

        let mut lock = dir.get_lock(".lock").unwrap();
        lock.lock().unwrap();
        assert!(dir.file_exists(".lock"));

        lock.unlock().unwrap();
        assert!(!lock.is_locked());
        assert!(!dir.file_exists(".lock"));
    }

    #[test]
    fn dropped_lock_leaves_stale_file() {
        let temp = tempdir().unwrap();
        let dir = FsDirectory::open(temp.path()).unwrap();

        {
            let mut lock = dir.get_lock(".lock").unwrap();
            lock.lock().unwrap();
        }

        assert!(dir.file_exists(".lock"));
        let mut again = dir.get_lock(".lock").unwrap();
        again.lock().unwrap();
        assert!(again.is_locked());
    }
}
