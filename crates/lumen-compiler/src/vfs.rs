//! Filesystems that modules and buffers are read from and saved to.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The filesystem seen by the resolver and the save/load primitives.
///
/// Module loads are asynchronous; saving, loading and listing buffers are
/// synchronous calls. A missing file is reported as
/// [`io::ErrorKind::NotFound`].
#[allow(async_fn_in_trait)]
pub trait FileSystem {
    async fn read_file(&self, path: &Path) -> io::Result<String>;

    fn read_file_sync(&self, path: &Path) -> io::Result<String>;

    fn write_file_sync(&self, path: &Path, contents: &str) -> io::Result<()>;

    /// Entries directly inside `dir`, files and directories alike.
    fn read_dir_sync(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
}

impl<F: FileSystem + ?Sized> FileSystem for &F {
    async fn read_file(&self, path: &Path) -> io::Result<String> {
        (**self).read_file(path).await
    }

    fn read_file_sync(&self, path: &Path) -> io::Result<String> {
        (**self).read_file_sync(path)
    }

    fn write_file_sync(&self, path: &Path, contents: &str) -> io::Result<()> {
        (**self).write_file_sync(path, contents)
    }

    fn read_dir_sync(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        (**self).read_dir_sync(dir)
    }
}

/// An in-memory filesystem. Clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    files: Arc<Mutex<BTreeMap<PathBuf, String>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for seeding a filesystem.
    pub fn with_file(self, path: impl AsRef<Path>, contents: impl Into<String>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&self, path: impl AsRef<Path>, contents: impl Into<String>) {
        self.lock().insert(normalize(path.as_ref()), contents.into());
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> Option<String> {
        self.lock().remove(&normalize(path.as_ref()))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PathBuf, String>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, path: &Path) -> io::Result<String> {
        self.lock().get(&normalize(path)).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )
        })
    }
}

impl FileSystem for MemoryFs {
    async fn read_file(&self, path: &Path) -> io::Result<String> {
        self.get(path)
    }

    fn read_file_sync(&self, path: &Path) -> io::Result<String> {
        self.get(path)
    }

    fn write_file_sync(&self, path: &Path, contents: &str) -> io::Result<()> {
        self.insert(path, contents);
        Ok(())
    }

    fn read_dir_sync(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let dir = normalize(dir);
        let files = self.lock();
        let mut entries: Vec<PathBuf> = files
            .keys()
            .filter_map(|path| {
                let rest = path.strip_prefix(&dir).ok()?;
                let first = rest.components().next()?;
                Some(dir.join(first))
            })
            .collect();
        entries.sort();
        entries.dedup();
        if entries.is_empty() && !dir.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such directory: {}", dir.display()),
            ));
        }
        Ok(entries)
    }
}

/// Drop `.` components and resolve `..` lexically.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// The host filesystem below a root directory.
#[derive(Debug, Clone)]
pub struct DiskFs {
    root: PathBuf,
}

impl DiskFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl FileSystem for DiskFs {
    async fn read_file(&self, path: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(self.resolve(path)).await
    }

    fn read_file_sync(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(self.resolve(path))
    }

    fn write_file_sync(&self, path: &Path, contents: &str) -> io::Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }

    fn read_dir_sync(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(self.resolve(dir))? {
            entries.push(dir.join(entry?.file_name()));
        }
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_fs_round_trip() {
        let fs = MemoryFs::new();
        fs.write_file_sync(Path::new("./notes/a.cljs"), "(+ 1 2)").unwrap();
        assert_eq!(fs.read_file_sync(Path::new("notes/a.cljs")).unwrap(), "(+ 1 2)");

        let err = fs.read_file_sync(Path::new("notes/missing.cljs")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_memory_fs_lists_direct_children() {
        let fs = MemoryFs::new()
            .with_file("src/app/core.cljs", "")
            .with_file("src/app/util.cljs", "")
            .with_file("src/app/widgets/slider.cljs", "")
            .with_file("README", "");

        let entries = fs.read_dir_sync(Path::new("src/app")).unwrap();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("src/app/core.cljs"),
                PathBuf::from("src/app/util.cljs"),
                PathBuf::from("src/app/widgets"),
            ]
        );
        assert!(fs.read_dir_sync(Path::new("nowhere")).is_err());
    }

    #[tokio::test]
    async fn test_disk_fs_reads_below_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = DiskFs::new(dir.path());
        fs.write_file_sync(Path::new("app/core.cljs"), "(ns app.core)").unwrap();

        assert_eq!(fs.read_file(Path::new("app/core.cljs")).await.unwrap(), "(ns app.core)");
        assert_eq!(fs.read_dir_sync(Path::new("app")).unwrap(), vec![PathBuf::from("app/core.cljs")]);
    }
}
