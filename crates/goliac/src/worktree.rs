//! Filesystem abstraction over the cloned teams-repository worktree.
//!
//! The loader and the post-reconciliation committer only ever touch the
//! worktree through [`Worktree`], so tests can run against an in-memory
//! tree without cloning anything.

use std::{
    fs,
    io::{self, ErrorKind},
};

#[cfg(test)]
use std::{collections::BTreeMap, sync::RwLock};

use camino::{Utf8Path, Utf8PathBuf};

/// Read/write access to a worktree. All paths are worktree-relative.
pub(crate) trait Worktree: Send + Sync {
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Utf8Path, contents: &[u8]) -> io::Result<()>;
    fn remove(&self, path: &Utf8Path) -> io::Result<()>;
    fn mkdir_all(&self, path: &Utf8Path) -> io::Result<()>;
    fn exists(&self, path: &Utf8Path) -> bool;
    /// All files under `root`, recursively, as sorted relative paths.
    fn walk(&self, root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>>;
    /// Immediate subdirectories of `root`, sorted.
    fn subdirs(&self, root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>>;

    fn read_to_string(&self, path: &Utf8Path) -> io::Result<String> {
        let raw = self.read(path)?;
        String::from_utf8(raw).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
    }
}

/// A worktree rooted at a real directory on disk.
pub(crate) struct DiskWorktree {
    root: Utf8PathBuf,
}

impl DiskWorktree {
    pub(crate) fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn absolute(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.root.join(path)
    }

    fn walk_into(&self, dir: &Utf8Path, out: &mut Vec<Utf8PathBuf>) -> io::Result<()> {
        for entry in fs::read_dir(self.absolute(dir))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "non-UTF-8 file name"))?;
            // The worktree's own `.git` is not part of the declared state.
            if name == ".git" {
                continue;
            }
            let rel = dir.join(name);
            if entry.file_type()?.is_dir() {
                self.walk_into(&rel, out)?;
            } else {
                out.push(rel);
            }
        }
        Ok(())
    }
}

impl Worktree for DiskWorktree {
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        fs::read(self.absolute(path))
    }

    fn write(&self, path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(self.absolute(parent))?;
        }
        fs::write(self.absolute(path), contents)
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        fs::remove_file(self.absolute(path))
    }

    fn mkdir_all(&self, path: &Utf8Path) -> io::Result<()> {
        fs::create_dir_all(self.absolute(path))
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        self.absolute(path).exists()
    }

    fn walk(&self, root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
        let mut out = Vec::new();
        match self.walk_into(root, &mut out) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        out.sort();
        Ok(out)
    }

    fn subdirs(&self, root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(self.absolute(root)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name();
                let name = name
                    .to_str()
                    .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "non-UTF-8 dir name"))?;
                if name == ".git" {
                    continue;
                }
                out.push(root.join(name));
            }
        }
        out.sort();
        Ok(out)
    }
}

/// An in-memory worktree, mirroring the `inmemory:///` scheme of the git
/// contract.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryWorktree {
    files: RwLock<BTreeMap<Utf8PathBuf, Vec<u8>>>,
}

#[cfg(test)]
impl MemoryWorktree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Seeds a file, panicking on poisoned locks. Test convenience.
    pub(crate) fn seed(&self, path: impl Into<Utf8PathBuf>, contents: &str) {
        self.files
            .write()
            .expect("poisoned worktree lock")
            .insert(path.into(), contents.as_bytes().to_vec());
    }
}

#[cfg(test)]
impl Worktree for MemoryWorktree {
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        self.files
            .read()
            .map_err(|_| io::Error::other("poisoned worktree lock"))?
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, path.to_string()))
    }

    fn write(&self, path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
        self.files
            .write()
            .map_err(|_| io::Error::other("poisoned worktree lock"))?
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        self.files
            .write()
            .map_err(|_| io::Error::other("poisoned worktree lock"))?
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, path.to_string()))
    }

    fn mkdir_all(&self, _path: &Utf8Path) -> io::Result<()> {
        // Directories are implicit in the in-memory tree.
        Ok(())
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        self.files
            .read()
            .map(|files| {
                files.contains_key(path) || files.keys().any(|k| k.starts_with(path))
            })
            .unwrap_or(false)
    }

    fn walk(&self, root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
        Ok(self
            .files
            .read()
            .map_err(|_| io::Error::other("poisoned worktree lock"))?
            .keys()
            .filter(|k| k.starts_with(root))
            .cloned()
            .collect())
    }

    fn subdirs(&self, root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
        let files = self
            .files
            .read()
            .map_err(|_| io::Error::other("poisoned worktree lock"))?;
        let mut out: Vec<Utf8PathBuf> = Vec::new();
        for key in files.keys() {
            let Ok(rest) = key.strip_prefix(root) else {
                continue;
            };
            let mut components = rest.components();
            let Some(first) = components.next() else {
                continue;
            };
            // Only paths with at least one more component are directories.
            if components.next().is_some() {
                let dir = root.join(first.as_str());
                if !out.contains(&dir) {
                    out.push(dir);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_worktree_roundtrip() {
        let tree = MemoryWorktree::new();
        tree.seed("teams/sre/team.yaml", "name: sre");
        tree.seed("teams/sre/app/team.yaml", "name: app");
        tree.seed("users/org/alice.yaml", "name: alice");

        assert_eq!(
            tree.read_to_string(Utf8Path::new("teams/sre/team.yaml")).unwrap(),
            "name: sre"
        );
        assert_eq!(
            tree.walk(Utf8Path::new("teams")).unwrap(),
            vec![
                Utf8PathBuf::from("teams/sre/app/team.yaml"),
                Utf8PathBuf::from("teams/sre/team.yaml"),
            ]
        );
        assert_eq!(
            tree.subdirs(Utf8Path::new("teams")).unwrap(),
            vec![Utf8PathBuf::from("teams/sre")]
        );

        tree.remove(Utf8Path::new("users/org/alice.yaml")).unwrap();
        assert!(!tree.exists(Utf8Path::new("users/org/alice.yaml")));
    }

    #[test]
    fn disk_worktree_walk_skips_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let tree = DiskWorktree::new(root);

        tree.write(Utf8Path::new("goliac.yaml"), b"{}").unwrap();
        tree.write(Utf8Path::new(".git/config"), b"noise").unwrap();
        tree.write(Utf8Path::new("teams/sre/team.yaml"), b"x").unwrap();

        assert_eq!(
            tree.walk(Utf8Path::new("")).unwrap(),
            vec![
                Utf8PathBuf::from("goliac.yaml"),
                Utf8PathBuf::from("teams/sre/team.yaml"),
            ]
        );
    }
}
