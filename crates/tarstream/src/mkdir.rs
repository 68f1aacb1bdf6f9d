//! Creating the parent directories of extracted members.
//!
//! Directories are created one component at a time below the extraction
//! root, so that a symbolic link planted by an earlier member (or already on
//! disk) is noticed instead of followed.

use std::{
    fs::{self, DirBuilder},
    io,
    os::unix::fs::{chown, DirBuilderExt},
    path::{Component, Path, PathBuf},
};

use log::debug;

use crate::{
    error::{Error, Result},
    options::DirCache,
};

/// How to create parent directories.
#[derive(Debug)]
pub(crate) struct Mkdir<'a> {
    /// The extraction root. Must already exist.
    pub cwd: &'a Path,
    /// Mode for new directories, before the umask.
    pub mode: u32,
    /// Owner for new directories.
    pub owner: Option<(u32, u32)>,
    /// Follow symbolic links and allow paths outside `cwd`.
    pub preserve_paths: bool,
    /// Replace non-directories that are in the way.
    pub unlink: bool,
    pub cache: &'a DirCache,
}

impl Mkdir<'_> {
    /// Make sure `dir` exists, returning the directories that were created.
    pub(crate) fn create(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if self.cache.get(&dir.to_path_buf()) == Some(true) {
            return Ok(Vec::new());
        }

        let made = if dir == self.cwd {
            check_cwd(dir)?;
            Vec::new()
        } else if self.preserve_paths || !dir.starts_with(self.cwd) {
            self.mkdirp(dir)?
        } else {
            self.walk(dir)?
        };

        if let Some((uid, gid)) = self.owner {
            for path in &made {
                chown(path, Some(uid), Some(gid))?;
            }
        }
        if !made.is_empty() {
            debug!("created {} directories for {}", made.len(), dir.display());
        }
        self.cache.insert(dir.to_path_buf(), true);
        Ok(made)
    }

    /// Create each component below `cwd`, refusing to pass through links.
    fn walk(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if self.cache.get(&self.cwd.to_path_buf()) != Some(true) {
            check_cwd(self.cwd)?;
            self.cache.insert(self.cwd.to_path_buf(), true);
        }

        let rel = dir.strip_prefix(self.cwd).unwrap_or(dir);
        let mut made = Vec::new();
        let mut current = self.cwd.to_path_buf();
        for part in rel.components() {
            let Component::Normal(part) = part else {
                continue;
            };
            current.push(part);
            if self.cache.get(&current) == Some(true) {
                continue;
            }
            if self.mkdir_one(&current, dir)? {
                made.push(current.clone());
            }
            self.cache.insert(current.clone(), true);
        }
        Ok(made)
    }

    /// Returns whether `path` was created.
    fn mkdir_one(&self, path: &Path, target: &Path) -> Result<bool> {
        let err = match self.builder().create(path) {
            Ok(()) => return Ok(true),
            Err(e) => e,
        };
        let st = fs::symlink_metadata(path)?;
        if st.is_dir() {
            Ok(false)
        } else if self.unlink {
            fs::remove_file(path)?;
            self.builder().create(path)?;
            Ok(true)
        } else if st.file_type().is_symlink() {
            Err(Error::Symlink {
                symlink: path.to_path_buf(),
                path: target.to_path_buf(),
            })
        } else {
            Err(err.into())
        }
    }

    /// Create `dir` and any missing ancestors, following links.
    fn mkdirp(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut missing = Vec::new();
        for ancestor in dir.ancestors() {
            if ancestor.as_os_str().is_empty() || ancestor.is_dir() {
                break;
            }
            missing.push(ancestor);
        }

        let mut made = Vec::new();
        for path in missing.into_iter().rev() {
            match self.builder().create(path) {
                Ok(()) => made.push(path.to_path_buf()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(made)
    }

    fn builder(&self) -> DirBuilder {
        let mut builder = DirBuilder::new();
        builder.mode(self.mode);
        builder
    }
}

/// Fail unless `cwd` is an existing directory.
pub(crate) fn check_cwd(cwd: &Path) -> Result<()> {
    match fs::metadata(cwd) {
        Ok(st) if st.is_dir() => Ok(()),
        Ok(_) => Err(Error::Cwd {
            path: cwd.to_path_buf(),
            reason: "not a directory".into(),
        }),
        Err(e) => Err(Error::Cwd {
            path: cwd.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}
