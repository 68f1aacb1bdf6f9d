//! Configuration for parsing, packing and unpacking.
//!
//! Every options struct implements [`Default`]; start from it and override
//! what you need:
//!
//! ```
//! use tarstream::UnpackOptions;
//!
//! let opts = UnpackOptions {
//!     strip: 1,
//!     keep: true,
//!     ..UnpackOptions::new("/tmp/out")
//! };
//! assert_eq!(opts.max_depth, 1024);
//! ```

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt,
    fs::Metadata,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use tar_header::Timestamp;

use crate::entry::ReadEntry;

/// Default limit on the size of a metadata member body (1 MiB).
pub const DEFAULT_MAX_META_ENTRY_SIZE: u64 = 1024 * 1024;

/// Default number of members a packer prepares concurrently.
pub const DEFAULT_JOBS: usize = 4;

/// Default limit on a single read while packing a file body (16 MiB).
pub const DEFAULT_MAX_READ_SIZE: usize = 16 * 1024 * 1024;

/// Default limit on the number of path components when unpacking.
pub const DEFAULT_MAX_DEPTH: usize = 1024;

/// Predicate deciding whether a parsed member is delivered.
pub type EntryFilter = Arc<dyn Fn(&str, &ReadEntry) -> bool + Send + Sync>;

/// Predicate deciding whether a filesystem path is packed.
pub type PathFilter = Arc<dyn Fn(&str, &Metadata) -> bool + Send + Sync>;

/// A map shared between clones, used to share work across operations.
pub struct SharedCache<K, V>(Arc<Mutex<HashMap<K, V>>>);

impl<K, V> Clone for SharedCache<K, V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<K, V> Default for SharedCache<K, V> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl<K, V> fmt::Debug for SharedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("len", &self.lock().len())
            .finish()
    }
}

impl<K, V> SharedCache<K, V> {
    /// Lock the map. A poisoned lock is recovered, since every update is a
    /// single insert or remove.
    pub fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K: std::hash::Hash + Eq, V: Clone> SharedCache<K, V> {
    /// Look up a value.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    /// Insert a value.
    pub fn insert(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }
}

/// Directories known to exist, keyed by absolute path.
pub type DirCache = SharedCache<PathBuf, bool>;

/// First path seen for each `(dev, ino)` pair, used to emit hard links.
pub type LinkCache = SharedCache<(u64, u64), PathBuf>;

/// Metadata by absolute path.
pub type StatCache = SharedCache<PathBuf, Metadata>;

/// Directory listings by absolute path.
pub type ReaddirCache = SharedCache<PathBuf, Vec<OsString>>;

/// Options for [`Parser`](crate::Parser).
#[derive(Clone)]
pub struct ParseOptions {
    /// Turn every warning into an error.
    pub strict: bool,
    /// Metadata members with larger bodies are ignored.
    pub max_meta_entry_size: u64,
    /// Members for which this returns `false` are skipped.
    pub filter: Option<EntryFilter>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            strict: false,
            max_meta_entry_size: DEFAULT_MAX_META_ENTRY_SIZE,
            filter: None,
        }
    }
}

impl fmt::Debug for ParseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseOptions")
            .field("strict", &self.strict)
            .field("max_meta_entry_size", &self.max_meta_entry_size)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl ParseOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that fail on the first warning.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }
}

/// Options for [`Pack`](crate::Pack) and [`PackSync`](crate::PackSync).
#[derive(Clone)]
pub struct PackOptions {
    /// Directory that added paths are relative to.
    pub cwd: PathBuf,
    /// How many members are prepared concurrently (async only).
    pub jobs: usize,
    /// Follow symbolic links instead of archiving them.
    pub follow: bool,
    /// Don't descend into added directories.
    pub no_dir_recurse: bool,
    /// Leave out owner, times other than mtime, and directory mtimes, and
    /// normalise modes, for reproducible archives.
    pub portable: bool,
    /// Prepended to every archive path.
    pub prefix: Option<String>,
    /// Never write PAX records, even for values that don't fit.
    pub no_pax: bool,
    /// Leave out modification times.
    pub no_mtime: bool,
    /// Use this modification time for every member.
    pub mtime: Option<Timestamp>,
    /// Keep absolute paths instead of stripping their root.
    pub preserve_paths: bool,
    /// Compress the output with gzip.
    pub gzip: bool,
    /// Turn every warning into an error.
    pub strict: bool,
    /// Paths for which this returns `false` are skipped.
    pub filter: Option<PathFilter>,
    /// Largest single read of a file body.
    pub max_read_size: usize,
    pub stat_cache: StatCache,
    pub readdir_cache: ReaddirCache,
    pub link_cache: LinkCache,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            jobs: DEFAULT_JOBS,
            follow: false,
            no_dir_recurse: false,
            portable: false,
            prefix: None,
            no_pax: false,
            no_mtime: false,
            mtime: None,
            preserve_paths: false,
            gzip: false,
            strict: false,
            filter: None,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            stat_cache: StatCache::default(),
            readdir_cache: ReaddirCache::default(),
            link_cache: LinkCache::default(),
        }
    }
}

impl fmt::Debug for PackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackOptions")
            .field("cwd", &self.cwd)
            .field("jobs", &self.jobs)
            .field("follow", &self.follow)
            .field("portable", &self.portable)
            .field("prefix", &self.prefix)
            .field("gzip", &self.gzip)
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

impl PackOptions {
    /// Default options, packing paths relative to `cwd`.
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }
}

/// Options for [`Unpack`](crate::Unpack) and [`UnpackSync`](crate::UnpackSync).
#[derive(Clone)]
pub struct UnpackOptions {
    /// Extraction directory. Members never escape it unless
    /// `preserve_paths` is set.
    pub cwd: PathBuf,
    /// Number of leading path components to remove.
    pub strip: usize,
    /// Members with more path components are skipped.
    pub max_depth: usize,
    /// Allow absolute paths, `..` and extracting through symbolic links.
    pub preserve_paths: bool,
    /// Encode characters Windows can't store in file names.
    pub win32: bool,
    /// Never overwrite existing files.
    pub keep: bool,
    /// Only overwrite files older than the member.
    pub newer: bool,
    /// Remove existing files rather than writing into them, and remove
    /// non-directories in the way of parent directories.
    pub unlink: bool,
    /// Don't restore modification times.
    pub no_mtime: bool,
    /// Don't change the mode of existing directories and files.
    pub no_chmod: bool,
    /// Always chown, even to the current user.
    pub force_chown: bool,
    /// Restore owners from the archive. `None` means "if running as root".
    pub preserve_owner: Option<bool>,
    /// Owner for every member. Requires `gid`.
    pub uid: Option<u32>,
    /// Group for every member. Requires `uid`.
    pub gid: Option<u32>,
    /// Umask applied to default modes. `None` reads the process umask.
    pub umask: Option<u32>,
    /// Mode for new files without one in the archive.
    pub fmode: Option<u32>,
    /// Mode for new parent directories.
    pub dmode: Option<u32>,
    /// Turn every warning into an error.
    pub strict: bool,
    /// Members for which this returns `false` are skipped.
    pub filter: Option<EntryFilter>,
    /// How many members are extracted concurrently (async only).
    pub jobs: usize,
    /// Metadata members with larger bodies are ignored.
    pub max_meta_entry_size: u64,
    pub dir_cache: DirCache,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            strip: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            preserve_paths: false,
            win32: false,
            keep: false,
            newer: false,
            unlink: false,
            no_mtime: false,
            no_chmod: false,
            force_chown: false,
            preserve_owner: None,
            uid: None,
            gid: None,
            umask: None,
            fmode: None,
            dmode: None,
            strict: false,
            filter: None,
            jobs: DEFAULT_JOBS,
            max_meta_entry_size: DEFAULT_MAX_META_ENTRY_SIZE,
            dir_cache: DirCache::default(),
        }
    }
}

impl fmt::Debug for UnpackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnpackOptions")
            .field("cwd", &self.cwd)
            .field("strip", &self.strip)
            .field("max_depth", &self.max_depth)
            .field("preserve_paths", &self.preserve_paths)
            .field("keep", &self.keep)
            .field("newer", &self.newer)
            .field("unlink", &self.unlink)
            .field("preserve_owner", &self.preserve_owner)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

impl UnpackOptions {
    /// Default options, extracting into `cwd`.
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub(crate) fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            strict: self.strict,
            max_meta_entry_size: self.max_meta_entry_size,
            filter: self.filter.clone(),
        }
    }
}
