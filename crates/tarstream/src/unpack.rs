//! Extracting archives onto the filesystem.
//!
//! Every member goes through the same steps: its path is checked and
//! rewritten (stripping, depth, `..`, absolute roots, escaping the
//! extraction root), parent directories are created without following
//! symbolic links, whatever is in the way is removed or reused, and the new
//! object is created with the archived mode, times and (optionally) owner.
//!
//! [`UnpackSync`] does this inline while parsing. [`Unpack`] hands each
//! member to a blocking task once a [`PathReservations`] slot for its paths
//! is granted, so unrelated members are extracted concurrently while
//! anything touching the same path happens in archive order.
//!
//! Problems with a single member become `TAR_ENTRY_ERROR` warnings in the
//! returned [`UnpackSummary`]; a damaged archive, an unusable extraction
//! root or a symbolic link in a parent path end the whole extraction.

use std::{
    collections::VecDeque,
    fmt,
    fs::{self, File, FileTimes, Metadata, OpenOptions},
    io::{self, Read, Write},
    mem,
    os::unix::fs::{chown, fchown, symlink, MetadataExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use bytes::Bytes;
use log::{debug, warn};
use rustix::{
    fs::{utimensat, AtFlags, Mode, Timespec, Timestamps, CWD},
    process::{getgid, getuid, umask},
};
use tar_header::{EntryType, Timestamp};
use tokio::{
    io::AsyncRead,
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};

use crate::{
    entry::ReadEntry,
    error::{Error, Result, Warning, WarningCode},
    mkdir::Mkdir,
    options::UnpackOptions,
    parse::{AsyncEvents, Event, Parser},
    paths::{components, normalize, strip_absolute},
    reservations::PathReservations,
    winchars,
};

/// Body chunks buffered between the parser and a blocking writer.
const BODY_CHANNEL_SIZE: usize = 4;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// What an extraction did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Members written to the filesystem.
    pub extracted: usize,
    /// Members left alone: filtered, rejected paths, `keep`/`newer`.
    pub skipped: usize,
    /// Devices and FIFOs, which are never created.
    pub unsupported: usize,
    /// Directories created, in creation order.
    pub dirs_created: Vec<PathBuf>,
    /// Warnings raised along the way.
    pub warnings: Vec<Warning>,
}

impl UnpackSummary {
    fn merge(&mut self, other: UnpackSummary) {
        self.extracted += other.extracted;
        self.skipped += other.skipped;
        self.unsupported += other.unsupported;
        self.dirs_created.extend(other.dirs_created);
        self.warnings.extend(other.warnings);
    }

    fn warn(&mut self, strict: bool, warning: Warning) -> Result<()> {
        warn!("{warning}");
        if strict {
            return Err(Error::Warning(warning));
        }
        self.warnings.push(warning);
        Ok(())
    }

    /// Report a failed member, unless the failure ends the extraction.
    fn entry_error(&mut self, strict: bool, path: &str, err: Error) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        self.warn(
            strict,
            Warning::new(WarningCode::EntryError, err.to_string()).with_path(path),
        )
    }

    fn archive_warning(&mut self, warning: Warning) -> Result<()> {
        if warning.code == WarningCode::BadArchive {
            return Err(Error::Warning(warning));
        }
        self.warnings.push(warning);
        Ok(())
    }
}

/// Where a member goes, after path checks.
#[derive(Clone, Debug)]
pub(crate) struct Target {
    pub absolute: PathBuf,
    /// Hard link source, resolved below the extraction root.
    pub link: Option<PathBuf>,
}

impl Target {
    /// Paths to reserve: the target, and the other end of a link.
    fn reserve_paths(&self, entry: &ReadEntry) -> Vec<PathBuf> {
        let mut paths = vec![self.absolute.clone()];
        if let Some(link) = &self.link {
            paths.push(link.clone());
        } else if entry.entry_type.is_symlink() {
            if let Some(parent) = self.absolute.parent() {
                paths.push(normalize(&parent.join(&entry.linkpath)));
            }
        }
        paths
    }
}

/// What to do with a member's body.
pub(crate) enum Action {
    /// Nothing was written; discard the body.
    Skip,
    /// The member is complete.
    Done,
    /// Stream the body into this file.
    File(FileSink),
}

/// An open file receiving a member's body.
pub(crate) struct FileSink {
    file: File,
    path: PathBuf,
    remain: u64,
    times: Option<(Timestamp, Timestamp)>,
    owner: Option<(u32, u32)>,
}

impl FileSink {
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.remain = self.remain.saturating_sub(data.len() as u64);
        Ok(())
    }

    /// Apply times and ownership once the whole body is written.
    pub(crate) fn finish(self) -> Result<()> {
        if self.remain > 0 {
            return Err(Error::UnexpectedEof {
                path: self.path,
                remain: self.remain,
            });
        }
        if let Some((atime, mtime)) = self.times {
            let times = FileTimes::new()
                .set_accessed(atime.to_system_time())
                .set_modified(mtime.to_system_time());
            if let Err(e) = self.file.set_times(times) {
                debug!("futimens failed on {}: {e}", self.path.display());
                set_path_times(&self.path, atime, mtime)?;
            }
        }
        if let Some((uid, gid)) = self.owner {
            if let Err(e) = fchown(&self.file, Some(uid), Some(gid)) {
                debug!("fchown failed on {}: {e}", self.path.display());
                chown(&self.path, Some(uid), Some(gid))?;
            }
        }
        Ok(())
    }
}

fn set_path_times(path: &Path, atime: Timestamp, mtime: Timestamp) -> io::Result<()> {
    let timespec = |t: Timestamp| Timespec {
        tv_sec: t.secs(),
        tv_nsec: t.nanos().into(),
    };
    let times = Timestamps {
        last_access: timespec(atime),
        last_modification: timespec(mtime),
    };
    utimensat(CWD, path, &times, AtFlags::empty())?;
    Ok(())
}

fn process_umask() -> u32 {
    let old = umask(Mode::empty());
    umask(old);
    u32::from(old.bits())
}

/// Drop `strip` leading components; `None` if there aren't that many.
fn strip_components(path: &str, strip: usize) -> Option<String> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < strip {
        return None;
    }
    Some(parts[strip..].join("/"))
}

/// The filesystem policy shared by [`UnpackSync`] and [`Unpack`].
pub(crate) struct Extractor {
    opts: UnpackOptions,
    fmode: u32,
    dmode: u32,
    preserve_owner: bool,
    process_uid: u32,
    process_gid: u32,
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extractor")
            .field("opts", &self.opts)
            .field("fmode", &format!("{:o}", self.fmode))
            .field("dmode", &format!("{:o}", self.dmode))
            .field("preserve_owner", &self.preserve_owner)
            .finish_non_exhaustive()
    }
}

impl Extractor {
    pub(crate) fn new(mut opts: UnpackOptions) -> Result<Self> {
        if opts.uid.is_some() != opts.gid.is_some() {
            return Err(Error::InvalidOptions(
                "cannot set owner without both uid and gid",
            ));
        }
        if opts.uid.is_some() && opts.preserve_owner == Some(true) {
            return Err(Error::InvalidOptions(
                "cannot preserve owner in archive and also set owner explicitly",
            ));
        }
        opts.cwd = normalize(&std::path::absolute(&opts.cwd)?);

        let umask = opts.umask.unwrap_or_else(process_umask);
        let process_uid = getuid().as_raw();
        let process_gid = getgid().as_raw();
        let preserve_owner = opts
            .preserve_owner
            .unwrap_or(opts.uid.is_none() && process_uid == 0);

        Ok(Self {
            fmode: opts.fmode.unwrap_or(0o666 & !umask),
            dmode: opts.dmode.unwrap_or(0o777 & !umask),
            preserve_owner,
            process_uid,
            process_gid,
            opts,
        })
    }

    pub(crate) fn opts(&self) -> &UnpackOptions {
        &self.opts
    }

    /// Work out where `entry` goes, or `None` to skip it.
    pub(crate) fn check_path(&self, entry: &ReadEntry, warnings: &mut Vec<Warning>) -> Option<Target> {
        let opts = &self.opts;
        let mut path = entry.path.clone();
        let mut linkpath = entry.linkpath.clone();
        let hard_link = entry.entry_type.is_hard_link();

        if opts.strip > 0 {
            path = strip_components(&path, opts.strip)?;
            if hard_link {
                linkpath = strip_components(&linkpath, opts.strip)?;
            }
        }

        let error = |message: &str| {
            Warning::new(WarningCode::EntryError, message).with_path(entry.path.clone())
        };

        if components(&path).len() > opts.max_depth {
            warnings.push(error("path excessively deep"));
            return None;
        }

        if !opts.preserve_paths {
            let has_parent = |p: &str| p.split('/').any(|c| c == "..");
            if has_parent(&path) {
                warnings.push(error("path contains '..'"));
                return None;
            }
            if hard_link && has_parent(&linkpath) {
                warnings.push(error("linkpath contains '..'"));
                return None;
            }

            let (root, rest) = strip_absolute(&path);
            if !root.is_empty() {
                warnings.push(
                    Warning::new(
                        WarningCode::EntryInfo,
                        format!("stripping {root} from absolute path"),
                    )
                    .with_path(entry.path.clone()),
                );
                path = rest.to_string();
            }
            if hard_link {
                let (root, rest) = strip_absolute(&linkpath);
                if !root.is_empty() {
                    warnings.push(
                        Warning::new(
                            WarningCode::EntryInfo,
                            format!("stripping {root} from absolute linkpath"),
                        )
                        .with_path(entry.path.clone()),
                    );
                    linkpath = rest.to_string();
                }
            }
        }

        if opts.win32 {
            path = winchars::encode(&path);
            linkpath = winchars::encode(&linkpath);
        }

        let cwd = &opts.cwd;
        let absolute = normalize(&cwd.join(&path));
        if !opts.preserve_paths && !absolute.starts_with(cwd) {
            warnings.push(error("path escaped extraction target"));
            return None;
        }
        if absolute == *cwd && !entry.entry_type.is_dir() {
            return None;
        }

        let link = if hard_link {
            let link = normalize(&cwd.join(&linkpath));
            if !opts.preserve_paths && !link.starts_with(cwd) {
                warnings.push(error("linkpath escaped extraction target"));
                return None;
            }
            Some(link)
        } else {
            None
        };

        Some(Target { absolute, link })
    }

    /// Whether this kind of member is ever created.
    pub(crate) fn is_supported(entry_type: EntryType) -> bool {
        entry_type.is_file() || entry_type.is_dir() || entry_type.is_link()
    }

    fn unsupported(entry: &ReadEntry) -> Warning {
        Warning::new(
            WarningCode::EntryUnsupported,
            format!("unsupported entry type: {}", entry.entry_type.name()),
        )
        .with_path(entry.path.clone())
    }

    fn mkdir(&self, dir: &Path, mode: u32) -> Result<Vec<PathBuf>> {
        Mkdir {
            cwd: &self.opts.cwd,
            mode,
            owner: self.explicit_owner(),
            preserve_paths: self.opts.preserve_paths,
            unlink: self.opts.unlink,
            cache: &self.opts.dir_cache,
        }
        .create(dir)
    }

    /// The configured owner, if it differs from ours.
    fn explicit_owner(&self) -> Option<(u32, u32)> {
        match (self.opts.uid, self.opts.gid) {
            (Some(uid), Some(gid)) if uid != self.process_uid || gid != self.process_gid => {
                Some((uid, gid))
            }
            _ => None,
        }
    }

    /// The owner to give `entry`, or `None` to leave it as created.
    fn owner_for(&self, entry: &ReadEntry) -> Option<(u32, u32)> {
        // archived ids count only when preserving owners
        let entry_uid = entry
            .uid
            .and_then(|u| u32::try_from(u).ok())
            .filter(|_| self.preserve_owner);
        let entry_gid = entry
            .gid
            .and_then(|g| u32::try_from(g).ok())
            .filter(|_| self.preserve_owner);
        let from_entry = self.preserve_owner
            && (entry_uid.is_some_and(|u| u != self.process_uid)
                || entry_gid.is_some_and(|g| g != self.process_gid));
        if !(self.opts.force_chown || from_entry || self.explicit_owner().is_some()) {
            return None;
        }
        Some((
            self.opts.uid.or(entry_uid).unwrap_or(self.process_uid),
            self.opts.gid.or(entry_gid).unwrap_or(self.process_gid),
        ))
    }

    fn times_for(&self, entry: &ReadEntry) -> Option<(Timestamp, Timestamp)> {
        if self.opts.no_mtime {
            return None;
        }
        let mtime = entry.mtime?;
        let atime = entry
            .atime
            .unwrap_or_else(|| Timestamp::from_system_time(SystemTime::now()));
        Some((atime, mtime))
    }

    fn dir_mode(&self, entry: &ReadEntry) -> u32 {
        entry.mode.filter(|m| *m != 0).map_or(self.dmode, |m| m | 0o700)
    }

    fn file_mode(&self, entry: &ReadEntry) -> u32 {
        entry.mode.filter(|m| *m != 0).unwrap_or(self.fmode)
    }

    /// Forget cached directories that this member may replace.
    fn prune_cache(&self, entry: &ReadEntry, absolute: &Path) {
        let mut cache = self.opts.dir_cache.lock();
        if entry.entry_type.is_symlink() {
            cache.clear();
        } else if !entry.entry_type.is_dir() {
            cache.retain(|dir, _| !dir.starts_with(absolute));
        }
    }

    fn is_reusable(&self, entry: &ReadEntry, st: &Metadata) -> bool {
        entry.entry_type.is_file()
            && !self.opts.unlink
            && st.is_file()
            && st.nlink() <= 1
            && !self.opts.win32
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        if self.opts.win32 {
            let suffix = hex::encode(rand::random::<[u8; 16]>());
            let mut trash = path.as_os_str().to_owned();
            trash.push(format!(".DELETE.{suffix}"));
            fs::rename(path, &trash)?;
            fs::remove_file(&trash)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Prepare the filesystem for `entry` and create it.
    ///
    /// Directories created on the way are appended to `dirs`.
    pub(crate) fn extract(
        &self,
        entry: &ReadEntry,
        target: &Target,
        dirs: &mut Vec<PathBuf>,
    ) -> Result<Action> {
        let cwd = &self.opts.cwd;
        let absolute = &target.absolute;
        self.mkdir(cwd, self.dmode)?;
        self.prune_cache(entry, absolute);

        if let Some(parent) = absolute.parent().filter(|_| absolute != cwd) {
            if parent != cwd {
                dirs.extend(self.mkdir(parent, self.dmode)?);
            }
        }

        match fs::symlink_metadata(absolute) {
            Ok(st) => {
                let newer = || {
                    let existing = Timestamp::new(st.mtime(), st.mtime_nsec() as u32);
                    entry.mtime.is_some_and(|m| existing > m)
                };
                if self.opts.keep || (self.opts.newer && newer()) {
                    debug!("keeping existing {}", absolute.display());
                    return Ok(Action::Skip);
                }
                if !self.is_reusable(entry, &st) {
                    if st.is_dir() {
                        if entry.entry_type.is_dir() {
                            let mode = self.dir_mode(entry);
                            let chmod = !self.opts.no_chmod && entry.mode.is_some() && absolute != cwd;
                            if chmod && st.mode() & 0o7777 != mode {
                                fs::set_permissions(absolute, fs::Permissions::from_mode(mode))?;
                            }
                        } else if absolute != cwd {
                            fs::remove_dir(absolute)?;
                        }
                    } else if absolute != cwd {
                        self.unlink(absolute)?;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.make(entry, target, dirs)
    }

    fn make(&self, entry: &ReadEntry, target: &Target, dirs: &mut Vec<PathBuf>) -> Result<Action> {
        let absolute = &target.absolute;
        let entry_type = entry.entry_type;

        if entry_type.is_dir() {
            debug!("creating directory {}", absolute.display());
            let mode = self.dir_mode(entry);
            dirs.extend(self.mkdir(absolute, mode)?);
            if let Some((uid, gid)) = self.owner_for(entry) {
                chown(absolute, Some(uid), Some(gid))?;
            }
            // mkdir applied the umask
            if !self.opts.no_chmod && entry.mode.is_some() && absolute != &self.opts.cwd {
                fs::set_permissions(absolute, fs::Permissions::from_mode(mode))?;
            }
            if let Some((atime, mtime)) = self.times_for(entry) {
                set_path_times(absolute, atime, mtime)?;
            }
            Ok(Action::Done)
        } else if entry_type.is_file() {
            debug!("writing {} ({} bytes)", absolute.display(), entry.size);
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(self.file_mode(entry))
                .open(absolute)?;
            Ok(Action::File(FileSink {
                file,
                path: absolute.clone(),
                remain: entry.size,
                times: self.times_for(entry),
                owner: self.owner_for(entry),
            }))
        } else if let Some(link) = &target.link {
            debug!("linking {} to {}", absolute.display(), link.display());
            fs::hard_link(link, absolute)?;
            Ok(Action::Done)
        } else if entry_type.is_symlink() {
            debug!("symlinking {} to {}", absolute.display(), entry.linkpath);
            symlink(&entry.linkpath, absolute)?;
            Ok(Action::Done)
        } else {
            Ok(Action::Skip)
        }
    }

    /// Extract one member, reading its body from `body`. Runs on a
    /// blocking thread.
    fn run(
        &self,
        entry: &ReadEntry,
        target: &Target,
        mut body: mpsc::Receiver<Bytes>,
    ) -> Result<UnpackSummary> {
        let strict = self.opts.strict;
        let mut part = UnpackSummary::default();
        match self.extract(entry, target, &mut part.dirs_created) {
            Ok(Action::Skip) => part.skipped += 1,
            Ok(Action::Done) => part.extracted += 1,
            Ok(Action::File(mut sink)) => {
                let written = loop {
                    match body.blocking_recv() {
                        Some(data) => {
                            if let Err(e) = sink.write(&data) {
                                break Err(e);
                            }
                        }
                        None => break Ok(()),
                    }
                };
                match written.and_then(|()| sink.finish()) {
                    Ok(()) => part.extracted += 1,
                    Err(e) => part.entry_error(strict, &entry.path, e)?,
                }
            }
            Err(e) => part.entry_error(strict, &entry.path, e)?,
        }
        Ok(part)
    }
}

enum Current {
    None,
    Skip,
    File(String, FileSink),
}

/// Blocking extractor, fed archive bytes as they arrive.
///
/// ```no_run
/// use tarstream::{UnpackOptions, UnpackSync};
///
/// let archive = std::fs::File::open("backup.tar.gz").unwrap();
/// let summary = UnpackSync::new(UnpackOptions::new("/restore"))
///     .unwrap()
///     .unpack(archive)
///     .unwrap();
/// println!("extracted {} members", summary.extracted);
/// ```
pub struct UnpackSync {
    extractor: Extractor,
    parser: Parser,
    current: Current,
    summary: UnpackSummary,
}

impl fmt::Debug for UnpackSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnpackSync")
            .field("extractor", &self.extractor)
            .field("parser", &self.parser)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl UnpackSync {
    /// Create an extractor.
    ///
    /// # Errors
    ///
    /// Fails on contradictory ownership options.
    pub fn new(opts: UnpackOptions) -> Result<Self> {
        let parser = Parser::new(opts.parse_options());
        Ok(Self {
            extractor: Extractor::new(opts)?,
            parser,
            current: Current::None,
            summary: UnpackSummary::default(),
        })
    }

    /// Feed archive bytes, extracting every member they complete.
    ///
    /// # Errors
    ///
    /// Fails on a damaged archive, an unusable extraction root, a symbolic
    /// link in a parent path, and on any warning in strict mode.
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.parser.write(chunk)?;
        self.drain()
    }

    /// Finish extraction once the input is exhausted.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn end(mut self) -> Result<UnpackSummary> {
        self.parser.end()?;
        self.drain()?;
        Ok(self.summary)
    }

    /// Extract everything `reader` produces.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn unpack<R: Read>(mut self, mut reader: R) -> Result<UnpackSummary> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return self.end(),
                Ok(n) => self.write(&buf[..n])?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(event) = self.parser.next_event() {
            self.handle(event)?;
        }
        Ok(())
    }

    fn handle(&mut self, event: Event) -> Result<()> {
        let strict = self.extractor.opts().strict;
        match event {
            Event::Entry(entry) => {
                self.current = self.begin(&entry)?;
            }
            Event::Data(data) => {
                if let Current::File(path, sink) = &mut self.current {
                    if let Err(e) = sink.write(&data) {
                        let path = mem::take(path);
                        self.current = Current::Skip;
                        self.summary.entry_error(strict, &path, e)?;
                    }
                }
            }
            Event::EntryEnd => {
                if let Current::File(path, sink) = mem::replace(&mut self.current, Current::None) {
                    match sink.finish() {
                        Ok(()) => self.summary.extracted += 1,
                        Err(e) => self.summary.entry_error(strict, &path, e)?,
                    }
                }
            }
            Event::Ignored(_) => self.summary.skipped += 1,
            Event::Warning(w) => self.summary.archive_warning(w)?,
            Event::Meta { .. } | Event::End => {}
        }
        Ok(())
    }

    fn begin(&mut self, entry: &ReadEntry) -> Result<Current> {
        let strict = self.extractor.opts().strict;
        let mut warnings = Vec::new();
        let target = self.extractor.check_path(entry, &mut warnings);
        for w in warnings {
            self.summary.warn(strict, w)?;
        }
        let Some(target) = target else {
            self.summary.skipped += 1;
            return Ok(Current::Skip);
        };
        if !Extractor::is_supported(entry.entry_type) {
            self.summary.unsupported += 1;
            self.summary.warn(strict, Extractor::unsupported(entry))?;
            return Ok(Current::Skip);
        }

        match self
            .extractor
            .extract(entry, &target, &mut self.summary.dirs_created)
        {
            Ok(Action::Skip) => {
                self.summary.skipped += 1;
                Ok(Current::Skip)
            }
            Ok(Action::Done) => {
                self.summary.extracted += 1;
                Ok(Current::None)
            }
            Ok(Action::File(sink)) => Ok(Current::File(entry.path.clone(), sink)),
            Err(e) => {
                self.summary.entry_error(strict, &entry.path, e)?;
                Ok(Current::Skip)
            }
        }
    }
}

type ExtractTask = JoinHandle<Result<UnpackSummary>>;

/// Async extractor running members concurrently where their paths allow.
///
/// Must be used inside a Tokio runtime.
pub struct Unpack {
    extractor: Arc<Extractor>,
    reservations: PathReservations,
    semaphore: Arc<Semaphore>,
}

impl fmt::Debug for Unpack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unpack")
            .field("extractor", &self.extractor)
            .field("reservations", &self.reservations)
            .finish_non_exhaustive()
    }
}

impl Unpack {
    /// Create an extractor.
    ///
    /// # Errors
    ///
    /// Fails on contradictory ownership options.
    pub fn new(opts: UnpackOptions) -> Result<Self> {
        let jobs = opts.jobs.max(1);
        Ok(Self {
            extractor: Arc::new(Extractor::new(opts)?),
            reservations: PathReservations::new(),
            semaphore: Arc::new(Semaphore::new(jobs)),
        })
    }

    /// Extract everything `reader` produces.
    ///
    /// Members are handed out in archive order and results are reported in
    /// that order, whatever order they finish in.
    ///
    /// # Errors
    ///
    /// See [`UnpackSync::write`].
    pub async fn unpack<R: AsyncRead + Unpin>(&self, reader: R) -> Result<UnpackSummary> {
        let mut events = AsyncEvents::new(reader, self.extractor.opts().parse_options());
        let mut summary = UnpackSummary::default();
        let mut tasks = VecDeque::new();

        let result = self.drive(&mut events, &mut summary, &mut tasks).await;

        // everything already started runs to completion before we return
        let mut first_err = result.err();
        while let Some(task) = tasks.pop_front() {
            match task.await.map_err(Error::from).and_then(|r| r) {
                Ok(part) => summary.merge(part),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn drive<R: AsyncRead + Unpin>(
        &self,
        events: &mut AsyncEvents<R>,
        summary: &mut UnpackSummary,
        tasks: &mut VecDeque<ExtractTask>,
    ) -> Result<()> {
        let strict = self.extractor.opts().strict;
        let mut body: Option<mpsc::Sender<Bytes>> = None;

        while let Some(event) = events.next().await {
            match event? {
                Event::Entry(entry) => {
                    body = None;
                    let mut warnings = Vec::new();
                    let target = self.extractor.check_path(&entry, &mut warnings);
                    for w in warnings {
                        summary.warn(strict, w)?;
                    }
                    let Some(target) = target else {
                        summary.skipped += 1;
                        continue;
                    };
                    if !Extractor::is_supported(entry.entry_type) {
                        summary.unsupported += 1;
                        summary.warn(strict, Extractor::unsupported(&entry))?;
                        continue;
                    }

                    let (tx, rx) = mpsc::channel(BODY_CHANNEL_SIZE);
                    if entry.entry_type.is_file() {
                        body = Some(tx);
                    }
                    tasks.push_back(self.spawn(entry, target, rx));
                }
                Event::Data(data) => {
                    if let Some(tx) = &body {
                        if tx.send(data).await.is_err() {
                            body = None;
                        }
                    }
                }
                Event::EntryEnd => body = None,
                Event::Ignored(_) => summary.skipped += 1,
                Event::Warning(w) => summary.archive_warning(w)?,
                Event::Meta { .. } | Event::End => {}
            }

            while tasks.front().is_some_and(JoinHandle::is_finished) {
                if let Some(task) = tasks.pop_front() {
                    summary.merge(task.await??);
                }
            }
        }
        Ok(())
    }

    fn spawn(&self, entry: ReadEntry, target: Target, body: mpsc::Receiver<Bytes>) -> ExtractTask {
        // queued now, so reservations are granted in archive order
        let reservation = self.reservations.reserve_async(target.reserve_paths(&entry));
        let semaphore = Arc::clone(&self.semaphore);
        let extractor = Arc::clone(&self.extractor);
        tokio::spawn(async move {
            let release = reservation.await?;
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::Aborted("extraction cancelled".into()))?;
            tokio::task::spawn_blocking(move || {
                let _release = release;
                extractor.run(&entry, &target, body)
            })
            .await?
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn entry(path: &str, entry_type: EntryType) -> ReadEntry {
        ReadEntry::new(
            tar_header::Header {
                path: path.into(),
                entry_type,
                mode: Some(0o644),
                ..Default::default()
            },
            None,
            None,
        )
    }

    fn extractor(cwd: &Path, f: impl FnOnce(&mut UnpackOptions)) -> Extractor {
        let mut opts = UnpackOptions::new(cwd);
        f(&mut opts);
        Extractor::new(opts).unwrap()
    }

    fn check(ex: &Extractor, e: &ReadEntry) -> (Option<PathBuf>, Vec<String>) {
        let mut warnings = vec![];
        let target = ex.check_path(e, &mut warnings);
        (
            target.map(|t| t.absolute),
            warnings.into_iter().map(|w| w.message).collect(),
        )
    }

    #[test]
    fn test_strip_components() {
        assert_eq!(strip_components("a/b/c", 1).as_deref(), Some("b/c"));
        assert_eq!(strip_components("a/b/", 2).as_deref(), Some(""));
        assert_eq!(strip_components("a", 2), None);
    }

    #[test]
    fn test_invalid_owner_options() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Extractor::new(UnpackOptions {
            uid: Some(1),
            ..UnpackOptions::new(tmp.path())
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));

        let err = Extractor::new(UnpackOptions {
            uid: Some(1),
            gid: Some(1),
            preserve_owner: Some(true),
            ..UnpackOptions::new(tmp.path())
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_check_path() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = tmp.path();
        let ex = extractor(cwd, |_| {});

        let (target, warnings) = check(&ex, &entry("a/b.txt", EntryType::Regular));
        assert_eq!(target, Some(cwd.join("a/b.txt")));
        assert!(warnings.is_empty());

        let (target, warnings) = check(&ex, &entry("../evil", EntryType::Regular));
        assert_eq!(target, None);
        assert_eq!(warnings, vec!["path contains '..'"]);

        let (target, warnings) = check(&ex, &entry("/etc/passwd", EntryType::Regular));
        assert_eq!(target, Some(cwd.join("etc/passwd")));
        assert_eq!(warnings, vec!["stripping / from absolute path"]);

        // non-directories can't replace the extraction root
        assert_eq!(check(&ex, &entry("./", EntryType::Regular)).0, None);
        assert_eq!(
            check(&ex, &entry("./", EntryType::Directory)).0,
            Some(cwd.to_path_buf())
        );
    }

    #[test]
    fn test_check_path_options() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = tmp.path();

        let ex = extractor(cwd, |o| o.strip = 1);
        assert_eq!(
            check(&ex, &entry("pkg/lib/x", EntryType::Regular)).0,
            Some(cwd.join("lib/x"))
        );
        let mut link = entry("pkg/b", EntryType::Link);
        link.linkpath = "pkg/a".into();
        let mut warnings = vec![];
        let target = ex.check_path(&link, &mut warnings).unwrap();
        assert_eq!(target.link, Some(cwd.join("a")));

        let ex = extractor(cwd, |o| o.max_depth = 2);
        let (target, warnings) = check(&ex, &entry("a/b/c", EntryType::Regular));
        assert_eq!(target, None);
        assert_eq!(warnings, vec!["path excessively deep"]);

        let ex = extractor(cwd, |o| o.win32 = true);
        assert_eq!(
            check(&ex, &entry("what?", EntryType::Regular)).0,
            Some(cwd.join("what\u{f03f}"))
        );

        let ex = extractor(cwd, |o| o.preserve_paths = true);
        assert_eq!(
            check(&ex, &entry("/abs/file", EntryType::Regular)).0,
            Some(PathBuf::from("/abs/file"))
        );
    }

    #[test]
    fn test_owner_for() {
        let tmp = tempfile::tempdir().unwrap();
        let mut e = entry("f", EntryType::Regular);
        e.uid = Some(4242);
        e.gid = Some(4343);

        let ex = extractor(tmp.path(), |o| o.preserve_owner = Some(false));
        assert_eq!(ex.owner_for(&e), None);

        let ex = extractor(tmp.path(), |o| o.preserve_owner = Some(true));
        assert_eq!(ex.owner_for(&e), Some((4242, 4343)));

        let ex = extractor(tmp.path(), |o| {
            o.uid = Some(7);
            o.gid = Some(8);
        });
        assert_eq!(ex.owner_for(&e), Some((7, 8)));
    }

    #[test]
    fn test_force_chown_uses_process_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let mut e = entry("f", EntryType::Regular);
        e.uid = Some(4242);
        e.gid = Some(4343);

        let ex = extractor(tmp.path(), |o| {
            o.force_chown = true;
            o.preserve_owner = Some(false);
        });
        assert_eq!(
            ex.owner_for(&e),
            Some((getuid().as_raw(), getgid().as_raw()))
        );

        // a lone uid can't be combined with the archived gid
        let err = Extractor::new(UnpackOptions {
            uid: Some(7),
            ..UnpackOptions::new(tmp.path())
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_file_sink_requires_full_body() {
        let tmp = tempfile::tempdir().unwrap();
        let ex = extractor(tmp.path(), |o| o.preserve_owner = Some(false));
        let mut e = entry("f", EntryType::Regular);
        e.size = 4;
        e.mtime = Some(Timestamp::from_secs(1_000_000_000));

        let mut warnings = vec![];
        let target = ex.check_path(&e, &mut warnings).unwrap();
        let Action::File(mut sink) = ex.extract(&e, &target, &mut vec![]).unwrap() else {
            panic!("expected a file");
        };
        sink.write(b"abc").unwrap();
        let err = sink.finish().unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { remain: 1, .. }));

        let Action::File(mut sink) = ex.extract(&e, &target, &mut vec![]).unwrap() else {
            panic!("expected a file");
        };
        sink.write(b"abcd").unwrap();
        sink.finish().unwrap();
        let st = fs::metadata(tmp.path().join("f")).unwrap();
        assert_eq!(st.mtime(), 1_000_000_000);
        assert_eq!(fs::read(tmp.path().join("f")).unwrap(), b"abcd");
    }

    #[test]
    fn test_replaces_and_keeps() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("f"), b"old").unwrap();

        let ex = extractor(tmp.path(), |o| o.keep = true);
        let e = entry("f", EntryType::Regular);
        let target = ex.check_path(&e, &mut vec![]).unwrap();
        assert!(matches!(ex.extract(&e, &target, &mut vec![]), Ok(Action::Skip)));

        // an empty directory is replaced by a file
        let ex = extractor(tmp.path(), |_| {});
        let e = entry("d", EntryType::Regular);
        let target = ex.check_path(&e, &mut vec![]).unwrap();
        let Ok(Action::File(sink)) = ex.extract(&e, &target, &mut vec![]) else {
            panic!("expected a file");
        };
        sink.finish().unwrap();
        assert!(tmp.path().join("d").is_file());

        // and a file by a directory
        let e = entry("f", EntryType::Directory);
        let target = ex.check_path(&e, &mut vec![]).unwrap();
        let mut dirs = vec![];
        assert!(matches!(ex.extract(&e, &target, &mut dirs), Ok(Action::Done)));
        assert!(tmp.path().join("f").is_dir());
        assert_eq!(dirs, vec![tmp.path().join("f")]);
    }

    #[test]
    fn test_win32_unlink_renames_first() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), b"old").unwrap();
        let ex = extractor(tmp.path(), |o| o.win32 = true);
        ex.unlink(&tmp.path().join("f")).unwrap();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
