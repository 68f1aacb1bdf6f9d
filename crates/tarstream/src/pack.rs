//! Writing filesystem trees and parsed members as a tar stream.
//!
//! Paths are archived relative to [`PackOptions::cwd`]. Directories are
//! descended into, with their children queued behind everything already
//! added, so the archive lists a directory before its contents. Files with
//! several links are archived once; later names become hard link members.
//!
//! [`PackSync`] does everything on the calling thread. [`Pack`] keeps up to
//! [`PackOptions::jobs`] stat/readdir/open operations in flight while
//! writing members strictly in queue order.
//!
//! ```no_run
//! use tarstream::{PackOptions, PackSync};
//!
//! let file = std::fs::File::create("out.tar").unwrap();
//! let mut pack = PackSync::new(file, PackOptions::new("/srv/data")).unwrap();
//! pack.add("www").unwrap();
//! pack.finish().unwrap();
//! ```

use std::{
    collections::VecDeque,
    ffi::OsString,
    fmt,
    fs::{self, File, Metadata},
    io::{self, Write},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use async_compression::tokio::write::GzipEncoder;
use flate2::{write::GzEncoder, Compression};
use log::{debug, warn};
use tar_header::{EntryType, HEADER_SIZE};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};

use crate::{
    entry::{relative_to, Kind, ReadEntry, WriteEntry},
    error::{Error, Result, Warning, WarningCode},
    options::PackOptions,
    paths::normalize,
};

const END_OF_ARCHIVE: [u8; HEADER_SIZE * 2] = [0; HEADER_SIZE * 2];

/// A filesystem object that has been looked at but not yet written.
#[derive(Debug)]
struct Prepared {
    path: String,
    absolute: PathBuf,
    meta: Metadata,
    /// `None` for sockets, devices and other kinds we don't archive.
    kind: Option<Kind>,
    /// Archive paths of the directory's children, if it is to be descended.
    children: Option<Vec<String>>,
}

fn resolve(cwd: &Path, path: &str) -> PathBuf {
    normalize(&cwd.join(path))
}

fn absolute_cwd(opts: &mut PackOptions) -> Result<()> {
    opts.cwd = normalize(&std::path::absolute(&opts.cwd)?);
    Ok(())
}

fn kind_of(meta: &Metadata, link_target: impl FnOnce() -> io::Result<PathBuf>) -> Result<Option<Kind>> {
    let ft = meta.file_type();
    Ok(if ft.is_file() {
        Some(Kind::File)
    } else if ft.is_dir() {
        Some(Kind::Directory)
    } else if ft.is_symlink() {
        Some(Kind::Symlink(
            link_target()?.to_string_lossy().into_owned(),
        ))
    } else {
        None
    })
}

/// Archive paths for the entries of directory `parent`.
fn child_paths(parent: &str, names: &[OsString]) -> Vec<String> {
    let base = match parent {
        "" | "." | "./" => String::new(),
        _ => format!("{}/", parent.trim_end_matches('/')),
    };
    names
        .iter()
        .map(|name| format!("{base}{}", name.to_string_lossy()))
        .collect()
}

fn is_filtered(opts: &PackOptions, path: &str, meta: &Metadata) -> bool {
    let filtered = opts.filter.as_ref().is_some_and(|f| !f(path, meta));
    if filtered {
        debug!("skipping filtered path {path}");
    }
    filtered
}

fn prepare_sync(path: &str, opts: &PackOptions) -> Result<Option<Prepared>> {
    let absolute = resolve(&opts.cwd, path);
    let meta = match opts.stat_cache.get(&absolute) {
        Some(meta) => meta,
        None => {
            let meta = if opts.follow {
                fs::metadata(&absolute)?
            } else {
                fs::symlink_metadata(&absolute)?
            };
            opts.stat_cache.insert(absolute.clone(), meta.clone());
            meta
        }
    };
    if is_filtered(opts, path, &meta) {
        return Ok(None);
    }

    let kind = kind_of(&meta, || fs::read_link(&absolute))?;
    let children = if kind == Some(Kind::Directory) && !opts.no_dir_recurse {
        let names = match opts.readdir_cache.get(&absolute) {
            Some(names) => names,
            None => {
                let mut names = fs::read_dir(&absolute)?
                    .map(|e| e.map(|e| e.file_name()))
                    .collect::<io::Result<Vec<_>>>()?;
                names.sort();
                opts.readdir_cache.insert(absolute.clone(), names.clone());
                names
            }
        };
        Some(child_paths(path, &names))
    } else {
        None
    };

    Ok(Some(Prepared {
        path: path.to_string(),
        absolute,
        meta,
        kind,
        children,
    }))
}

async fn prepare_async(
    path: String,
    opts: PackOptions,
) -> Result<Option<(Prepared, Option<tokio::fs::File>)>> {
    let absolute = resolve(&opts.cwd, &path);
    let meta = match opts.stat_cache.get(&absolute) {
        Some(meta) => meta,
        None => {
            let meta = if opts.follow {
                tokio::fs::metadata(&absolute).await?
            } else {
                tokio::fs::symlink_metadata(&absolute).await?
            };
            opts.stat_cache.insert(absolute.clone(), meta.clone());
            meta
        }
    };
    if is_filtered(&opts, &path, &meta) {
        return Ok(None);
    }

    let target = if meta.file_type().is_symlink() {
        Some(tokio::fs::read_link(&absolute).await?)
    } else {
        None
    };
    let kind = kind_of(&meta, || Ok(target.unwrap_or_default()))?;

    let children = if kind == Some(Kind::Directory) && !opts.no_dir_recurse {
        let names = match opts.readdir_cache.get(&absolute) {
            Some(names) => names,
            None => {
                let mut names = Vec::new();
                let mut dir = tokio::fs::read_dir(&absolute).await?;
                while let Some(entry) = dir.next_entry().await? {
                    names.push(entry.file_name());
                }
                names.sort();
                opts.readdir_cache.insert(absolute.clone(), names.clone());
                names
            }
        };
        Some(child_paths(&path, &names))
    } else {
        None
    };

    let file = if kind == Some(Kind::File) {
        Some(tokio::fs::File::open(&absolute).await?)
    } else {
        None
    };

    Ok(Some((
        Prepared {
            path,
            absolute,
            meta,
            kind,
            children,
        },
        file,
    )))
}

/// Build the member for `prepared` once it is first in line.
///
/// The hard link decision is made here rather than while preparing, so the
/// first name in archive order is the one that carries the contents.
fn entry_for(
    prepared: &Prepared,
    opts: &PackOptions,
    warnings: &mut Vec<Warning>,
) -> Option<WriteEntry> {
    let Some(kind) = prepared.kind.clone() else {
        warnings.push(
            Warning::new(WarningCode::EntryUnsupported, "unsupported file type")
                .with_path(prepared.path.clone()),
        );
        return None;
    };

    let meta = &prepared.meta;
    let kind = if kind == Kind::File && meta.nlink() > 1 {
        let key = (meta.dev(), meta.ino());
        match opts.link_cache.get(&key) {
            Some(first) if first.starts_with(&opts.cwd) => {
                Kind::Link(relative_to(&first, &opts.cwd))
            }
            _ => {
                opts.link_cache.insert(key, prepared.absolute.clone());
                Kind::File
            }
        }
    } else {
        kind
    };

    Some(WriteEntry::from_metadata(
        &prepared.path,
        prepared.absolute.clone(),
        meta,
        kind,
        opts,
        &mut |w| warnings.push(w),
    ))
}

fn record(warnings: &mut Vec<Warning>, strict: bool, warning: Warning) -> Result<()> {
    warn!("{warning}");
    if strict {
        return Err(Error::Warning(warning));
    }
    warnings.push(warning);
    Ok(())
}

enum Output<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> Write for Output<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::Plain(w) => w.write(buf),
            Output::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Plain(w) => w.flush(),
            Output::Gzip(w) => w.flush(),
        }
    }
}

/// Blocking tar writer.
pub struct PackSync<W: Write> {
    opts: PackOptions,
    out: Output<W>,
    queue: VecDeque<String>,
    warnings: Vec<Warning>,
}

impl<W: Write> fmt::Debug for PackSync<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackSync")
            .field("opts", &self.opts)
            .field("warnings", &self.warnings)
            .finish_non_exhaustive()
    }
}

impl<W: Write> PackSync<W> {
    /// Start an archive on `writer`.
    ///
    /// # Errors
    ///
    /// Fails if the current directory is needed to resolve a relative `cwd`
    /// and can't be read.
    pub fn new(writer: W, mut opts: PackOptions) -> Result<Self> {
        absolute_cwd(&mut opts)?;
        let out = if opts.gzip {
            Output::Gzip(GzEncoder::new(writer, Compression::default()))
        } else {
            Output::Plain(writer)
        };
        Ok(Self {
            opts,
            out,
            queue: VecDeque::new(),
            warnings: Vec::new(),
        })
    }

    /// Archive `path`, relative to `cwd`, and everything below it.
    ///
    /// # Errors
    ///
    /// Fails on filesystem and write errors, on a file changing size while
    /// it is read, and on any warning in strict mode.
    pub fn add(&mut self, path: impl Into<String>) -> Result<()> {
        self.queue.push_back(path.into());
        while let Some(path) = self.queue.pop_front() {
            if let Some(prepared) = prepare_sync(&path, &self.opts)? {
                self.emit(prepared)?;
            }
        }
        Ok(())
    }

    fn emit(&mut self, prepared: Prepared) -> Result<()> {
        let mut warnings = Vec::new();
        let entry = entry_for(&prepared, &self.opts, &mut warnings);
        for w in warnings {
            record(&mut self.warnings, self.opts.strict, w)?;
        }
        let Some(mut entry) = entry else {
            return Ok(());
        };

        debug!("packing {} as {}", prepared.absolute.display(), entry.path);
        self.out.write_all(&entry.header_blocks())?;
        if entry.header.entry_type == EntryType::Regular {
            let file = File::open(&prepared.absolute)?;
            entry.write_body(file, &mut self.out, self.opts.max_read_size)?;
        }
        self.queue.extend(prepared.children.unwrap_or_default());
        Ok(())
    }

    /// Copy a member from another archive, with `body` as its contents.
    ///
    /// # Errors
    ///
    /// Fails if `body` doesn't hold exactly `entry.size` bytes, on write
    /// errors, and on any warning in strict mode.
    pub fn add_entry<R: io::Read>(&mut self, entry: &ReadEntry, body: R) -> Result<()> {
        let mut warnings = Vec::new();
        let mut write = WriteEntry::from_read_entry(entry, &self.opts, &mut |w| warnings.push(w));
        for w in warnings {
            record(&mut self.warnings, self.opts.strict, w)?;
        }
        debug!("packing archive member {}", write.path);
        self.out.write_all(&write.header_blocks())?;
        write.write_body(body, &mut self.out, self.opts.max_read_size)
    }

    /// Warnings raised so far.
    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Write the end-of-archive marker and return the writer.
    ///
    /// # Errors
    ///
    /// Fails on write errors.
    pub fn finish(mut self) -> Result<W> {
        self.out.write_all(&END_OF_ARCHIVE)?;
        let writer = match self.out {
            Output::Plain(w) => w,
            Output::Gzip(w) => w.finish()?,
        };
        Ok(writer)
    }
}

enum AsyncOutput<W> {
    Plain(W),
    Gzip(GzipEncoder<W>),
}

impl<W: AsyncWrite + Unpin> AsyncWrite for AsyncOutput<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AsyncOutput::Plain(w) => Pin::new(w).poll_write(cx, buf),
            AsyncOutput::Gzip(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncOutput::Plain(w) => Pin::new(w).poll_flush(cx),
            AsyncOutput::Gzip(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncOutput::Plain(w) => Pin::new(w).poll_shutdown(cx),
            AsyncOutput::Gzip(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

type PrepareTask = JoinHandle<Result<Option<(Prepared, Option<tokio::fs::File>)>>>;

/// Async tar writer with bounded concurrent preparation.
///
/// [`add`](Self::add) only queues a path; the work happens in
/// [`add_entry`](Self::add_entry) (which first writes every queued path, to
/// keep the order) and [`finish`](Self::finish). Must be used inside a
/// Tokio runtime.
pub struct Pack<W> {
    opts: PackOptions,
    out: AsyncOutput<W>,
    queue: VecDeque<String>,
    warnings: Vec<Warning>,
}

impl<W> fmt::Debug for Pack<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pack")
            .field("opts", &self.opts)
            .field("queued", &self.queue.len())
            .field("warnings", &self.warnings)
            .finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin> Pack<W> {
    /// Start an archive on `writer`.
    ///
    /// # Errors
    ///
    /// See [`PackSync::new`].
    pub fn new(writer: W, mut opts: PackOptions) -> Result<Self> {
        absolute_cwd(&mut opts)?;
        let out = if opts.gzip {
            AsyncOutput::Gzip(GzipEncoder::new(writer))
        } else {
            AsyncOutput::Plain(writer)
        };
        Ok(Self {
            opts,
            out,
            queue: VecDeque::new(),
            warnings: Vec::new(),
        })
    }

    /// Queue `path`, relative to `cwd`, and everything below it.
    pub fn add(&mut self, path: impl Into<String>) {
        self.queue.push_back(path.into());
    }

    /// Write every queued path.
    async fn run(&mut self) -> Result<()> {
        let jobs = self.opts.jobs.max(1);
        let mut pending: VecDeque<PrepareTask> = VecDeque::new();
        loop {
            while pending.len() < jobs {
                let Some(path) = self.queue.pop_front() else {
                    break;
                };
                pending.push_back(tokio::spawn(prepare_async(path, self.opts.clone())));
            }
            let Some(head) = pending.pop_front() else {
                return Ok(());
            };

            let result = match head.await {
                Ok(Ok(Some((prepared, file)))) => self.emit(prepared, file).await,
                Ok(Ok(None)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                for task in &pending {
                    task.abort();
                }
                return Err(e);
            }
        }
    }

    async fn emit(&mut self, prepared: Prepared, file: Option<tokio::fs::File>) -> Result<()> {
        let mut warnings = Vec::new();
        let entry = entry_for(&prepared, &self.opts, &mut warnings);
        for w in warnings {
            record(&mut self.warnings, self.opts.strict, w)?;
        }
        let Some(mut entry) = entry else {
            return Ok(());
        };

        debug!("packing {} as {}", prepared.absolute.display(), entry.path);
        self.out.write_all(&entry.header_blocks()).await?;
        if entry.header.entry_type == EntryType::Regular {
            let file = match file {
                Some(file) => file,
                None => tokio::fs::File::open(&prepared.absolute).await?,
            };
            entry
                .write_body_async(file, &mut self.out, self.opts.max_read_size)
                .await?;
        }
        self.queue.extend(prepared.children.unwrap_or_default());
        Ok(())
    }

    /// Copy a member from another archive, with `body` as its contents.
    ///
    /// # Errors
    ///
    /// See [`PackSync::add_entry`].
    pub async fn add_entry<R: AsyncRead + Unpin>(&mut self, entry: &ReadEntry, body: R) -> Result<()> {
        self.run().await?;
        let mut warnings = Vec::new();
        let mut write = WriteEntry::from_read_entry(entry, &self.opts, &mut |w| warnings.push(w));
        for w in warnings {
            record(&mut self.warnings, self.opts.strict, w)?;
        }
        debug!("packing archive member {}", write.path);
        self.out.write_all(&write.header_blocks()).await?;
        write
            .write_body_async(body, &mut self.out, self.opts.max_read_size)
            .await
    }

    /// Warnings raised so far.
    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Write every queued path and the end-of-archive marker, then return
    /// the writer.
    ///
    /// # Errors
    ///
    /// See [`PackSync::add`].
    pub async fn finish(mut self) -> Result<W> {
        self.run().await?;
        self.out.write_all(&END_OF_ARCHIVE).await?;
        let writer = match self.out {
            AsyncOutput::Plain(mut w) => {
                w.flush().await?;
                w
            }
            AsyncOutput::Gzip(mut w) => {
                w.shutdown().await?;
                w.into_inner()
            }
        };
        Ok(writer)
    }
}
