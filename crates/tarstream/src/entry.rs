//! Archive members as read from and written to a tar stream.

use std::{
    cmp,
    fs::Metadata,
    io::{self, Read, Write},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use tar_header::{EntryType, Header, Pax, Timestamp, HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, Result, Warning, WarningCode},
    options::PackOptions,
    paths::strip_absolute,
};

const BLOCK: u64 = HEADER_SIZE as u64;

/// Round `size` up to a whole number of blocks.
pub(crate) fn block_len(size: u64) -> u64 {
    size.div_ceil(BLOCK) * BLOCK
}

/// A member recognised by the parser.
///
/// All header and extended header values are already applied. The body is
/// delivered separately, as [`Event::Data`](crate::Event::Data).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadEntry {
    pub path: String,
    pub entry_type: EntryType,
    /// Permission bits only; file type bits are dropped.
    pub mode: Option<u32>,
    pub uid: Option<u64>,
    pub gid: Option<u64>,
    pub size: u64,
    pub mtime: Option<Timestamp>,
    pub atime: Option<Timestamp>,
    pub ctime: Option<Timestamp>,
    pub linkpath: String,
    pub uname: String,
    pub gname: String,
    pub devmaj: Option<u64>,
    pub devmin: Option<u64>,
    /// The extended header that applied to this member.
    pub extended: Option<Pax>,
    /// The global extended header in effect.
    pub global_extended: Option<Pax>,
    meta: bool,
    ignore: bool,
    remain: u64,
    block_remain: u64,
}

impl ReadEntry {
    /// Create an entry from a decoded header and the PAX context it was
    /// decoded with.
    #[must_use]
    pub fn new(header: Header, extended: Option<Pax>, global_extended: Option<Pax>) -> Self {
        Self {
            meta: header.entry_type.is_meta(),
            ignore: false,
            remain: header.size,
            block_remain: block_len(header.size),
            path: header.path,
            entry_type: header.entry_type,
            mode: header.mode.map(|m| m & 0o7777),
            uid: header.uid,
            gid: header.gid,
            size: header.size,
            mtime: header.mtime,
            atime: header.atime,
            ctime: header.ctime,
            linkpath: header.linkpath,
            uname: header.uname,
            gname: header.gname,
            devmaj: header.devmaj,
            devmin: header.devmin,
            extended,
            global_extended,
        }
    }

    /// Body bytes not yet delivered.
    #[must_use]
    pub fn remain(&self) -> u64 {
        self.remain
    }

    /// Body bytes not yet consumed, padding included.
    #[must_use]
    pub fn block_remain(&self) -> u64 {
        self.block_remain
    }

    /// Whether this member describes other members rather than a file.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.meta
    }

    /// Whether the parser is skipping this member.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.ignore
    }

    pub(crate) fn set_ignore(&mut self) {
        self.ignore = true;
    }

    /// Consume body bytes, padding included, returning the part that is
    /// file content.
    pub(crate) fn write<'a>(&mut self, chunk: &'a [u8]) -> Result<&'a [u8]> {
        let len = chunk.len() as u64;
        if len > self.block_remain {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("writing more data than expected to {}", self.path),
            )));
        }
        let data = cmp::min(self.remain, len) as usize;
        self.remain -= data as u64;
        self.block_remain -= len;
        Ok(&chunk[..data])
    }

    /// Extended attributes carried as `SCHILY.xattr.*` records.
    pub fn xattrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extended
            .iter()
            .flat_map(|pax| pax.extra.iter())
            .filter_map(|(k, v)| Some((k.strip_prefix("SCHILY.xattr.")?, v.as_str())))
    }

    /// A header carrying this entry's values.
    #[must_use]
    pub fn to_header(&self) -> Header {
        Header {
            path: self.path.clone(),
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            mtime: self.mtime,
            entry_type: self.entry_type,
            linkpath: self.linkpath.clone(),
            uname: self.uname.clone(),
            gname: self.gname.clone(),
            devmaj: self.devmaj,
            devmin: self.devmin,
            atime: self.atime,
            ctime: self.ctime,
            ..Default::default()
        }
    }
}

/// Permission bits as they should be archived.
///
/// Portable archives get owner read/write and no group/other write;
/// directories get search permission wherever they have read permission.
pub(crate) fn mode_fix(mode: u32, is_dir: bool, portable: bool) -> u32 {
    let mut mode = mode & 0o7777;
    if portable {
        mode = (mode | 0o600) & !0o022;
    }
    if is_dir {
        if mode & 0o400 != 0 {
            mode |= 0o100;
        }
        if mode & 0o040 != 0 {
            mode |= 0o010;
        }
        if mode & 0o004 != 0 {
            mode |= 0o001;
        }
    }
    mode
}

/// Join `prefix` and `path`, dropping a leading `./` from the path.
pub(crate) fn prefix_path(path: &str, prefix: Option<&str>) -> String {
    match prefix {
        None | Some("") => path.to_string(),
        Some(prefix) => {
            let path = path.strip_prefix("./").unwrap_or(path);
            let path = if path == "." { "" } else { path };
            format!("{}/{path}", prefix.trim_end_matches('/'))
        }
    }
}

/// What kind of member a filesystem object becomes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    File,
    Directory,
    Symlink(String),
    /// A hard link to an earlier member, with the path relative to `cwd`.
    Link(String),
}

/// A member about to be written to an archive.
///
/// Built from filesystem metadata when packing paths, or from a
/// [`ReadEntry`] when re-packing another archive.
#[derive(Clone, Debug)]
pub struct WriteEntry {
    /// The archive path, after root stripping and prefixing.
    pub path: String,
    /// Where the contents come from, for filesystem members.
    pub absolute: Option<PathBuf>,
    pub header: Header,
    pax: Option<Pax>,
}

impl WriteEntry {
    /// Prepare a member for a filesystem object.
    ///
    /// Warnings about the path (such as a stripped root) are passed to
    /// `warn`.
    pub(crate) fn from_metadata(
        path: &str,
        absolute: PathBuf,
        meta: &Metadata,
        kind: Kind,
        opts: &PackOptions,
        warn: &mut dyn FnMut(Warning),
    ) -> Self {
        let mut path = clean_path(path, opts.preserve_paths, warn);
        let is_dir = kind == Kind::Directory;
        if is_dir && !path.ends_with('/') {
            path.push('/');
        }

        let (entry_type, linkpath, size) = match kind {
            Kind::File => (EntryType::Regular, String::new(), meta.len()),
            Kind::Directory => (EntryType::Directory, String::new(), 0),
            Kind::Symlink(target) => (EntryType::Symlink, target, 0),
            Kind::Link(target) => (
                EntryType::Link,
                prefix_path(&target, opts.prefix.as_deref()),
                0,
            ),
        };

        let portable = opts.portable;
        let no_mtime = opts.no_mtime || (is_dir && portable);
        let mtime = if no_mtime {
            None
        } else {
            opts.mtime
                .or_else(|| Some(Timestamp::new(meta.mtime(), meta.mtime_nsec() as u32)))
        };
        let time = |secs: i64, nsec: i64| Some(Timestamp::new(secs, nsec as u32));

        let header = Header {
            path: prefix_path(&path, opts.prefix.as_deref()),
            mode: Some(mode_fix(meta.mode(), is_dir, portable)),
            uid: (!portable).then(|| u64::from(meta.uid())),
            gid: (!portable).then(|| u64::from(meta.gid())),
            size,
            mtime,
            entry_type,
            linkpath,
            uname: if portable {
                String::new()
            } else {
                user_name(meta.uid())
            },
            atime: if portable {
                None
            } else {
                time(meta.atime(), meta.atime_nsec())
            },
            ctime: if portable {
                None
            } else {
                time(meta.ctime(), meta.ctime_nsec())
            },
            ..Default::default()
        };

        let pax = (!opts.no_pax).then(|| Pax {
            path: Some(header.path.clone()),
            linkpath: Some(header.linkpath.clone()).filter(|l| !l.is_empty()),
            size: Some(header.size),
            mtime: header.mtime,
            atime: header.atime,
            ctime: header.ctime,
            uid: header.uid,
            gid: header.gid,
            uname: Some(header.uname.clone()).filter(|u| !u.is_empty()),
            dev: (!portable).then(|| meta.dev()),
            ino: (!portable).then(|| meta.ino()),
            nlink: (!portable).then(|| meta.nlink()),
            ..Default::default()
        });

        Self {
            path: header.path.clone(),
            absolute: Some(absolute),
            header,
            pax,
        }
    }

    /// Prepare a member that copies a parsed one, e.g. when concatenating
    /// archives.
    pub fn from_read_entry(
        entry: &ReadEntry,
        opts: &PackOptions,
        warn: &mut dyn FnMut(Warning),
    ) -> Self {
        let path = clean_path(&entry.path, opts.preserve_paths, warn);
        let portable = opts.portable;
        let is_dir = entry.entry_type.is_dir();

        let mut header = entry.to_header();
        header.path = prefix_path(&path, opts.prefix.as_deref());
        if entry.entry_type == EntryType::Link {
            header.linkpath = prefix_path(&entry.linkpath, opts.prefix.as_deref());
        }
        header.mode = entry.mode.map(|m| mode_fix(m, is_dir, portable));
        if portable {
            header.uid = None;
            header.gid = None;
            header.uname = String::new();
            header.gname = String::new();
            header.atime = None;
            header.ctime = None;
        }
        if opts.no_mtime || (is_dir && portable) {
            header.mtime = None;
        } else if let Some(mtime) = opts.mtime {
            header.mtime = Some(mtime);
        }

        let pax = (!opts.no_pax).then(|| {
            let mut pax = Pax::from_header(&header, false);
            if let Some(ex) = &entry.extended {
                pax.extra = ex.extra.clone();
            }
            pax
        });

        Self {
            path: header.path.clone(),
            absolute: None,
            header,
            pax,
        }
    }

    /// Body size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.header.size
    }

    /// Encode the header, preceded by an extended header if some value
    /// doesn't fit the block.
    pub fn header_blocks(&mut self) -> Vec<u8> {
        let block = self.header.to_block();
        let extra = self.pax.as_ref().is_some_and(|p| !p.extra.is_empty());
        let mut out = Vec::with_capacity(HEADER_SIZE * 3);
        if self.header.need_pax || extra {
            if let Some(pax) = self.pax.as_ref().and_then(Pax::encode) {
                out.extend_from_slice(&pax);
            }
        }
        out.extend_from_slice(&block);
        out
    }

    /// Copy exactly [`size`](Self::size) bytes from `src`, then the padding.
    ///
    /// # Errors
    ///
    /// Fails if `src` ends early or holds more data than expected.
    pub fn write_body<R: Read, W: Write>(
        &self,
        mut src: R,
        dst: &mut W,
        max_read_size: usize,
    ) -> Result<()> {
        let size = self.size();
        let mut buf = vec![0u8; buffer_len(size, max_read_size)];
        let mut remain = size;
        while remain > 0 {
            let want = cmp::min(remain, buf.len() as u64) as usize;
            let n = src.read(&mut buf[..want])?;
            if n == 0 {
                return Err(self.unexpected_eof(remain));
            }
            dst.write_all(&buf[..n])?;
            remain -= n as u64;
        }
        if src.read(&mut [0u8; 1])? != 0 {
            return Err(self.expected_eof());
        }
        dst.write_all(&padding(size))?;
        Ok(())
    }

    /// Async version of [`write_body`](Self::write_body).
    pub async fn write_body_async<R, W>(
        &self,
        mut src: R,
        dst: &mut W,
        max_read_size: usize,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let size = self.size();
        let mut buf = vec![0u8; buffer_len(size, max_read_size)];
        let mut remain = size;
        while remain > 0 {
            let want = cmp::min(remain, buf.len() as u64) as usize;
            let n = src.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(self.unexpected_eof(remain));
            }
            dst.write_all(&buf[..n]).await?;
            remain -= n as u64;
        }
        if src.read(&mut [0u8; 1]).await? != 0 {
            return Err(self.expected_eof());
        }
        dst.write_all(&padding(size)).await?;
        Ok(())
    }

    fn source(&self) -> PathBuf {
        self.absolute
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.path))
    }

    fn unexpected_eof(&self, remain: u64) -> Error {
        Error::UnexpectedEof {
            path: self.source(),
            remain,
        }
    }

    fn expected_eof(&self) -> Error {
        Error::ExpectedEof {
            path: self.source(),
        }
    }
}

fn buffer_len(size: u64, max_read_size: usize) -> usize {
    cmp::max(1, cmp::min(block_len(size), max_read_size as u64) as usize)
}

fn padding(size: u64) -> Vec<u8> {
    vec![0u8; (block_len(size) - size) as usize]
}

/// Strip absolute roots (unless preserving paths) and turn `""` into `./`.
fn clean_path(path: &str, preserve_paths: bool, warn: &mut dyn FnMut(Warning)) -> String {
    let mut path = path.to_string();
    if !preserve_paths {
        let (root, rest) = strip_absolute(&path);
        if !root.is_empty() {
            warn(
                Warning::new(
                    WarningCode::EntryInfo,
                    format!("stripping {root} from absolute path"),
                )
                .with_path(path.clone()),
            );
            path = rest.to_string();
        }
    }
    if path.is_empty() {
        path = "./".to_string();
    }
    path
}

/// The login name, if `uid` is the current user.
///
/// Best effort: this is `$USER`, there is no passwd lookup, and other users
/// get an empty name. Group names are never filled in.
fn user_name(uid: u32) -> String {
    if rustix::process::getuid().as_raw() != uid {
        return String::new();
    }
    std::env::var("USER").unwrap_or_default()
}

/// Path of a member relative to `cwd`, with `/` separators.
pub(crate) fn relative_to(path: &Path, cwd: &Path) -> String {
    match path.strip_prefix(cwd) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}
