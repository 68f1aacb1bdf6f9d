//! Push parser turning tar bytes into a stream of [`Event`]s.
//!
//! The [`Parser`] is fed arbitrary chunks with [`write`](Parser::write) and
//! queues events in archive order. Gzip input is recognised by its magic
//! bytes and decompressed transparently. Extended headers (PAX `x`/`g`) and
//! GNU long names/links (`L`/`K`) are folded into the member that follows
//! them, so consumers only see resolved entries.
//!
//! For a blocking [`Read`] source, iterate over [`Events`]:
//!
//! ```
//! use tarstream::{Event, Events, ParseOptions};
//!
//! let mut builder = tar::Builder::new(Vec::new());
//! let mut header = tar::Header::new_ustar();
//! header.set_size(5);
//! header.set_cksum();
//! builder.append_data(&mut header, "a.txt", &b"hello"[..]).unwrap();
//! let archive = builder.into_inner().unwrap();
//!
//! for event in Events::new(&archive[..], ParseOptions::default()) {
//!     if let Event::Entry(entry) = event.unwrap() {
//!         assert_eq!(entry.path, "a.txt");
//!     }
//! }
//! ```
//!
//! # Failures
//!
//! Damaged headers and similar recoverable problems become
//! [`Event::Warning`]s, or errors when [`ParseOptions::strict`] is set.
//! An archive with no usable member at all, or one that ends in the middle
//! of a body, produces a `TAR_BAD_ARCHIVE` warning when the input ends.

use std::{
    cmp, fmt,
    io::{self, Read, Write},
    mem,
};

use bytes::Bytes;
use flate2::write::GzDecoder;
use log::{trace, warn};
use tar_header::{truncate_null, EntryType, Header, Pax, HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    entry::ReadEntry,
    error::{Error, Result, Warning, WarningCode},
    options::ParseOptions,
    stream::BufferedStream,
};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Something the parser found in the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A member whose body follows as [`Data`](Event::Data) events.
    Entry(ReadEntry),
    /// Body bytes of the current member, padding removed.
    Data(Bytes),
    /// The current member's body is complete.
    EntryEnd,
    /// A member that was skipped: filtered out, of an unsupported kind, or
    /// an oversized metadata member. Its body is consumed silently.
    Ignored(ReadEntry),
    /// A metadata member was read and applied.
    Meta {
        /// Which kind of metadata.
        entry_type: EntryType,
        /// Its raw body.
        body: Bytes,
    },
    /// A recoverable problem.
    Warning(Warning),
    /// The input ended. Nothing follows.
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Begin,
    Header,
    Body,
    Meta,
    Ignore,
    Eof,
    Aborted,
}

enum Input {
    /// Too few bytes seen to tell whether this is gzip.
    Undecided(Vec<u8>),
    Plain,
    Gzip(Box<GzDecoder<Vec<u8>>>),
}

/// Incremental tar parser.
pub struct Parser {
    opts: ParseOptions,
    state: State,
    input: Input,
    /// A header block split across writes.
    partial: Vec<u8>,
    entry: Option<ReadEntry>,
    meta: Vec<u8>,
    ex: Option<Pax>,
    gex: Option<Pax>,
    saw_null: bool,
    saw_valid_entry: bool,
    ended: bool,
    position: u64,
    events: BufferedStream<Event>,
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parser")
            .field("state", &self.state)
            .field("position", &self.position)
            .field("gzip", &matches!(self.input, Input::Gzip(_)))
            .field("queued", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(ParseOptions::default())
    }
}

impl Parser {
    /// Create a parser.
    #[must_use]
    pub fn new(opts: ParseOptions) -> Self {
        Self {
            opts,
            state: State::Begin,
            input: Input::Undecided(Vec::new()),
            partial: Vec::new(),
            entry: None,
            meta: Vec::new(),
            ex: None,
            gex: None,
            saw_null: false,
            saw_valid_entry: false,
            ended: false,
            position: 0,
            events: BufferedStream::new(),
        }
    }

    /// Feed bytes to the parser.
    ///
    /// Returns `false` when events are waiting to be drained with
    /// [`next_event`](Self::next_event) (or the parser is paused), meaning
    /// the caller should drain before writing more.
    ///
    /// # Errors
    ///
    /// Fails on gzip corruption, after an abort, and on any warning in
    /// strict mode.
    pub fn write(&mut self, chunk: &[u8]) -> Result<bool> {
        if self.state == State::Aborted {
            return Err(Error::Aborted("write after abort".into()));
        }
        if self.ended {
            return Err(Error::Io(io::Error::other("write after end")));
        }

        if let Input::Undecided(pending) = &mut self.input {
            pending.extend_from_slice(chunk);
            if pending.len() < GZIP_MAGIC.len() {
                return Ok(self.events.writable());
            }
            let pending = mem::take(pending);
            if pending[..2] == GZIP_MAGIC {
                trace!("gzip input detected");
                self.input = Input::Gzip(Box::new(GzDecoder::new(Vec::new())));
            } else {
                self.input = Input::Plain;
            }
            self.feed(&pending)?;
        } else {
            self.feed(chunk)?;
        }
        Ok(self.events.writable())
    }

    /// Signal the end of input, flushing the decompressor and reporting a
    /// truncated or unrecognisable archive.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn end(&mut self) -> Result<()> {
        if self.state == State::Aborted {
            return Err(Error::Aborted("end after abort".into()));
        }
        if self.ended {
            return Ok(());
        }

        match mem::replace(&mut self.input, Input::Plain) {
            Input::Undecided(pending) => self.consume(&pending)?,
            Input::Gzip(mut decoder) => {
                decoder.try_finish()?;
                let out = mem::take(decoder.get_mut());
                self.consume(&out)?;
            }
            Input::Plain => {}
        }
        self.ended = true;

        if let Some(entry) = self.entry.take() {
            let message = format!(
                "Truncated input (needed {} more bytes, only {} available)",
                entry.block_remain(),
                self.partial.len()
            );
            self.warn(Warning::new(WarningCode::BadArchive, message).with_path(entry.path))?;
            if self.state == State::Body {
                self.events.push(Event::EntryEnd);
            }
            self.state = State::Header;
        }

        if self.state == State::Begin || (!self.saw_valid_entry && self.state != State::Eof) {
            self.warn(Warning::new(
                WarningCode::BadArchive,
                "Unrecognized archive format",
            ))?;
        }

        trace!("end of input at {}", self.position);
        self.events.push(Event::End);
        self.events.end();
        Ok(())
    }

    /// Stop parsing for good.
    ///
    /// Returns the error describing the abort so callers can propagate it.
    pub fn abort(&mut self, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        warn!("parser aborted: {reason}");
        self.state = State::Aborted;
        self.entry = None;
        Error::Aborted(reason)
    }

    /// Take the next queued event.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pull()
    }

    /// Stop handing out events until [`resume`](Self::resume).
    pub fn pause(&mut self) {
        self.events.pause();
    }

    /// Resume handing out events.
    pub fn resume(&mut self) {
        self.events.resume();
    }

    /// Whether [`end`](Self::end) was called and every event was taken.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.events.is_finished()
    }

    fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        let inflated = match &mut self.input {
            Input::Gzip(decoder) => {
                decoder.write_all(chunk)?;
                Some(mem::take(decoder.get_mut()))
            }
            _ => None,
        };
        match inflated {
            Some(data) => self.consume(&data),
            None => self.consume(chunk),
        }
    }

    fn consume(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.state {
                State::Eof | State::Aborted => {
                    // trailing data after the end marker is ignored
                    self.position += data.len() as u64;
                    return Ok(());
                }
                State::Body | State::Meta | State::Ignore => {
                    let Some(entry) = &self.entry else {
                        self.state = State::Header;
                        continue;
                    };
                    let n = cmp::min(entry.block_remain(), data.len() as u64) as usize;
                    let (chunk, rest) = data.split_at(n);
                    self.consume_body(chunk)?;
                    data = rest;
                }
                State::Begin | State::Header => {
                    if self.partial.is_empty() && data.len() >= HEADER_SIZE {
                        let (block, rest) = data.split_at(HEADER_SIZE);
                        self.consume_header(block)?;
                        data = rest;
                    } else {
                        let n = cmp::min(HEADER_SIZE - self.partial.len(), data.len());
                        self.partial.extend_from_slice(&data[..n]);
                        data = &data[n..];
                        if self.partial.len() == HEADER_SIZE {
                            let block = mem::take(&mut self.partial);
                            self.consume_header(&block)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn consume_header(&mut self, block: &[u8]) -> Result<()> {
        let offset = self.position;
        self.position += HEADER_SIZE as u64;
        if self.state == State::Begin {
            self.state = State::Header;
        }

        // metadata members describe the next member; their own header
        // values must not be overridden by pending extended headers
        let decoded = if EntryType::from_byte(block[156]).is_meta() {
            Header::decode(block, None, None)
        } else {
            Header::decode(block, self.ex.as_ref(), self.gex.as_ref())
        };
        let header = match decoded {
            Ok(header) => header,
            Err(e) => {
                return self.warn(Warning::new(WarningCode::EntryInvalid, e.to_string()));
            }
        };

        if header.null_block {
            if self.saw_null {
                trace!("end of archive marker at {offset}");
                self.state = State::Eof;
            } else {
                self.saw_null = true;
            }
            return Ok(());
        }
        self.saw_null = false;

        let invalid = if !header.cksum_valid {
            Some("checksum failure")
        } else if header.path.is_empty() {
            Some("path is required")
        } else if header.entry_type.is_link() && header.linkpath.is_empty() {
            Some("linkpath required")
        } else if !header.entry_type.is_link() && !header.linkpath.is_empty() {
            Some("linkpath forbidden")
        } else {
            None
        };
        if let Some(message) = invalid {
            return self
                .warn(Warning::new(WarningCode::EntryInvalid, message).with_path(header.path));
        }

        trace!(
            "{} {:?} ({} bytes) at {offset}",
            header.entry_type,
            header.path,
            header.size
        );
        self.saw_valid_entry = true;

        let mut entry = if header.entry_type.is_meta() {
            ReadEntry::new(header, None, None)
        } else {
            ReadEntry::new(header, self.ex.take(), self.gex.clone())
        };

        if entry.is_meta() {
            if entry.size > self.opts.max_meta_entry_size {
                entry.set_ignore();
                self.events.push(Event::Ignored(entry.clone()));
                self.state = State::Ignore;
            } else {
                self.meta.clear();
                self.state = State::Meta;
            }
        } else {
            let filtered = self
                .opts
                .filter
                .as_ref()
                .is_some_and(|filter| !filter(&entry.path, &entry));
            if filtered || !entry.entry_type.is_supported() {
                entry.set_ignore();
                self.events.push(Event::Ignored(entry.clone()));
                self.state = State::Ignore;
            } else {
                self.events.push(Event::Entry(entry.clone()));
                self.state = State::Body;
            }
        }

        let done = entry.block_remain() == 0;
        self.entry = Some(entry);
        if done {
            self.finish_entry()?;
        }
        Ok(())
    }

    fn consume_body(&mut self, chunk: &[u8]) -> Result<()> {
        self.position += chunk.len() as u64;
        let Some(entry) = self.entry.as_mut() else {
            return Ok(());
        };
        let data = entry.write(chunk)?;
        let done = entry.block_remain() == 0;
        match self.state {
            State::Body if !data.is_empty() => {
                self.events.push(Event::Data(Bytes::copy_from_slice(data)));
            }
            State::Meta => self.meta.extend_from_slice(data),
            _ => {}
        }
        if done {
            self.finish_entry()?;
        }
        Ok(())
    }

    fn finish_entry(&mut self) -> Result<()> {
        let entry = self.entry.take();
        match (self.state, entry) {
            (State::Body, _) => {
                self.events.push(Event::EntryEnd);
            }
            (State::Meta, Some(entry)) => self.emit_meta(entry.entry_type),
            _ => {}
        }
        self.state = State::Header;
        Ok(())
    }

    fn emit_meta(&mut self, entry_type: EntryType) {
        let body = mem::take(&mut self.meta);
        let text = || String::from_utf8_lossy(truncate_null(&body)).into_owned();
        match entry_type {
            EntryType::XHeader | EntryType::OldXHeader => {
                self.ex = Some(Pax::parse(&body, self.ex.as_ref(), false));
            }
            EntryType::XGlobalHeader => {
                self.gex = Some(Pax::parse(&body, self.gex.as_ref(), true));
            }
            EntryType::GnuLongName | EntryType::OldGnuLongName => {
                self.ex.get_or_insert_with(Pax::default).path = Some(text());
            }
            EntryType::GnuLongLink => {
                self.ex.get_or_insert_with(Pax::default).linkpath = Some(text());
            }
            _ => {}
        }
        self.events.push(Event::Meta {
            entry_type,
            body: Bytes::from(body),
        });
    }

    fn warn(&mut self, warning: Warning) -> Result<()> {
        warn!("{warning}");
        if self.opts.strict {
            return Err(Error::Warning(warning));
        }
        self.events.push(Event::Warning(warning));
        Ok(())
    }
}

/// Events parsed from a blocking reader.
#[derive(Debug)]
pub struct Events<R> {
    reader: R,
    parser: Parser,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> Events<R> {
    /// Parse everything `reader` produces.
    pub fn new(reader: R, opts: ParseOptions) -> Self {
        Self {
            reader,
            parser: Parser::new(opts),
            buf: vec![0u8; READ_BUFFER_SIZE],
            done: false,
        }
    }
}

impl<R: Read> Iterator for Events<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.parser.next_event() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }
            let result = match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    self.parser.end()
                }
                Ok(n) => self.parser.write(&self.buf[..n]).map(|_| ()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Events parsed from an async reader.
#[derive(Debug)]
pub struct AsyncEvents<R> {
    reader: R,
    parser: Parser,
    buf: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> AsyncEvents<R> {
    /// Parse everything `reader` produces.
    pub fn new(reader: R, opts: ParseOptions) -> Self {
        Self {
            reader,
            parser: Parser::new(opts),
            buf: vec![0u8; READ_BUFFER_SIZE],
            done: false,
        }
    }

    /// The next event, or `None` once [`Event::End`] has been returned.
    pub async fn next(&mut self) -> Option<Result<Event>> {
        loop {
            if let Some(event) = self.parser.next_event() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }
            let result = match self.reader.read(&mut self.buf).await {
                Ok(0) => {
                    self.done = true;
                    self.parser.end()
                }
                Ok(n) => self.parser.write(&self.buf[..n]).map(|_| ()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// A member and its complete body.
pub type EntryWithData = (ReadEntry, Vec<u8>);

fn collect_event(
    event: Event,
    out: &mut Vec<EntryWithData>,
    with_data: bool,
    warnings: &mut Vec<Warning>,
) {
    match event {
        Event::Entry(entry) => out.push((entry, Vec::new())),
        Event::Data(data) if with_data => {
            if let Some((_, body)) = out.last_mut() {
                body.extend_from_slice(&data);
            }
        }
        Event::Warning(w) => warnings.push(w),
        _ => {}
    }
}

/// List the members of an archive.
///
/// # Errors
///
/// Fails on read errors and, in strict mode, on any warning.
pub fn list<R: Read>(reader: R, opts: ParseOptions) -> Result<Vec<ReadEntry>> {
    let (entries, _) = read_all(reader, opts, false)?;
    Ok(entries.into_iter().map(|(entry, _)| entry).collect())
}

/// Async version of [`list`].
pub async fn list_async<R: AsyncRead + Unpin>(
    reader: R,
    opts: ParseOptions,
) -> Result<Vec<ReadEntry>> {
    let mut events = AsyncEvents::new(reader, opts);
    let mut out = Vec::new();
    let mut warnings = Vec::new();
    while let Some(event) = events.next().await {
        collect_event(event?, &mut out, false, &mut warnings);
    }
    Ok(out.into_iter().map(|(entry, _)| entry).collect())
}

/// Read every member with its body, along with any warnings.
///
/// # Errors
///
/// See [`list`].
pub fn read_all<R: Read>(
    reader: R,
    opts: ParseOptions,
    with_data: bool,
) -> Result<(Vec<EntryWithData>, Vec<Warning>)> {
    let mut out = Vec::new();
    let mut warnings = Vec::new();
    for event in Events::new(reader, opts) {
        collect_event(event?, &mut out, with_data, &mut warnings);
    }
    Ok((out, warnings))
}

#[cfg(test)]
mod tests;
