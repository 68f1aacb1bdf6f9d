//! Streaming tar archives: parsing, packing and extraction.
//!
//! Archives are processed a chunk at a time, so nothing needs to be held in
//! memory beyond a single member's header and whatever the consumer hasn't
//! read yet.
//!
//! - [`Parser`] turns archive bytes (optionally gzip compressed, detected
//!   automatically) into [`Event`]s.
//! - [`PackSync`] and [`Pack`] walk the filesystem and write an archive.
//! - [`UnpackSync`] and [`Unpack`] write an archive's members to disk,
//!   refusing paths that would land outside the extraction directory.
//!
//! Header and PAX encoding live in the [`tar_header`] crate.
//!
//! ```no_run
//! use tarstream::{list, ParseOptions};
//!
//! let archive = std::fs::File::open("archive.tar").unwrap();
//! for entry in list(archive, ParseOptions::default()).unwrap() {
//!     println!("{} {}", entry.entry_type.name(), entry.path);
//! }
//! ```

mod entry;
mod error;
mod mkdir;
mod options;
mod pack;
mod parse;
mod paths;
pub mod reservations;
pub mod stream;
mod unpack;
pub mod winchars;

pub use tar_header;

pub use entry::{ReadEntry, WriteEntry};
pub use error::{Error, Result, Warning, WarningCode};
pub use options::{
    DirCache, EntryFilter, LinkCache, PackOptions, ParseOptions, PathFilter, ReaddirCache,
    SharedCache, StatCache, UnpackOptions, DEFAULT_JOBS, DEFAULT_MAX_DEPTH,
    DEFAULT_MAX_META_ENTRY_SIZE, DEFAULT_MAX_READ_SIZE,
};
pub use pack::{Pack, PackSync};
pub use parse::{list, list_async, read_all, AsyncEvents, EntryWithData, Event, Events, Parser};
pub use reservations::{PathReservations, Release};
pub use unpack::{Unpack, UnpackSummary, UnpackSync};
