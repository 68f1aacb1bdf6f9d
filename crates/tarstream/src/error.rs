//! Error and warning types.

use std::{fmt, io, path::PathBuf};

use tar_header::HeaderError;
use thiserror::Error;

/// Classification of a recoverable problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WarningCode {
    /// Informational, e.g. an absolute path had its root stripped.
    EntryInfo,
    /// A header block was unusable and skipped.
    EntryInvalid,
    /// The member kind can't be handled and was skipped.
    EntryUnsupported,
    /// A single member failed; processing continues with the next one.
    EntryError,
    /// The archive as a whole is damaged. Never recoverable when extracting.
    BadArchive,
}

impl WarningCode {
    /// The conventional code string, e.g. `TAR_ENTRY_INVALID`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WarningCode::EntryInfo => "TAR_ENTRY_INFO",
            WarningCode::EntryInvalid => "TAR_ENTRY_INVALID",
            WarningCode::EntryUnsupported => "TAR_ENTRY_UNSUPPORTED",
            WarningCode::EntryError => "TAR_ENTRY_ERROR",
            WarningCode::BadArchive => "TAR_BAD_ARCHIVE",
        }
    }
}

impl fmt::Display for WarningCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recoverable problem, reported as an event rather than an error unless
/// the operation runs in strict mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Warning {
    /// What kind of problem this is.
    pub code: WarningCode,
    /// Human readable description.
    pub message: String,
    /// The archive path of the member concerned, if any.
    pub path: Option<String>,
}

impl Warning {
    pub(crate) fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
        }
    }

    pub(crate) fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(path) = &self.path {
            write!(f, " ({path})")?;
        }
        Ok(())
    }
}

/// Errors returned by parsing, packing and unpacking.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a reader, writer or the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A header block couldn't be encoded or decoded.
    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    /// A warning promoted to an error by strict mode, or one that can't be
    /// recovered from.
    #[error("{0}")]
    Warning(Warning),

    /// The operation was aborted and can't continue.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The extraction directory is missing or not a directory.
    #[error("cannot extract into {}: {reason}", path.display())]
    Cwd {
        /// The configured extraction directory.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// A parent directory of a member turned out to be a symbolic link.
    #[error("cannot extract through symbolic link {}", symlink.display())]
    Symlink {
        /// The symbolic link that was found.
        symlink: PathBuf,
        /// The path being created.
        path: PathBuf,
    },

    /// Options that can't be combined.
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),

    /// A file ended before its recorded size was read.
    #[error("{}: encountered unexpected EOF ({remain} bytes missing)", path.display())]
    UnexpectedEof {
        /// The file being read.
        path: PathBuf,
        /// How many bytes were still expected.
        remain: u64,
    },

    /// A file had more data than its recorded size.
    #[error("{}: did not encounter expected EOF", path.display())]
    ExpectedEof {
        /// The file being read.
        path: PathBuf,
    },

    /// A blocking task panicked or was cancelled.
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether this error ends the whole operation rather than one member.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Warning(w) => w.code == WarningCode::BadArchive,
            Error::Aborted(_) | Error::Cwd { .. } | Error::Symlink { .. } | Error::Join(_) => true,
            Error::InvalidOptions(_) => true,
            _ => false,
        }
    }
}

impl From<Warning> for Error {
    fn from(warning: Warning) -> Self {
        Error::Warning(warning)
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
