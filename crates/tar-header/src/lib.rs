//! Zerocopy-based tar header codec.
//!
//! This crate encodes and decodes the 512-byte blocks that make up a tar
//! archive, along with the PAX extended header records used to carry values
//! that don't fit the fixed-width fields. It supports the POSIX.1-1988,
//! UStar (POSIX.1-2001) and GNU flavours closely enough to read what common
//! tar implementations write, and always writes UStar.
//!
//! # Header Field Layout
//!
//! | Offset | Size | Field     | Description                              |
//! |--------|------|-----------|------------------------------------------|
//! | 0      | 100  | name      | File path (null-terminated if < 100)     |
//! | 100    | 8    | mode      | File mode in octal ASCII                 |
//! | 108    | 8    | uid       | Owner user ID in octal ASCII             |
//! | 116    | 8    | gid       | Owner group ID in octal ASCII            |
//! | 124    | 12   | size      | File size in octal ASCII                 |
//! | 136    | 12   | mtime     | Modification time (Unix epoch, octal)    |
//! | 148    | 8    | checksum  | Header checksum in octal ASCII           |
//! | 156    | 1    | typeflag  | Entry type (see [`EntryType`])           |
//! | 157    | 100  | linkname  | Link target for hard/symbolic links      |
//! | 257    | 6    | magic     | "ustar\0"                                |
//! | 263    | 2    | version   | "00"                                     |
//! | 265    | 32   | uname     | Owner user name                          |
//! | 297    | 32   | gname     | Owner group name                         |
//! | 329    | 8    | devmajor  | Device major number                      |
//! | 337    | 8    | devminor  | Device minor number                      |
//! | 345    | 155  | prefix    | Path prefix for long names               |
//!
//! When the prefix is 130 bytes or shorter, bytes 476..488 and 488..500 of
//! the prefix area carry the access and change times.
//!
//! Numeric fields hold octal ASCII. Values that don't fit, and negative
//! values, use the base-256 escape: a leading `0x80` (positive) or `0xff`
//! (negative, two's complement) byte followed by the big-endian value.
//!
//! # Example
//!
//! ```
//! use tar_header::{EntryType, Header, HEADER_SIZE};
//!
//! let mut header = Header {
//!     path: "a.txt".into(),
//!     mode: Some(0o644),
//!     size: 5,
//!     entry_type: EntryType::Regular,
//!     ..Default::default()
//! };
//! let mut block = [0u8; HEADER_SIZE];
//! assert!(!header.encode(&mut block));
//!
//! let decoded = Header::decode(&block, None, None).unwrap();
//! assert_eq!(decoded.path, "a.txt");
//! assert!(decoded.cksum_valid);
//! ```

mod header;
mod pax;
mod timestamp;

use std::fmt;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use header::Header;
pub use pax::{Pax, PaxError, PaxExtension, PaxExtensions};
pub use timestamp::{ParseTimestampError, Timestamp};

/// Size of a tar header block in bytes.
pub const HEADER_SIZE: usize = 512;

/// Magic string for UStar format headers ("ustar\0").
pub const USTAR_MAGIC: &[u8; 6] = b"ustar\0";

/// Version field for UStar format headers ("00").
pub const USTAR_VERSION: &[u8; 2] = b"00";

/// Magic string for GNU tar format headers ("ustar ").
pub const GNU_MAGIC: &[u8; 6] = b"ustar ";

/// Version field for GNU tar format headers (" \0").
pub const GNU_VERSION: &[u8; 2] = b" \0";

/// Errors that can occur when decoding tar headers.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// The provided data is too short to contain a header.
    #[error("insufficient data: expected {HEADER_SIZE} bytes, got {0}")]
    InsufficientData(usize),

    /// A numeric field has the high bit set but isn't a valid base-256 value.
    #[error("invalid base-256 encoding: {0:02x?}")]
    InvalidBase256(Vec<u8>),

    /// A base-256 value doesn't fit in a signed 64-bit integer.
    #[error("base-256 value out of range: {0:02x?}")]
    Base256OutOfRange(Vec<u8>),
}

/// Result type for header operations.
pub type Result<T> = std::result::Result<T, HeaderError>;

// ============================================================================
// Raw Header Struct
// ============================================================================

/// UStar (POSIX.1-2001) tar header block with named fields.
///
/// This is the on-disk view used by [`Header::decode`] and
/// [`Header::encode`]. See module-level documentation for the layout.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UstarHeader {
    /// File path name (null-terminated if shorter than 100 bytes).
    pub name: [u8; 100],
    /// File mode in octal ASCII.
    pub mode: [u8; 8],
    /// Owner user ID in octal ASCII.
    pub uid: [u8; 8],
    /// Owner group ID in octal ASCII.
    pub gid: [u8; 8],
    /// File size in octal ASCII.
    pub size: [u8; 12],
    /// Modification time as Unix timestamp in octal ASCII.
    pub mtime: [u8; 12],
    /// Header checksum in octal ASCII.
    pub checksum: [u8; 8],
    /// Entry type flag.
    pub typeflag: u8,
    /// Link target name for hard/symbolic links.
    pub linkname: [u8; 100],
    /// Magic string identifying the format ("ustar\0" for UStar).
    pub magic: [u8; 6],
    /// Format version ("00" for UStar).
    pub version: [u8; 2],
    /// Owner user name (null-terminated).
    pub uname: [u8; 32],
    /// Owner group name (null-terminated).
    pub gname: [u8; 32],
    /// Device major number in octal ASCII (for special files).
    pub devmajor: [u8; 8],
    /// Device minor number in octal ASCII (for special files).
    pub devminor: [u8; 8],
    /// Path prefix for names longer than 100 bytes.
    ///
    /// When bytes 130.. are unused they carry atime and ctime.
    pub prefix: [u8; 155],
    /// Padding to fill the 512-byte block.
    pub pad: [u8; 12],
}

impl UstarHeader {
    /// Whether the magic and version identify a POSIX UStar header.
    #[must_use]
    pub fn is_ustar(&self) -> bool {
        self.magic == *USTAR_MAGIC && self.version == *USTAR_VERSION
    }

    /// Whether the magic and version identify a GNU tar header.
    #[must_use]
    pub fn is_gnu(&self) -> bool {
        self.magic == *GNU_MAGIC && self.version == *GNU_VERSION
    }
}

impl fmt::Debug for UstarHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UstarHeader")
            .field("name", &String::from_utf8_lossy(truncate_null(&self.name)))
            .field("mode", &String::from_utf8_lossy(truncate_null(&self.mode)))
            .field("typeflag", &self.typeflag)
            .field("magic", &self.magic)
            .field(
                "uname",
                &String::from_utf8_lossy(truncate_null(&self.uname)),
            )
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Entry Type
// ============================================================================

/// Tar entry type indicating the kind of archive member.
///
/// The type is stored as a single ASCII byte in the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// Regular file (type '0' or '\0' for old tar compatibility).
    #[default]
    Regular,
    /// Hard link to another file in the archive (type '1').
    Link,
    /// Symbolic link (type '2').
    Symlink,
    /// Character device (type '3').
    Char,
    /// Block device (type '4').
    Block,
    /// Directory (type '5').
    Directory,
    /// FIFO/named pipe (type '6').
    Fifo,
    /// Contiguous file (type '7', rarely used).
    Continuous,
    /// PAX extended header for next entry (type 'x').
    XHeader,
    /// Solaris extended header for next entry (type 'X').
    OldXHeader,
    /// PAX global extended header (type 'g').
    XGlobalHeader,
    /// Solaris access control list (type 'A').
    SolarisAcl,
    /// GNU directory dump (type 'D').
    GnuDumpDir,
    /// GNU inode-only entry (type 'I').
    Inode,
    /// GNU tar long link extension (type 'K').
    GnuLongLink,
    /// GNU tar long name extension (type 'L').
    GnuLongName,
    /// GNU multi-volume continuation (type 'M').
    Continuation,
    /// Old GNU long name (type 'N').
    OldGnuLongName,
    /// GNU tar sparse file (type 'S').
    GnuSparse,
    /// GNU tape volume header (type 'V').
    VolumeHeader,
    /// Unknown or unsupported entry type.
    Other(u8),
}

impl EntryType {
    /// Parse an entry type from a raw byte value.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'0' | b'\0' => EntryType::Regular,
            b'1' => EntryType::Link,
            b'2' => EntryType::Symlink,
            b'3' => EntryType::Char,
            b'4' => EntryType::Block,
            b'5' => EntryType::Directory,
            b'6' => EntryType::Fifo,
            b'7' => EntryType::Continuous,
            b'x' => EntryType::XHeader,
            b'X' => EntryType::OldXHeader,
            b'g' => EntryType::XGlobalHeader,
            b'A' => EntryType::SolarisAcl,
            b'D' => EntryType::GnuDumpDir,
            b'I' => EntryType::Inode,
            b'K' => EntryType::GnuLongLink,
            b'L' => EntryType::GnuLongName,
            b'M' => EntryType::Continuation,
            b'N' => EntryType::OldGnuLongName,
            b'S' => EntryType::GnuSparse,
            b'V' => EntryType::VolumeHeader,
            other => EntryType::Other(other),
        }
    }

    /// Convert an entry type to its raw byte representation.
    ///
    /// Note that `Regular` is encoded as '0', not '\0'.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            EntryType::Regular => b'0',
            EntryType::Link => b'1',
            EntryType::Symlink => b'2',
            EntryType::Char => b'3',
            EntryType::Block => b'4',
            EntryType::Directory => b'5',
            EntryType::Fifo => b'6',
            EntryType::Continuous => b'7',
            EntryType::XHeader => b'x',
            EntryType::OldXHeader => b'X',
            EntryType::XGlobalHeader => b'g',
            EntryType::SolarisAcl => b'A',
            EntryType::GnuDumpDir => b'D',
            EntryType::Inode => b'I',
            EntryType::GnuLongLink => b'K',
            EntryType::GnuLongName => b'L',
            EntryType::Continuation => b'M',
            EntryType::OldGnuLongName => b'N',
            EntryType::GnuSparse => b'S',
            EntryType::VolumeHeader => b'V',
            EntryType::Other(b) => b,
        }
    }

    /// Returns true if this is a regular file entry.
    #[must_use]
    pub fn is_file(self) -> bool {
        matches!(self, EntryType::Regular | EntryType::Continuous)
    }

    /// Returns true if this is a directory entry.
    #[must_use]
    pub fn is_dir(self) -> bool {
        matches!(self, EntryType::Directory | EntryType::GnuDumpDir)
    }

    /// Returns true if this is a symbolic link entry.
    #[must_use]
    pub fn is_symlink(self) -> bool {
        self == EntryType::Symlink
    }

    /// Returns true if this is a hard link entry.
    #[must_use]
    pub fn is_hard_link(self) -> bool {
        self == EntryType::Link
    }

    /// Returns true for both kinds of link, which must carry a link path.
    #[must_use]
    pub fn is_link(self) -> bool {
        matches!(self, EntryType::Link | EntryType::Symlink)
    }

    /// Returns true for entries whose body describes the next entry (or all
    /// following entries) rather than file content.
    #[must_use]
    pub fn is_meta(self) -> bool {
        matches!(
            self,
            EntryType::XHeader
                | EntryType::OldXHeader
                | EntryType::XGlobalHeader
                | EntryType::GnuLongName
                | EntryType::GnuLongLink
                | EntryType::OldGnuLongName
        )
    }

    /// Returns true for member kinds a reader hands to its consumer.
    ///
    /// Everything else that isn't [`is_meta`](Self::is_meta) is skipped.
    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            EntryType::Regular
                | EntryType::Link
                | EntryType::Symlink
                | EntryType::Char
                | EntryType::Block
                | EntryType::Directory
                | EntryType::Fifo
                | EntryType::Continuous
                | EntryType::GnuDumpDir
        )
    }

    /// The conventional long name of this type, as used in diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            EntryType::Regular => "File",
            EntryType::Link => "Link",
            EntryType::Symlink => "SymbolicLink",
            EntryType::Char => "CharacterDevice",
            EntryType::Block => "BlockDevice",
            EntryType::Directory => "Directory",
            EntryType::Fifo => "FIFO",
            EntryType::Continuous => "ContiguousFile",
            EntryType::XHeader => "ExtendedHeader",
            EntryType::OldXHeader => "OldExtendedHeader",
            EntryType::XGlobalHeader => "GlobalExtendedHeader",
            EntryType::SolarisAcl => "SolarisACL",
            EntryType::GnuDumpDir => "GNUDumpDir",
            EntryType::Inode => "Inode",
            EntryType::GnuLongLink => "NextFileHasLongLinkpath",
            EntryType::GnuLongName => "NextFileHasLongPath",
            EntryType::Continuation => "ContinuationFile",
            EntryType::OldGnuLongName => "OldGnuLongPath",
            EntryType::GnuSparse => "SparseFile",
            EntryType::VolumeHeader => "TapeVolumeHeader",
            EntryType::Other(_) => "Unsupported",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Other(b) => write!(f, "Unsupported({:?})", char::from(*b)),
            other => f.write_str(other.name()),
        }
    }
}

impl From<u8> for EntryType {
    fn from(byte: u8) -> Self {
        Self::from_byte(byte)
    }
}

impl From<EntryType> for u8 {
    fn from(entry_type: EntryType) -> Self {
        entry_type.to_byte()
    }
}

// ============================================================================
// Numeric Fields
// ============================================================================

/// Largest value an octal field of `size` bytes can hold.
///
/// One byte is reserved for the terminator.
#[must_use]
pub fn max_octal(size: usize) -> i64 {
    match size {
        0 | 1 => 0,
        s if s > 22 => i64::MAX,
        s => (1i64 << (3 * (s - 1))) - 1,
    }
}

/// Decode a numeric field that may be octal ASCII or base-256.
///
/// Returns `Ok(None)` for a field that holds no digits at all (empty, all
/// spaces or NUL, or garbage), which is how absent values are written.
///
/// # Errors
///
/// Returns an error if the high bit is set but the leading byte is neither
/// `0x80` nor `0xff`, or the base-256 value doesn't fit in an `i64`.
pub fn decode_number(field: &[u8]) -> Result<Option<i64>> {
    match field.first() {
        Some(b) if b & 0x80 != 0 => parse_base256(field).map(Some),
        _ => Ok(parse_octal(field)),
    }
}

/// Parse an octal ASCII field.
///
/// Everything from the first NUL on is ignored, surrounding spaces are
/// trimmed, and the leading run of octal digits is used:
/// - `"0000644\0"` -> 420 (file mode 0644)
/// - `"     123 "` -> 83
#[must_use]
pub fn parse_octal(field: &[u8]) -> Option<i64> {
    let text = truncate_null(field);
    let start = text
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(text.len());
    let digits = text[start..]
        .iter()
        .take_while(|&&b| (b'0'..=b'7').contains(&b))
        .count();
    if digits == 0 {
        return None;
    }

    text[start..start + digits].iter().try_fold(0i64, |value, &b| {
        value.checked_mul(8)?.checked_add(i64::from(b - b'0'))
    })
}

/// Parse a base-256 numeric field.
///
/// A leading `0x80` marks a positive big-endian value in the remaining
/// bytes; a leading `0xff` marks a negative value stored as two's
/// complement across the whole field.
///
/// # Errors
///
/// See [`decode_number`].
pub fn parse_base256(field: &[u8]) -> Result<i64> {
    let (&first, rest) = field
        .split_first()
        .ok_or_else(|| HeaderError::InvalidBase256(field.to_vec()))?;

    let value: i128 = match first {
        0x80 => rest
            .iter()
            .try_fold(0i128, |acc, &b| acc.checked_mul(256)?.checked_add(i128::from(b))),
        // two's complement across the whole field, including the marker byte
        0xff if field.len() < 16 => {
            let unsigned = field
                .iter()
                .fold(0i128, |acc, &b| (acc << 8) | i128::from(b));
            Some(unsigned - (1i128 << (8 * field.len())))
        }
        0xff => None,
        _ => return Err(HeaderError::InvalidBase256(field.to_vec())),
    }
    .ok_or_else(|| HeaderError::Base256OutOfRange(field.to_vec()))?;

    i64::try_from(value).map_err(|_| HeaderError::Base256OutOfRange(field.to_vec()))
}

/// Write `value` into a base-256 field.
///
/// The first byte is `0x80` for non-negative values and `0xff` for negative
/// values; the rest is the big-endian two's complement representation.
pub fn encode_base256(value: i64, field: &mut [u8]) {
    let Some((first, rest)) = field.split_first_mut() else {
        return;
    };
    let mut remaining = i128::from(value);
    for byte in rest.iter_mut().rev() {
        *byte = (remaining & 0xff) as u8;
        remaining >>= 8;
    }
    *first = if value < 0 { 0xff } else { 0x80 };
}

/// Write an octal ASCII value, or fall back to base-256.
///
/// Returns true if the value couldn't be stored as octal, meaning a reader
/// that doesn't understand base-256 will need a PAX record. `None` leaves
/// the field untouched.
pub fn encode_number(field: &mut [u8], value: Option<i64>) -> bool {
    let Some(value) = value else {
        return false;
    };
    if value < 0 || value > max_octal(field.len()) {
        encode_base256(value, field);
        return true;
    }

    let size = field.len();
    let digits = format!("{value:o}");
    let text = if digits.len() == size - 1 {
        format!("{digits}\0")
    } else {
        format!("{digits:0>width$} \0", width = size - 2)
    };
    field.copy_from_slice(text.as_bytes());
    false
}

// ============================================================================
// Strings
// ============================================================================

/// Truncate a byte slice at the first null byte.
///
/// This is used to extract null-terminated strings from fixed-size fields.
/// If no null byte is found, returns the entire slice.
///
/// # Example
///
/// ```
/// use tar_header::truncate_null;
///
/// assert_eq!(truncate_null(b"hello\0world"), b"hello");
/// assert_eq!(truncate_null(b"no null here"), b"no null here");
/// assert_eq!(truncate_null(b"\0empty"), b"");
/// ```
#[must_use]
pub fn truncate_null(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(pos) => &bytes[..pos],
        None => bytes,
    }
}

/// Decode a null-terminated string field, replacing invalid UTF-8.
#[must_use]
pub fn decode_string(field: &[u8]) -> String {
    String::from_utf8_lossy(truncate_null(field)).into_owned()
}

/// Write a string into a fixed-width field.
///
/// Returns true if the string is too long or isn't plain ASCII, meaning it
/// can't be represented faithfully without a PAX record.
pub fn encode_string(field: &mut [u8], value: &str) -> bool {
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
    field[len..].fill(0);
    !value.is_ascii() || bytes.len() > field.len()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(size_of::<UstarHeader>(), HEADER_SIZE);
    }

    #[test]
    fn test_parse_octal() {
        assert_eq!(parse_octal(b"0000644\0"), Some(0o644));
        assert_eq!(parse_octal(b"0000755\0"), Some(0o755));
        assert_eq!(parse_octal(b"     123 "), Some(0o123));
        assert_eq!(parse_octal(b"0"), Some(0));
        assert_eq!(parse_octal(b""), None);
        assert_eq!(parse_octal(b"   \0\0\0"), None);
        assert_eq!(parse_octal(b"77777777777"), Some(0o77777777777));
    }

    #[test]
    fn test_parse_octal_garbage() {
        assert_eq!(parse_octal(b"abc"), None);
        // 8 and 9 are not octal, only the leading digit counts
        assert_eq!(parse_octal(b"128"), Some(1));
    }

    #[test]
    fn test_max_octal() {
        assert_eq!(max_octal(8), 0o7777777);
        assert_eq!(max_octal(12), 0o77777777777);
    }

    #[test]
    fn test_encode_number_octal() {
        let mut field = [0u8; 8];
        assert!(!encode_number(&mut field, Some(0o644)));
        assert_eq!(&field, b"000644 \0");

        let mut field = [0u8; 8];
        assert!(!encode_number(&mut field, Some(0o7777777)));
        assert_eq!(&field, b"7777777\0");

        let mut field = [0u8; 12];
        assert!(!encode_number(&mut field, Some(5)));
        assert_eq!(&field, b"0000000005 \0");
    }

    #[test]
    fn test_encode_number_none_untouched() {
        let mut field = [0u8; 8];
        assert!(!encode_number(&mut field, None));
        assert_eq!(field, [0u8; 8]);
    }

    #[test]
    fn test_encode_number_large() {
        let mut field = [0u8; 8];
        assert!(encode_number(&mut field, Some(0o10000000)));
        assert_eq!(field[0], 0x80);
        assert_eq!(decode_number(&field).unwrap(), Some(0o10000000));
    }

    #[test]
    fn test_base256_positive() {
        let mut field = [0u8; 12];
        encode_base256(0x0102_0304_0506, &mut field);
        assert_eq!(
            field,
            [0x80, 0, 0, 0, 0, 0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]
        );
        assert_eq!(parse_base256(&field).unwrap(), 0x0102_0304_0506);
    }

    #[test]
    fn test_base256_negative() {
        let mut field = [0u8; 12];
        encode_base256(-1, &mut field);
        assert_eq!(field, [0xff; 12]);
        assert_eq!(parse_base256(&field).unwrap(), -1);

        encode_base256(-256, &mut field);
        assert_eq!(&field[9..], &[0xff, 0xff, 0x00][..]);
        assert_eq!(parse_base256(&field).unwrap(), -256);

        let mut field = [0u8; 8];
        encode_base256(-9_007_199_254_740_991, &mut field);
        assert_eq!(parse_base256(&field).unwrap(), -9_007_199_254_740_991);
    }

    #[test]
    fn test_base256_invalid_lead() {
        assert!(matches!(
            parse_base256(&[0x81, 0, 0, 0]),
            Err(HeaderError::InvalidBase256(_))
        ));
        assert!(matches!(
            decode_number(&[0xc0, 0, 0, 0]),
            Err(HeaderError::InvalidBase256(_))
        ));
    }

    #[test]
    fn test_base256_out_of_range() {
        let mut field = [0xffu8; 12];
        field[0] = 0x80;
        assert!(matches!(
            parse_base256(&field),
            Err(HeaderError::Base256OutOfRange(_))
        ));
    }

    #[test]
    fn test_truncate_null() {
        assert_eq!(truncate_null(b"hello\0world"), b"hello");
        assert_eq!(truncate_null(b"no null"), b"no null");
        assert_eq!(truncate_null(b"\0start"), b"");
        assert_eq!(truncate_null(b""), b"");
    }

    #[test]
    fn test_encode_string() {
        let mut field = [0xaau8; 8];
        assert!(!encode_string(&mut field, "abc"));
        assert_eq!(&field, b"abc\0\0\0\0\0");

        assert!(encode_string(&mut field, "abcdefghij"));
        assert_eq!(&field, b"abcdefgh");

        assert!(encode_string(&mut field, "ü"));
    }

    #[test]
    fn test_entry_type_roundtrip() {
        for byte in b"01234567xXgADIKLMNSV" {
            assert_eq!(EntryType::from_byte(*byte).to_byte(), *byte);
        }
        assert_eq!(EntryType::from_byte(b'\0'), EntryType::Regular);
        assert_eq!(EntryType::from_byte(b'Z'), EntryType::Other(b'Z'));
    }

    #[test]
    fn test_entry_type_predicates() {
        assert!(EntryType::Regular.is_file());
        assert!(EntryType::Continuous.is_file());
        assert!(!EntryType::Directory.is_file());

        assert!(EntryType::Directory.is_dir());
        assert!(EntryType::GnuDumpDir.is_dir());

        assert!(EntryType::Symlink.is_link());
        assert!(EntryType::Link.is_link());
        assert!(!EntryType::Regular.is_link());

        assert!(EntryType::XHeader.is_meta());
        assert!(EntryType::GnuLongName.is_meta());
        assert!(!EntryType::GnuSparse.is_meta());
        assert!(!EntryType::GnuSparse.is_supported());
        assert!(EntryType::Fifo.is_supported());
    }

    #[test]
    fn test_entry_type_display() {
        assert_eq!(EntryType::Symlink.to_string(), "SymbolicLink");
        assert_eq!(EntryType::Other(b'Z').to_string(), "Unsupported('Z')");
    }
}
