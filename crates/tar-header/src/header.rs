//! Decoded tar header and the block codec.

use crate::{
    decode_number, decode_string, encode_number, encode_string, EntryType, HeaderError, Pax,
    Result, Timestamp, UstarHeader, HEADER_SIZE, USTAR_MAGIC, USTAR_VERSION,
};

const NAME_SIZE: usize = 100;
const PREFIX_SIZE: usize = 155;
/// Prefix length when the tail of the prefix area holds atime/ctime.
const SHORT_PREFIX_SIZE: usize = 130;

/// One archive member's metadata, decoded from (or to be encoded into) a
/// 512-byte block.
///
/// Numeric fields are `None` when the block leaves them empty. After
/// [`decode`](Self::decode), any PAX values in effect have already been
/// applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Member path, with any UStar prefix joined on.
    pub path: String,
    /// Permission and mode bits.
    pub mode: Option<u32>,
    /// Owner user ID.
    pub uid: Option<u64>,
    /// Owner group ID.
    pub gid: Option<u64>,
    /// Body size in bytes (always 0 for directories).
    pub size: u64,
    /// Modification time.
    pub mtime: Option<Timestamp>,
    /// Stored (or, after encoding, computed) checksum.
    pub cksum: Option<u64>,
    /// Whether the stored checksum matched the block contents.
    pub cksum_valid: bool,
    /// Set by [`encode`](Self::encode) when some value didn't fit.
    pub need_pax: bool,
    /// The block was entirely zero, a possible end-of-archive marker.
    pub null_block: bool,
    /// Member kind.
    pub entry_type: EntryType,
    /// Link target for hard and symbolic links.
    pub linkpath: String,
    /// Owner user name.
    pub uname: String,
    /// Owner group name.
    pub gname: String,
    /// Device major number.
    pub devmaj: Option<u64>,
    /// Device minor number.
    pub devmin: Option<u64>,
    /// Access time.
    pub atime: Option<Timestamp>,
    /// Status change time.
    pub ctime: Option<Timestamp>,
}

fn to_u64(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok())
}

fn checksum(block: &[u8; HEADER_SIZE]) -> u64 {
    // the checksum field itself counts as eight spaces
    let spaces = 8 * u64::from(b' ');
    block[..148]
        .iter()
        .chain(&block[156..])
        .fold(spaces, |sum, &b| sum + u64::from(b))
}

impl Header {
    /// Decode a header block.
    ///
    /// Values from the block are read first. Then any global extended header
    /// values are applied, then the per-entry extended header values, so the
    /// extended header wins. A global header never changes the path.
    ///
    /// A checksum mismatch is not an error; check
    /// [`cksum_valid`](Self::cksum_valid).
    ///
    /// # Errors
    ///
    /// Returns an error if `block` is shorter than 512 bytes or a numeric
    /// field holds an invalid base-256 value.
    pub fn decode(block: &[u8], ex: Option<&Pax>, gex: Option<&Pax>) -> Result<Self> {
        let block: &[u8; HEADER_SIZE] = block
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(HeaderError::InsufficientData(block.len()))?;
        let raw: &UstarHeader = zerocopy::transmute_ref!(block);

        let mut header = Header {
            path: decode_string(&raw.name),
            mode: decode_number(&raw.mode)?.and_then(|v| u32::try_from(v).ok()),
            uid: to_u64(decode_number(&raw.uid)?),
            gid: to_u64(decode_number(&raw.gid)?),
            size: to_u64(decode_number(&raw.size)?).unwrap_or(0),
            mtime: decode_number(&raw.mtime)?.map(Timestamp::from_secs),
            cksum: to_u64(decode_number(&raw.checksum)?),
            entry_type: EntryType::from_byte(raw.typeflag),
            linkpath: decode_string(&raw.linkname),
            ..Default::default()
        };

        // old tar versions marked directories as files with a trailing slash
        if header.entry_type == EntryType::Regular && header.path.ends_with('/') {
            header.entry_type = EntryType::Directory;
        }

        if raw.is_ustar() || raw.is_gnu() {
            header.uname = decode_string(&raw.uname);
            header.gname = decode_string(&raw.gname);
            header.devmaj = to_u64(decode_number(&raw.devmajor)?);
            header.devmin = to_u64(decode_number(&raw.devminor)?);
        }

        if raw.is_ustar() {
            let prefix = if raw.prefix[SHORT_PREFIX_SIZE] != 0 {
                // definitely a long prefix, so there's no room for the times
                decode_string(&raw.prefix)
            } else {
                header.atime = decode_number(&raw.prefix[131..143])?.map(Timestamp::from_secs);
                header.ctime = decode_number(&raw.prefix[143..155])?.map(Timestamp::from_secs);
                decode_string(&raw.prefix[..SHORT_PREFIX_SIZE])
            };
            if !prefix.is_empty() {
                header.path = format!("{prefix}/{}", header.path);
            }
        }

        let sum = checksum(block);
        header.cksum_valid = header.cksum == Some(sum);
        if header.cksum.is_none() && block.iter().all(|&b| b == 0) {
            header.null_block = true;
        }

        if let Some(gex) = gex {
            header.apply_pax(gex, true);
        }
        if let Some(ex) = ex {
            header.apply_pax(ex, false);
        }

        // directories can't have a body, whatever the size field says
        if header.entry_type == EntryType::Directory {
            header.size = 0;
        }

        Ok(header)
    }

    /// Overwrite fields with the values present in a PAX record.
    ///
    /// With `global` set the path is left alone: it must come from the
    /// member's own header or its own extended header.
    pub fn apply_pax(&mut self, pax: &Pax, global: bool) {
        if let Some(path) = pax.path.as_ref().filter(|_| !global) {
            self.path.clone_from(path);
        }
        if let Some(linkpath) = &pax.linkpath {
            self.linkpath.clone_from(linkpath);
        }
        if let Some(size) = pax.size {
            self.size = size;
        }
        self.mtime = pax.mtime.or(self.mtime);
        self.atime = pax.atime.or(self.atime);
        self.ctime = pax.ctime.or(self.ctime);
        self.uid = pax.uid.or(self.uid);
        self.gid = pax.gid.or(self.gid);
        if let Some(uname) = &pax.uname {
            self.uname.clone_from(uname);
        }
        if let Some(gname) = &pax.gname {
            self.gname.clone_from(gname);
        }
    }

    /// Encode this header into a block, always as UStar.
    ///
    /// A path that doesn't fit the 100-byte name field is split into a
    /// prefix and a name at a directory boundary. Returns (and records in
    /// [`need_pax`](Self::need_pax)) whether any value couldn't be stored
    /// faithfully, in which case the caller should write a PAX record first.
    /// The checksum is computed last.
    pub fn encode(&mut self, block: &mut [u8; HEADER_SIZE]) -> bool {
        block.fill(0);
        let raw: &mut UstarHeader = zerocopy::transmute_mut!(&mut *block);

        let prefix_size = if self.ctime.is_some() || self.atime.is_some() {
            SHORT_PREFIX_SIZE
        } else {
            PREFIX_SIZE
        };
        let (name, prefix, mut need_pax) = split_prefix(&self.path, prefix_size);

        need_pax |= encode_string(&mut raw.name, &name);
        need_pax |= encode_number(&mut raw.mode, self.mode.map(i64::from));
        need_pax |= encode_number(&mut raw.uid, self.uid.map(clamp));
        need_pax |= encode_number(&mut raw.gid, self.gid.map(clamp));
        need_pax |= encode_number(&mut raw.size, Some(clamp(self.size)));
        need_pax |= encode_number(&mut raw.mtime, self.mtime.map(|t| t.secs()));
        raw.typeflag = self.entry_type.to_byte();
        need_pax |= encode_string(&mut raw.linkname, &self.linkpath);
        raw.magic.copy_from_slice(USTAR_MAGIC);
        raw.version.copy_from_slice(USTAR_VERSION);
        need_pax |= encode_string(&mut raw.uname, &self.uname);
        need_pax |= encode_string(&mut raw.gname, &self.gname);
        need_pax |= encode_number(&mut raw.devmajor, self.devmaj.map(clamp));
        need_pax |= encode_number(&mut raw.devminor, self.devmin.map(clamp));
        need_pax |= encode_string(&mut raw.prefix[..prefix_size], &prefix);
        if raw.prefix[SHORT_PREFIX_SIZE] == 0 {
            need_pax |= encode_number(&mut raw.prefix[131..143], self.atime.map(|t| t.secs()));
            need_pax |= encode_number(&mut raw.prefix[143..155], self.ctime.map(|t| t.secs()));
        }

        let sum = checksum(block);
        encode_number(&mut block[148..156], Some(clamp(sum)));

        self.cksum = Some(sum);
        self.cksum_valid = true;
        self.need_pax = need_pax;
        need_pax
    }

    /// Encode into a fresh block.
    pub fn to_block(&mut self) -> [u8; HEADER_SIZE] {
        let mut block = [0u8; HEADER_SIZE];
        self.encode(&mut block);
        block
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Final path component, ignoring trailing slashes.
pub(crate) fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { "" } else { "/" };
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Everything but the final component, ignoring trailing slashes.
pub(crate) fn dirname(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => {
            let parent = trimmed[..pos].trim_end_matches('/');
            if parent.is_empty() {
                "/"
            } else {
                parent
            }
        }
        None if path.starts_with('/') => "/",
        None => ".",
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> String {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Split a path into a name of at most 100 bytes and a prefix of at most
/// `prefix_size` bytes, walking up the directory tree until both fit.
///
/// Returns `(name, prefix, need_pax)`; if no split works the path is
/// truncated and `need_pax` is set.
fn split_prefix(path: &str, prefix_size: usize) -> (String, String, bool) {
    if path.len() < NAME_SIZE {
        return (path.to_string(), String::new(), false);
    }

    let root = if path.starts_with('/') { "/" } else { "." };
    let mut prefix = dirname(path).to_string();
    let mut name = basename(path).to_string();

    while prefix != root {
        if prefix.len() <= prefix_size {
            if name.len() <= NAME_SIZE {
                return (name, prefix, false);
            }
            // the final component alone is too long
            return (truncate_at_char_boundary(&name, NAME_SIZE - 1), prefix, true);
        }
        name = format!("{}/{name}", basename(&prefix));
        prefix = dirname(&prefix).to_string();
    }

    (
        truncate_at_char_boundary(path, NAME_SIZE - 1),
        String::new(),
        true,
    )
}
