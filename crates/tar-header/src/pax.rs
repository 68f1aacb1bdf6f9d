//! PAX extended header records.
//!
//! Records take the form `<length> <key>=<value>\n`, where `<length>` counts
//! every byte of the record including its own digits.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{header::basename, EntryType, Header, Timestamp, HEADER_SIZE};

/// Prefix used by star and GNU tar for `dev`, `ino` and `nlink`.
const SCHILY: &str = "SCHILY.";

/// Error parsing a PAX extension record.
#[derive(Debug, Error)]
pub enum PaxError {
    /// The record format is malformed.
    #[error("malformed PAX extension record")]
    Malformed,
    /// The key is not valid UTF-8.
    #[error("PAX key is not valid UTF-8: {0}")]
    InvalidKey(#[from] std::str::Utf8Error),
}

/// A single PAX extended header key/value pair.
#[derive(Debug, Clone)]
pub struct PaxExtension<'a> {
    key: &'a [u8],
    value: &'a [u8],
}

impl<'a> PaxExtension<'a> {
    /// Returns the key as a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not valid UTF-8.
    pub fn key(&self) -> std::result::Result<&'a str, std::str::Utf8Error> {
        std::str::from_utf8(self.key)
    }

    /// Returns the raw value bytes.
    #[must_use]
    pub fn value_bytes(&self) -> &'a [u8] {
        self.value
    }
}

/// Iterator over the records of a PAX body.
///
/// A record whose declared length doesn't land on its newline is reported as
/// [`PaxError::Malformed`] and skipped up to the next newline, so one bad
/// record doesn't hide the ones after it.
///
/// ```
/// use tar_header::PaxExtensions;
///
/// let mut iter = PaxExtensions::new(b"20 path=foo/bar.txt\n");
/// let ext = iter.next().unwrap().unwrap();
/// assert_eq!(ext.key().unwrap(), "path");
/// assert_eq!(ext.value_bytes(), b"foo/bar.txt");
/// ```
#[derive(Debug)]
pub struct PaxExtensions<'a> {
    data: &'a [u8],
}

impl<'a> PaxExtensions<'a> {
    /// Create a new iterator over PAX extension records.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn skip_line(&mut self) {
        self.data = match self.data.iter().position(|&b| b == b'\n') {
            Some(pos) => &self.data[pos + 1..],
            None => &[],
        };
    }
}

impl<'a> Iterator for PaxExtensions<'a> {
    type Item = std::result::Result<PaxExtension<'a>, PaxError>;

    fn next(&mut self) -> Option<Self::Item> {
        // a body is padded with NULs up to the block boundary
        if self.data.first().is_none_or(|&b| b == 0) {
            return None;
        }

        let record = (|| {
            let space = self.data.iter().position(|&b| b == b' ')?;
            let len: usize = std::str::from_utf8(&self.data[..space]).ok()?.parse().ok()?;
            if len > self.data.len() || len < space + 2 || self.data[len - 1] != b'\n' {
                return None;
            }
            let kv = &self.data[space + 1..len - 1];
            let eq = kv.iter().position(|&b| b == b'=')?;
            Some((len, &kv[..eq], &kv[eq + 1..]))
        })();

        match record {
            Some((len, key, value)) => {
                self.data = &self.data[len..];
                Some(Ok(PaxExtension { key, value }))
            }
            None => {
                self.skip_line();
                Some(Err(PaxError::Malformed))
            }
        }
    }
}

/// The values carried by an extended (`x`) or global (`g`) header.
///
/// Every field is optional; only present ones are written or applied.
/// Records with keys this type doesn't model, such as `SCHILY.xattr.*`, are
/// kept in [`extra`](Self::extra).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pax {
    /// Whether this applies to every following entry rather than just the next.
    pub global: bool,
    pub path: Option<String>,
    pub linkpath: Option<String>,
    pub size: Option<u64>,
    pub mtime: Option<Timestamp>,
    pub atime: Option<Timestamp>,
    pub ctime: Option<Timestamp>,
    pub uid: Option<u64>,
    pub gid: Option<u64>,
    pub uname: Option<String>,
    pub gname: Option<String>,
    pub dev: Option<u64>,
    pub ino: Option<u64>,
    pub nlink: Option<u64>,
    pub charset: Option<String>,
    pub comment: Option<String>,
    /// Everything else, keyed by the record key.
    pub extra: BTreeMap<String, String>,
}

/// Length of `" key=value\n"` once its own decimal length is prepended.
fn record_len(key: &str, value: &str) -> usize {
    let body = key.len() + value.len() + 3;
    let mut digits = 1;
    while (body + digits).to_string().len() != digits {
        digits += 1;
    }
    body + digits
}

fn push_record(out: &mut String, key: &str, value: &str) {
    let len = record_len(key, value);
    out.push_str(&format!("{len} {key}={value}\n"));
}

fn is_time_key(key: &str) -> bool {
    let name = match key.split_once('.') {
        Some((vendor, rest))
            if !vendor.is_empty() && vendor.bytes().all(|b| b.is_ascii_uppercase()) =>
        {
            rest
        }
        _ => key,
    };
    matches!(
        name,
        "mtime" | "atime" | "ctime" | "birthtime" | "creationtime"
    )
}

impl Pax {
    /// Collect the values a [`Header`] would need in an extended header.
    ///
    /// Everything the header carries is copied; what is written in the end
    /// depends on which fields the caller keeps.
    #[must_use]
    pub fn from_header(header: &Header, global: bool) -> Self {
        Pax {
            global,
            path: Some(header.path.clone()),
            linkpath: Some(header.linkpath.clone()).filter(|s| !s.is_empty()),
            size: Some(header.size),
            mtime: header.mtime,
            atime: header.atime,
            ctime: header.ctime,
            uid: header.uid,
            gid: header.gid,
            uname: Some(header.uname.clone()).filter(|s| !s.is_empty()),
            gname: Some(header.gname.clone()).filter(|s| !s.is_empty()),
            ..Default::default()
        }
    }

    /// Render the record body in a fixed key order.
    #[must_use]
    pub fn encode_body(&self) -> String {
        let mut out = String::new();
        if let Some(path) = &self.path {
            push_record(&mut out, "path", path);
        }
        let fields = [
            ("ctime", self.ctime.map(|t| t.to_string())),
            ("atime", self.atime.map(|t| t.to_string())),
            ("SCHILY.dev", self.dev.map(|v| v.to_string())),
            ("SCHILY.ino", self.ino.map(|v| v.to_string())),
            ("SCHILY.nlink", self.nlink.map(|v| v.to_string())),
            ("charset", self.charset.clone()),
            ("comment", self.comment.clone()),
            ("gid", self.gid.map(|v| v.to_string())),
            ("gname", self.gname.clone()),
            ("linkpath", self.linkpath.clone()),
            ("mtime", self.mtime.map(|t| t.to_string())),
            ("size", self.size.map(|v| v.to_string())),
            ("uid", self.uid.map(|v| v.to_string())),
            ("uname", self.uname.clone()),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                push_record(&mut out, key, &value);
            }
        }
        for (key, value) in &self.extra {
            push_record(&mut out, key, value);
        }
        out
    }

    /// Encode as a header block followed by the body, padded to a multiple of
    /// 512 bytes. Returns `None` when there is nothing to write.
    #[must_use]
    pub fn encode(&self) -> Option<Vec<u8>> {
        let body = self.encode_body();
        if body.is_empty() {
            return None;
        }

        let body_blocks = body.len().div_ceil(HEADER_SIZE);
        let mut buf = vec![0u8; HEADER_SIZE * (1 + body_blocks)];

        let name = format!("PaxHeader/{}", basename(self.path.as_deref().unwrap_or("")));
        let mut end = name.len().min(99);
        while !name.is_char_boundary(end) {
            end -= 1;
        }

        let mut header = Header {
            path: name[..end].to_string(),
            mode: Some(0o644),
            uid: self.uid,
            gid: self.gid,
            size: body.len() as u64,
            mtime: self.mtime,
            entry_type: if self.global {
                EntryType::XGlobalHeader
            } else {
                EntryType::XHeader
            },
            uname: self.uname.clone().unwrap_or_default(),
            gname: self.gname.clone().unwrap_or_default(),
            devmaj: Some(0),
            devmin: Some(0),
            atime: self.atime,
            ctime: self.ctime,
            ..Default::default()
        };
        let (block, rest) = buf.split_at_mut(HEADER_SIZE);
        if let Ok(block) = <&mut [u8; HEADER_SIZE]>::try_from(block) {
            header.encode(block);
        }
        rest[..body.len()].copy_from_slice(body.as_bytes());
        Some(buf)
    }

    /// Parse a record body, merging onto `existing` with the new values
    /// winning.
    ///
    /// Malformed records are dropped. `SCHILY.` is stripped from
    /// `dev`/`ino`/`nlink`, time keys are parsed as timestamps, and numeric
    /// fields that don't parse are ignored.
    #[must_use]
    pub fn parse(body: &[u8], existing: Option<&Pax>, global: bool) -> Pax {
        let mut pax = existing.cloned().unwrap_or_default();
        pax.global = global;

        for ext in PaxExtensions::new(body).flatten() {
            let Ok(key) = ext.key() else {
                continue;
            };
            let value = String::from_utf8_lossy(ext.value_bytes()).into_owned();
            let key = match key.strip_prefix(SCHILY) {
                Some(k @ ("dev" | "ino" | "nlink")) => k,
                _ => key,
            };
            if key.is_empty() {
                continue;
            }
            pax.set(key, value);
        }
        pax
    }

    fn set(&mut self, key: &str, value: String) {
        let number = || value.parse::<u64>().ok();
        let time = || value.parse::<Timestamp>().ok();
        match key {
            "path" => self.path = Some(value),
            "linkpath" => self.linkpath = Some(value),
            "uname" => self.uname = Some(value),
            "gname" => self.gname = Some(value),
            "charset" => self.charset = Some(value),
            "comment" => self.comment = Some(value),
            "size" => self.size = number().or(self.size),
            "uid" => self.uid = number().or(self.uid),
            "gid" => self.gid = number().or(self.gid),
            "dev" => self.dev = number().or(self.dev),
            "ino" => self.ino = number().or(self.ino),
            "nlink" => self.nlink = number().or(self.nlink),
            "mtime" => self.mtime = time().or(self.mtime),
            "atime" => self.atime = time().or(self.atime),
            "ctime" => self.ctime = time().or(self.ctime),
            other if is_time_key(other) && time().is_none() => {}
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
    }

    /// Whether no value at all is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.encode_body().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_record_length_is_self_referential() {
        assert_eq!(record_len("path", "a"), 9);
        let mut out = String::new();
        push_record(&mut out, "path", "a");
        assert_eq!(out, "9 path=a\n");

        // crossing a power of ten adds a digit
        let value = "v".repeat(92);
        let mut out = String::new();
        push_record(&mut out, "path", &value);
        assert_eq!(out.len(), 102);
        assert!(out.starts_with("102 "));
    }

    #[test]
    fn test_encode_body_order() {
        let pax = Pax {
            path: Some("p".into()),
            uid: Some(1),
            mtime: Some(Timestamp::new(5, 500_000_000)),
            ino: Some(7),
            ..Default::default()
        };
        assert_eq!(
            pax.encode_body(),
            "9 path=p\n16 SCHILY.ino=7\n13 mtime=5.5\n8 uid=1\n"
        );
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(Pax::default().encode(), None);
        assert!(Pax::default().is_empty());
    }

    #[test]
    fn test_encode_block() {
        let path = format!("{}/{}", "d".repeat(20), "f".repeat(200));
        let pax = Pax {
            path: Some(path.clone()),
            ..Default::default()
        };
        let buf = pax.encode().unwrap();
        assert_eq!(buf.len(), 2 * HEADER_SIZE);

        let header = Header::decode(&buf[..HEADER_SIZE], None, None).unwrap();
        assert!(header.cksum_valid);
        assert_eq!(header.entry_type, EntryType::XHeader);
        assert_eq!(header.path.len(), 99);
        assert!(header.path.starts_with("PaxHeader/fff"));
        assert_eq!(header.mode, Some(0o644));

        let body_len = header.size as usize;
        let body = &buf[HEADER_SIZE..HEADER_SIZE + body_len];
        assert_eq!(Pax::parse(body, None, false).path, Some(path));
        assert!(buf[HEADER_SIZE + body_len..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_global_encodes_as_g() {
        let pax = Pax {
            global: true,
            comment: Some("hello".into()),
            ..Default::default()
        };
        let buf = pax.encode().unwrap();
        assert_eq!(buf[156], b'g');
    }

    #[test]
    fn test_parse_fields() {
        let body = b"30 mtime=1700000000.123456789\n\
                     12 uid=1000\n\
                     18 SCHILY.nlink=2\n\
                     16 uname=nobody\n\
                     29 SCHILY.xattr.user.k=value\n";
        let pax = Pax::parse(body, None, false);
        assert_eq!(pax.mtime, Some(Timestamp::new(1_700_000_000, 123_456_789)));
        assert_eq!(pax.uid, Some(1000));
        assert_eq!(pax.nlink, Some(2));
        assert_eq!(pax.uname.as_deref(), Some("nobody"));
        assert_eq!(
            pax.extra.get("SCHILY.xattr.user.k").map(String::as_str),
            Some("value")
        );
    }

    #[test]
    fn test_parse_drops_bad_length() {
        let body = b"99 path=wrong\n12 uid=1000\n";
        let pax = Pax::parse(body, None, false);
        assert_eq!(pax.path, None);
        assert_eq!(pax.uid, Some(1000));
    }

    #[test]
    fn test_parse_ignores_non_numeric() {
        let pax = Pax::parse(b"12 uid=abcd\n", None, false);
        assert_eq!(pax.uid, None);
        assert!(pax.extra.is_empty());
    }

    #[test]
    fn test_parse_merges_new_values_win() {
        let existing = Pax {
            path: Some("old".into()),
            gid: Some(5),
            ..Default::default()
        };
        let pax = Pax::parse(b"12 path=new\n", Some(&existing), false);
        assert_eq!(pax.path.as_deref(), Some("new"));
        assert_eq!(pax.gid, Some(5));
    }

    #[test]
    fn test_parse_value_with_newline() {
        let mut out = String::new();
        push_record(&mut out, "comment", "two\nlines");
        let pax = Pax::parse(out.as_bytes(), None, true);
        assert!(pax.global);
        assert_eq!(pax.comment.as_deref(), Some("two\nlines"));
    }

    #[test]
    fn test_vendor_time_key() {
        assert!(is_time_key("LIBARCHIVE.creationtime"));
        assert!(is_time_key("mtime"));
        assert!(!is_time_key("lowercase.mtime"));
        let pax = Pax::parse(b"32 LIBARCHIVE.creationtime=12.5\n", None, false);
        assert_eq!(
            pax.extra.get("LIBARCHIVE.creationtime").map(String::as_str),
            Some("12.5")
        );
    }

    #[test]
    fn test_tar_crate_reads_our_records() {
        let pax = Pax {
            path: Some("a/very/long/path".into()),
            size: Some(42),
            ..Default::default()
        };
        let body = pax.encode_body();
        let values: Vec<_> = tar::PaxExtensions::new(body.as_bytes())
            .map(|ext| {
                let ext = ext.unwrap();
                (
                    ext.key().unwrap().to_string(),
                    ext.value().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            values,
            vec![
                ("path".to_string(), "a/very/long/path".to_string()),
                ("size".to_string(), "42".to_string()),
            ]
        );
    }
}
