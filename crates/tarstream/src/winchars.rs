//! Mapping of characters Windows doesn't allow in file names.
//!
//! Each of `<>:"?|*` is shifted into the Unicode private use area at
//! `U+F000 + char`, which keeps names reversible.

const RAW: [char; 7] = ['|', '<', '>', '?', ':', '"', '*'];

fn encoded(c: char) -> Option<char> {
    RAW.contains(&c)
        .then(|| char::from_u32(0xf000 + c as u32))
        .flatten()
}

/// Replace reserved characters with their private-use stand-ins.
#[must_use]
pub fn encode(path: &str) -> String {
    path.chars().map(|c| encoded(c).unwrap_or(c)).collect()
}

/// Undo [`encode`].
#[must_use]
pub fn decode(path: &str) -> String {
    path.chars()
        .map(|c| {
            (c as u32)
                .checked_sub(0xf000)
                .and_then(char::from_u32)
                .filter(|raw| RAW.contains(raw))
                .unwrap_or(c)
        })
        .collect()
}
