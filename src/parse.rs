use std::str::{self, FromStr};

use crate::{Error, Result};

/// Parses the entire contents of a cgroup pseudo-file into a value, stripping the trailing
/// newline the kernel appends.
pub(crate) fn parse<T>(bytes: &[u8], file: &str) -> Result<T>
where
    T: FromStr,
{
    let s = str::from_utf8(bytes).map_err(|_| Error::parse(file, "<non-utf8>"))?;
    let s = s.trim();
    s.parse::<T>().map_err(|_| Error::parse(file, s))
}

/// Parses every whitespace-separated token of a pseudo-file into a value.
pub(crate) fn parse_vec<T>(bytes: &[u8], file: &str) -> Result<Vec<T>>
where
    T: FromStr,
{
    let s = str::from_utf8(bytes).map_err(|_| Error::parse(file, "<non-utf8>"))?;
    s.split_whitespace()
        .map(|tok| tok.parse::<T>().map_err(|_| Error::parse(file, tok)))
        .collect()
}

/// Looks up `key` in a flat keyed-stat file (`cpuacct.stat`, `memory.stat`: one `<key> <value>`
/// pair per line) and parses the value.
///
/// Returns `None` when the key is absent or its value does not parse; accounting callers turn
/// that into an UNKNOWN field rather than an error.
pub(crate) fn stat_value(content: &str, key: &str) -> Option<u64> {
    for line in content.lines() {
        let mut entry = line.split_whitespace();
        if entry.next() == Some(key) {
            return entry.next().and_then(|v| v.parse::<u64>().ok());
        }
    }
    None
}
