//! Record Model
//!
//! A record is an opaque byte sequence terminated by a newline. The first 26
//! bytes are a ULID in canonical Crockford base32 followed by a single space,
//! then the payload:
//!
//! ```text
//! 01HV3Q8Z2JK4N9XWPB5T6C7D8E some payload bytes\n
//! ```
//!
//! The ingest tier never parses records; it only preserves framing. The store
//! tier parses the ULID prefix to name segments by their record range and
//! rejects violations with `MalformedRecord`.

use ulid::Ulid;

use crate::error::{Error, Result};

/// Length of a canonical ULID string.
pub const ULID_LEN: usize = 26;

/// Parse and validate the ULID prefix of a single record line.
///
/// The line may or may not include its trailing newline. Fails with
/// `MalformedRecord` when the line is too short, the separator is missing,
/// or the prefix is not a valid ULID.
pub fn record_ulid(line: &[u8]) -> Result<Ulid> {
    if line.len() < ULID_LEN + 1 || line[ULID_LEN] != b' ' {
        return Err(Error::MalformedRecord(preview(line)));
    }
    let prefix = std::str::from_utf8(&line[..ULID_LEN])
        .map_err(|_| Error::MalformedRecord(preview(line)))?;
    Ulid::from_string(prefix).map_err(|_| Error::MalformedRecord(preview(line)))
}

/// Iterate the records of a segment body, yielding each line without its
/// trailing newline. A final unterminated line is yielded as-is.
pub fn records(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    body.split(|b| *b == b'\n').filter(|line| !line.is_empty())
}

/// Scan a segment body, returning the lowest and highest record ULIDs and the
/// record count. Fails with `MalformedRecord` on the first bad record; an
/// empty body is also malformed because a segment always holds at least one
/// record.
pub fn scan(body: &[u8]) -> Result<(Ulid, Ulid, usize)> {
    let mut low: Option<Ulid> = None;
    let mut high: Option<Ulid> = None;
    let mut count = 0usize;
    for line in records(body) {
        let id = record_ulid(line)?;
        low = Some(low.map_or(id, |l| l.min(id)));
        high = Some(high.map_or(id, |h| h.max(id)));
        count += 1;
    }
    match (low, high) {
        (Some(low), Some(high)) => Ok((low, high, count)),
        _ => Err(Error::MalformedRecord("empty segment".to_string())),
    }
}

fn preview(line: &[u8]) -> String {
    let n = line.len().min(40);
    String::from_utf8_lossy(&line[..n]).into_owned()
}
