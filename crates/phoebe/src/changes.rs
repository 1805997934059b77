//! Change-log entry codec and tail-first reads.
//!
//! One entry per line, fields separated by ASCII unit-separator (0x1F),
//! records terminated by LF. The log is append-only; readers walk it
//! backward and skip a torn final line.

use std::net::IpAddr;
use std::path::Path;

use smol_str::SmolStr;

use crate::error::ServerError;

/// Field separator inside a change-log line.
pub const FIELD_SEPARATOR: char = '\u{1f}';

/// One committed write, as recorded in `changes.log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Seconds since the epoch, UTC.
    pub timestamp: i64,
    /// Page or file name, percent-decoded.
    pub name: SmolStr,
    /// Page revision; 0 marks a file write.
    pub revision: u32,
    /// Four-octal-digit contributor code.
    pub code: SmolStr,
}

impl ChangeEntry {
    /// Serialize to one log line, LF-terminated.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}\n",
            self.timestamp,
            self.name,
            self.revision,
            self.code,
            sep = FIELD_SEPARATOR,
        )
    }

    /// Parse one log line; `None` for torn or foreign lines.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim_end_matches('\n').split(FIELD_SEPARATOR);
        let timestamp = fields.next()?.parse().ok()?;
        let name = fields.next()?;
        let revision = fields.next()?.parse().ok()?;
        let code = fields.next()?;
        if name.is_empty() || fields.next().is_some() {
            return None;
        }
        Some(Self {
            timestamp,
            name: SmolStr::new(name),
            revision,
            code: SmolStr::new(code),
        })
    }

    /// Calendar date of the entry, UTC.
    #[must_use]
    pub fn date(&self) -> time::Date {
        time::OffsetDateTime::from_unix_timestamp(self.timestamp)
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
            .date()
    }

    /// Whether this entry records a binary file write.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.revision == 0
    }
}

/// Read entries newest first, skipping `offset`, yielding at most `limit`.
///
/// A missing log is an empty history, not an error.
pub fn read_backward(
    path: &Path,
    limit: usize,
    offset: usize,
) -> Result<Vec<ChangeEntry>, ServerError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(ServerError::Store(SmolStr::new(format!(
                "{}: {err}",
                path.display()
            ))))
        }
    };
    Ok(text
        .lines()
        .rev()
        .filter_map(ChangeEntry::parse)
        .skip(offset)
        .take(limit)
        .collect())
}

/// Newest entry for `name` with a page revision, if any.
pub fn last_page_revision(path: &Path, name: &str) -> Result<Option<u32>, ServerError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ServerError::Store(SmolStr::new(format!(
                "{}: {err}",
                path.display()
            ))))
        }
    };
    Ok(text
        .lines()
        .rev()
        .filter_map(ChangeEntry::parse)
        .find(|entry| entry.name == name && entry.revision > 0)
        .map(|entry| entry.revision))
}

/// Derive the four-octal-digit contributor code from a client address.
///
/// Stable per IP and deliberately low-entropy (32-bit hash mod 8^4), so
/// unrelated visitors may share a code.
#[must_use]
pub fn contributor_code(addr: &IpAddr) -> SmolStr {
    let hash = crc32fast::hash(addr.to_string().as_bytes());
    SmolStr::new(format!("{:04o}", hash % 0o10000))
}
