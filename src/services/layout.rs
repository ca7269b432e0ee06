//! Record layout of a stored object.
//!
//! A thread holding an object reads, oldest first:
//!
//! ```text
//! 1. <display name>
//! 2. <size> bytes; <n> parts; md5 <hex>
//! 3. "Preview" + one image attachment | "No preview available"
//! 4.. one attachment per part, in byte order
//! ```
//!
//! Objects written before the part count and digest were added carry a bare
//! `<size> bytes` size record and possibly no third record; they still parse.

use crate::transport::{Attachment, Record};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const PREVIEW_MARKER: &str = "Preview";
pub const NO_PREVIEW_MARKER: &str = "No preview available";

/// Records needed to describe an object without its parts.
pub const HEAD_RECORDS: usize = 3;

/// Characters of the display name used for the thread title.
pub const THREAD_NAME_LIMIT: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("object is missing its {0} record")]
    MissingRecord(&'static str),
    #[error("malformed size record `{0}`")]
    InvalidSize(String),
    #[error("expected {expected} parts, found {found}")]
    PartCountMismatch { expected: u32, found: usize },
    #[error("object has no parts")]
    NoParts,
}

/// The second record: declared size plus the explicit part count and digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeRecord {
    pub size: u64,
    pub parts: Option<u32>,
    pub etag: Option<String>,
}

impl SizeRecord {
    pub fn new(size: u64, parts: u32, etag: impl Into<String>) -> Self {
        Self {
            size,
            parts: Some(parts),
            etag: Some(etag.into()),
        }
    }
}

impl fmt::Display for SizeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.size)?;
        if let Some(parts) = self.parts {
            write!(f, "; {parts} parts")?;
        }
        if let Some(etag) = &self.etag {
            write!(f, "; md5 {etag}")?;
        }
        Ok(())
    }
}

impl FromStr for SizeRecord {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LayoutError::InvalidSize(s.to_string());
        let mut fields = s.split(';').map(str::trim);

        let size = fields
            .next()
            .and_then(|f| f.strip_suffix(" bytes"))
            .and_then(|n| n.trim().parse::<u64>().ok())
            .ok_or_else(invalid)?;

        let mut record = SizeRecord {
            size,
            parts: None,
            etag: None,
        };
        for field in fields {
            if let Some(count) = field
                .strip_suffix(" parts")
                .or_else(|| field.strip_suffix(" part"))
            {
                record.parts = Some(count.trim().parse().map_err(|_| invalid())?);
            } else if let Some(digest) = field.strip_prefix("md5 ") {
                record.etag = Some(digest.trim().to_string());
            }
        }
        Ok(record)
    }
}

/// File name a part is uploaded under. Cosmetic only; reads rely on order.
pub fn part_name(name: &str, index: usize, total: usize) -> String {
    if total == 1 {
        name.to_string()
    } else {
        format!("{name} Part {}.txt", index + 1)
    }
}

/// Thread title for an object: the first characters of its name.
pub fn thread_name(name: &str) -> String {
    name.chars().take(THREAD_NAME_LIMIT).collect()
}

fn is_preview(record: &Record) -> bool {
    record.content == PREVIEW_MARKER && record.attachments.len() == 1
}

fn sort_by_creation(records: &mut [Record]) {
    records.sort_by_key(|r| r.order_key);
}

/// Name, size and preview of an object, read from its first records.
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub name: String,
    pub size: SizeRecord,
    pub preview: Option<Attachment>,
}

impl ObjectHead {
    pub fn parse(mut records: Vec<Record>) -> Result<Self, LayoutError> {
        sort_by_creation(&mut records);
        Self::from_sorted(&records)
    }

    fn from_sorted(records: &[Record]) -> Result<Self, LayoutError> {
        let name = records
            .first()
            .ok_or(LayoutError::MissingRecord("name"))?
            .content
            .clone();
        let size = records
            .get(1)
            .ok_or(LayoutError::MissingRecord("size"))?
            .content
            .parse::<SizeRecord>()?;
        let preview = records
            .get(2)
            .filter(|r| is_preview(r))
            .and_then(|r| r.attachments.first().cloned());
        Ok(Self {
            name,
            size,
            preview,
        })
    }
}

/// A complete object: head plus its parts in byte order.
#[derive(Debug, Clone)]
pub struct ObjectLayout {
    pub head: ObjectHead,
    pub parts: Vec<Attachment>,
}

impl ObjectLayout {
    /// Interpret a thread's records, in whatever order the transport returned them.
    pub fn parse(mut records: Vec<Record>) -> Result<Self, LayoutError> {
        sort_by_creation(&mut records);
        let head = ObjectHead::from_sorted(&records)?;

        let parts: Vec<Attachment> = records
            .iter()
            .skip(2)
            .enumerate()
            .filter(|(i, r)| !(*i == 0 && (is_preview(r) || r.content == NO_PREVIEW_MARKER)))
            .flat_map(|(_, r)| r.attachments.iter().cloned())
            .collect();

        if let Some(expected) = head.size.parts {
            if parts.len() != expected as usize {
                return Err(LayoutError::PartCountMismatch {
                    expected,
                    found: parts.len(),
                });
            }
        }
        if parts.is_empty() {
            return Err(LayoutError::NoParts);
        }
        Ok(Self { head, parts })
    }

    pub fn is_single_part(&self) -> bool {
        self.parts.len() == 1
    }
}
