//! Represents an object (file) stored in a folder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored object as shown in a folder listing.
///
/// Only metadata; the bytes live in the object's part attachments.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileEntry {
    /// Identifier of the thread holding the object.
    #[serde(rename = "fileID")]
    pub file_id: String,

    /// Display name, as recorded in the first record.
    #[serde(rename = "fileName")]
    pub file_name: String,

    /// Declared size in bytes.
    #[serde(rename = "fileSize")]
    pub file_size: u64,

    /// Creation time of the thread; objects are never modified afterwards.
    #[serde(rename = "dateCreated")]
    pub date_created: DateTime<Utc>,

    #[serde(rename = "previewUrl", skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,

    /// MD5 of the whole object, for objects stored with one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Response body of a successful upload.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UploadReceipt {
    pub message: String,
    pub filename: String,
    pub id: String,
}
