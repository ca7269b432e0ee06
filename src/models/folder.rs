//! Folders and their listings.

use super::object::FileEntry;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A folder as returned on creation or rename.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Folder {
    pub id: String,
    pub name: String,
}

/// Contents of one folder.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FolderListing {
    #[serde(rename = "folderName")]
    pub folder_name: String,

    /// Sum of the declared sizes of `files`, recomputed on every listing.
    #[serde(rename = "folderSize")]
    pub folder_size: u64,

    pub files: Vec<FileEntry>,

    /// Objects whose records could not be read and were left out.
    #[serde(rename = "skippedFiles", default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_files: Vec<String>,
}

impl FolderListing {
    pub fn new(folder_name: String, files: Vec<FileEntry>, skipped_files: Vec<String>) -> Self {
        Self {
            folder_size: files.iter().map(|f| f.file_size).sum(),
            folder_name,
            files,
            skipped_files,
        }
    }
}

/// An entry of `GET /folders`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FolderSummary {
    pub id: String,
    #[serde(flatten)]
    pub listing: FolderListing,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Name,
    Size,
    Date,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Ordering requested by a listing query. No key keeps creation order.
#[derive(Deserialize, Clone, Copy, Debug, Default)]
pub struct SortSpec {
    pub sort: Option<SortKey>,
    #[serde(default)]
    pub order: SortOrder,
}

impl SortSpec {
    pub fn apply(&self, files: &mut [FileEntry]) {
        let Some(key) = self.sort else {
            return;
        };
        let compare = |a: &FileEntry, b: &FileEntry| -> Ordering {
            match key {
                SortKey::Name => a.file_name.to_lowercase().cmp(&b.file_name.to_lowercase()),
                SortKey::Size => a.file_size.cmp(&b.file_size),
                SortKey::Date => a.date_created.cmp(&b.date_created),
            }
        };
        match self.order {
            SortOrder::Asc => files.sort_by(compare),
            SortOrder::Desc => files.sort_by(|a, b| compare(b, a)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(name: &str, size: u64, day: u32) -> FileEntry {
        FileEntry {
            file_id: name.to_string(),
            file_name: name.to_string(),
            file_size: size,
            date_created: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            preview_url: None,
            etag: None,
        }
    }

    fn names(files: &[FileEntry]) -> Vec<&str> {
        files.iter().map(|f| f.file_name.as_str()).collect()
    }

    #[test]
    fn sorting_by_each_key() {
        let spec = |sort, order| SortSpec {
            sort: Some(sort),
            order,
        };
        let mut files = vec![
            entry("b.txt", 1, 3),
            entry("C.txt", 30, 1),
            entry("a.txt", 20, 2),
        ];

        spec(SortKey::Name, SortOrder::Asc).apply(&mut files);
        assert_eq!(names(&files), ["a.txt", "b.txt", "C.txt"]);

        spec(SortKey::Size, SortOrder::Desc).apply(&mut files);
        assert_eq!(names(&files), ["C.txt", "a.txt", "b.txt"]);

        spec(SortKey::Date, SortOrder::Asc).apply(&mut files);
        assert_eq!(names(&files), ["C.txt", "a.txt", "b.txt"]);
    }

    #[test]
    fn no_sort_key_keeps_order() {
        let mut files = vec![entry("b", 1, 1), entry("a", 2, 2)];
        SortSpec::default().apply(&mut files);
        assert_eq!(names(&files), ["b", "a"]);
    }

    #[test]
    fn listing_size_is_the_sum_of_declared_sizes() {
        let listing = FolderListing::new(
            "docs".into(),
            vec![entry("a", 10, 1), entry("b", 32, 2)],
            vec![],
        );
        assert_eq!(listing.folder_size, 42);

        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["folderName"], "docs");
        assert_eq!(json["files"][0]["fileID"], "a");
        assert!(json.get("skippedFiles").is_none());
    }
}
