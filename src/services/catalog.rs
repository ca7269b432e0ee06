//! Folder listings.
//!
//! Listings are best-effort: an object whose head records cannot be read is
//! left out and named in `skippedFiles`, and a folder that cannot be listed
//! at all is left out of `/folders`. Only a missing requested folder fails.

use super::{
    layout::{HEAD_RECORDS, ObjectHead},
    store_service::{StoreError, StoreResult, StoreService},
};
use crate::models::{
    folder::{FolderListing, FolderSummary, SortSpec},
    object::FileEntry,
};
use crate::transport::{ChannelInfo, ThreadInfo};
use futures::{StreamExt, stream};
use tracing::{debug, warn};

impl StoreService {
    /// Contents of one folder.
    pub async fn list_folder(&self, folder_id: &str, sort: SortSpec) -> StoreResult<FolderListing> {
        let channel = self.transport.get_channel(folder_id).await?;
        self.listing_for(&channel, sort).await
    }

    /// Every folder of the collection with its contents, in platform order.
    pub async fn list_folders(&self, sort: SortSpec) -> StoreResult<Vec<FolderSummary>> {
        let channels = self.transport.list_channels().await?;
        let listings: Vec<(ChannelInfo, StoreResult<FolderListing>)> = stream::iter(channels)
            .map(|channel| async move {
                let listing = self.listing_for(&channel, sort).await;
                (channel, listing)
            })
            .buffered(self.settings.list_concurrency.max(1))
            .collect()
            .await;

        Ok(listings
            .into_iter()
            .filter_map(|(channel, listing)| match listing {
                Ok(listing) => Some(FolderSummary {
                    id: channel.id,
                    listing,
                }),
                Err(err) => {
                    warn!(folder_id = %channel.id, error = %err, "skipping unreadable folder");
                    None
                }
            })
            .collect())
    }

    async fn listing_for(&self, channel: &ChannelInfo, sort: SortSpec) -> StoreResult<FolderListing> {
        let threads = self.transport.list_threads(&channel.id).await?;
        let entries: Vec<(String, StoreResult<FileEntry>)> = stream::iter(threads)
            .filter(|thread| {
                let writing = self.locks.is_locked(&channel.id, &thread.id);
                if writing {
                    debug!(object_id = %thread.id, "hiding object still being written");
                }
                futures::future::ready(!writing)
            })
            .map(|thread| async move {
                let entry = self.file_entry(&channel.id, &thread).await;
                (thread.id, entry)
            })
            .buffered(self.settings.list_concurrency.max(1))
            .collect()
            .await;

        let mut files = Vec::with_capacity(entries.len());
        let mut skipped = Vec::new();
        for (object_id, entry) in entries {
            match entry {
                Ok(entry) => files.push(entry),
                Err(err) => {
                    warn!(
                        folder_id = %channel.id,
                        object_id = %object_id,
                        error = %err,
                        "skipping unreadable object"
                    );
                    skipped.push(object_id);
                }
            }
        }
        sort.apply(&mut files);
        Ok(FolderListing::new(channel.name.clone(), files, skipped))
    }

    async fn file_entry(&self, folder_id: &str, thread: &ThreadInfo) -> StoreResult<FileEntry> {
        let records = self
            .transport
            .fetch_head_records(&thread.id, HEAD_RECORDS)
            .await?;
        let head = ObjectHead::parse(records).map_err(|err| StoreError::layout(&thread.id, err))?;
        let preview_url = head.preview.map(|preview| {
            preview
                .url
                .unwrap_or_else(|| format!("/preview/{folder_id}/{}", thread.id))
        });
        Ok(FileEntry {
            file_id: thread.id.clone(),
            file_name: head.name,
            file_size: head.size.size,
            date_created: thread.created_at,
            preview_url,
            etag: head.size.etag,
        })
    }
}
