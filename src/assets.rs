//! Read path: resolves a video id to the files stored for it.

use tokio::fs::File;
use tracing::debug;

use crate::{
    error::{VideoError, VideoResult},
    metadata::{MetadataStore, VideoRecord},
    storage::StorageLayout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Video,
    Thumbnail,
}

/// An opened file positioned at offset 0. Each call hands out a fresh handle,
/// so concurrent readers never share a cursor.
#[derive(Debug)]
pub struct StoredAsset {
    pub file: File,
    pub len: u64,
    /// Name the file was stored under; its extension drives the content type.
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct AssetRetrieval {
    store: MetadataStore,
    layout: StorageLayout,
}

impl AssetRetrieval {
    pub fn new(store: MetadataStore, layout: StorageLayout) -> Self {
        Self { store, layout }
    }

    pub async fn list_videos(&self) -> VideoResult<Vec<VideoRecord>> {
        self.store.call(|store| store.list_videos()).await
    }

    pub async fn open_video(&self, id: i64) -> VideoResult<StoredAsset> {
        self.open(id, AssetKind::Video).await
    }

    pub async fn open_thumbnail(&self, id: i64) -> VideoResult<StoredAsset> {
        self.open(id, AssetKind::Thumbnail).await
    }

    /// Unknown ids, files removed out-of-band and stored paths that would
    /// leave the storage root all collapse into `NotFound`.
    pub async fn open(&self, id: i64, kind: AssetKind) -> VideoResult<StoredAsset> {
        let record = self
            .store
            .call(move |store| store.get_video(id))
            .await?
            .ok_or(VideoError::NotFound)?;

        let (file_name, relative) = match kind {
            AssetKind::Video => (record.file_name, record.file_path),
            AssetKind::Thumbnail => (record.thumbnail_file_name, record.thumbnail_path),
        };
        let path = self
            .layout
            .resolve(&relative)
            .ok_or(VideoError::NotFound)?;

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                debug!(id, ?kind, path = %path.display(), error = %err, "stored asset unavailable");
                return Err(VideoError::NotFound);
            }
        };
        let metadata = file.metadata().await.map_err(|_| VideoError::NotFound)?;
        if !metadata.is_file() {
            return Err(VideoError::NotFound);
        }

        Ok(StoredAsset {
            file,
            len: metadata.len(),
            file_name,
        })
    }
}
