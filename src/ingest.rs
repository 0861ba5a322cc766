//! Video ingest pipeline.
//!
//! An upload is validated before anything touches the disk, then copied under
//! a random name, filed under its categories, given a thumbnail and finally
//! committed together with its category links. If any step after the copy
//! fails, or the upload future is dropped before it finishes, the files
//! written so far are removed again so the storage root never accumulates
//! videos the database does not know about.

use std::{
    collections::HashSet,
    fmt,
    io::Cursor,
    path::{Path, PathBuf},
    pin::Pin,
};

use anyhow::{Context, anyhow};
use chrono::{SecondsFormat, Utc};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    categories::{CategoryRegistry, category_key},
    error::{VideoError, VideoResult},
    metadata::{MetadataStore, NewVideo, VideoRecord},
    storage::StorageLayout,
    thumbnail::{ThumbnailExtractor, generate_thumbnail},
};

/// 100 MiB.
pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mov"];
pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_DESCRIPTION_CHARS: usize = 160;

/// Client-supplied file: its original name, the length the transport
/// reported and a reader over the bytes.
pub struct UploadedFile {
    file_name: String,
    length: u64,
    reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl UploadedFile {
    pub fn new(
        file_name: impl Into<String>,
        length: u64,
        reader: impl AsyncRead + Send + 'static,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            length,
            reader: Box::pin(reader),
        }
    }

    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let length = bytes.len() as u64;
        Self::new(file_name, length, Cursor::new(bytes))
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Debug for UploadedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedFile")
            .field("file_name", &self.file_name)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct UploadRequest {
    pub title: String,
    pub description: Option<String>,
    pub categories: Vec<String>,
    pub file: Option<UploadedFile>,
}

pub struct IngestPipeline<E> {
    store: MetadataStore,
    categories: CategoryRegistry,
    layout: StorageLayout,
    extractor: E,
}

impl<E: ThumbnailExtractor> IngestPipeline<E> {
    pub fn new(
        store: MetadataStore,
        categories: CategoryRegistry,
        layout: StorageLayout,
        extractor: E,
    ) -> Self {
        Self {
            store,
            categories,
            layout,
            extractor,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub async fn upload(&self, request: UploadRequest) -> VideoResult<VideoRecord> {
        let UploadRequest {
            title,
            description,
            categories,
            file,
        } = request;

        let file = match file {
            Some(file) if !file.is_empty() => file,
            _ => return Err(VideoError::invalid_input("No file provided")),
        };
        let extension = allowed_extension(file.file_name())?;
        if file.len() > MAX_UPLOAD_BYTES {
            return Err(VideoError::PayloadTooLarge {
                length: file.len(),
            });
        }
        let (title, description) = validate_text(&title, description.as_deref())?;

        self.layout
            .ensure_dirs()
            .await
            .context("creating storage directories")
            .map_err(VideoError::Storage)?;

        let file_name = format!("{}.{extension}", Uuid::new_v4());
        let video_path = self.layout.videos_dir().join(&file_name);
        let thumbnail_file_name = format!("{}.jpg", Uuid::new_v4());
        let thumbnail_path = self.layout.thumbnails_dir().join(&thumbnail_file_name);

        let original_name = file.file_name().to_string();
        let written = WrittenFiles::new([video_path.clone(), thumbnail_path.clone()]);
        let outcome = async {
            let copied = copy_to_disk(file, &video_path).await?;
            info!(
                original = %original_name,
                stored = %file_name,
                bytes = copied,
                "upload written to disk"
            );

            let mut resolved = Vec::new();
            for name in distinct_category_names(&categories) {
                resolved.push(self.categories.get_or_create(name).await?);
            }

            generate_thumbnail(&self.extractor, &video_path, &thumbnail_path)
                .await
                .map_err(VideoError::Storage)?;

            let new_video = NewVideo {
                title,
                description,
                file_path: StorageLayout::video_relative_path(&file_name),
                file_name: file_name.clone(),
                thumbnail_path: StorageLayout::thumbnail_relative_path(&thumbnail_file_name),
                thumbnail_file_name: thumbnail_file_name.clone(),
                uploaded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                categories: resolved,
            };
            self.store
                .call(move |store| store.insert_video(&new_video))
                .await
        }
        .await;

        match outcome {
            Ok(record) => {
                written.commit();
                info!(id = record.id, stored = %record.file_name, "video persisted");
                Ok(record)
            }
            Err(err) => {
                if let VideoError::Storage(cause) = &err {
                    error!(stored = %file_name, error = ?cause, "upload failed after write");
                }
                drop(written);
                Err(err)
            }
        }
    }
}

/// Lower-cased extension of `file_name` if it is one we accept.
fn allowed_extension(file_name: &str) -> VideoResult<String> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .ok_or(VideoError::UnsupportedMediaType)?;
    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(VideoError::UnsupportedMediaType)
    }
}

fn validate_text(title: &str, description: Option<&str>) -> VideoResult<(String, String)> {
    let title = title.trim();
    if title.is_empty() {
        return Err(VideoError::invalid_input("Title is required"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(VideoError::invalid_input(format!(
            "Title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    let description = description.map(str::trim).unwrap_or_default();
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(VideoError::invalid_input(format!(
            "Description must be at most {MAX_DESCRIPTION_CHARS} characters"
        )));
    }
    Ok((title.to_string(), description.to_string()))
}

/// Trimmed, non-blank names with case-insensitive duplicates dropped; the
/// first spelling seen wins.
fn distinct_category_names(names: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(category_key(name)))
        .collect()
}

async fn copy_to_disk(mut file: UploadedFile, path: &Path) -> VideoResult<u64> {
    let write = async {
        let mut out = tokio::fs::File::create_new(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        let copied = tokio::io::copy(&mut file.reader, &mut out)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        out.flush().await?;
        out.sync_all()
            .await
            .with_context(|| format!("syncing {}", path.display()))?;
        if copied == 0 {
            return Err(anyhow!("upload stream for {} was empty", file.file_name));
        }
        Ok(copied)
    };
    write.await.map_err(VideoError::Storage)
}

/// Files an in-flight upload may have written. Unless [`commit`] is called,
/// dropping the guard removes them, which also covers an upload future that
/// is abandoned halfway (for instance when the client disconnects).
///
/// [`commit`]: WrittenFiles::commit
struct WrittenFiles {
    paths: Vec<PathBuf>,
    committed: bool,
}

impl WrittenFiles {
    fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for WrittenFiles {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in &self.paths {
            remove_if_present(path);
        }
    }
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove orphaned file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thumbnail::testing::{FailingExtractor, FixedExtractor};
    use anyhow::Result;
    use rusqlite::Connection;
    use std::{sync::Arc, time::Duration};
    use tempfile::{TempDir, tempdir};
    use tokio::sync::Notify;

    /// Signals once extraction starts, then never finishes.
    struct HangingExtractor(Arc<Notify>);

    impl ThumbnailExtractor for HangingExtractor {
        async fn extract(&self, _video: &Path, _target: &Path) -> Result<()> {
            self.0.notify_one();
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Fixture<E> {
        _temp: TempDir,
        store: MetadataStore,
        pipeline: IngestPipeline<E>,
    }

    fn fixture<E: ThumbnailExtractor>(extractor: E) -> Fixture<E> {
        let temp = tempdir().unwrap();
        let store = MetadataStore::open(temp.path().join("videohub.db")).unwrap();
        let pipeline = IngestPipeline::new(
            store.clone(),
            CategoryRegistry::new(store.clone()),
            StorageLayout::new(temp.path()),
            extractor,
        );
        Fixture {
            _temp: temp,
            store,
            pipeline,
        }
    }

    fn request(file: Option<UploadedFile>, categories: &[&str]) -> UploadRequest {
        UploadRequest {
            title: "  Holiday  ".into(),
            description: Some(" beach day ".into()),
            categories: categories.iter().map(|name| name.to_string()).collect(),
            file,
        }
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| path.is_file())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn missing_file_is_invalid_input() {
        let fx = fixture(FailingExtractor);
        let err = fx.pipeline.upload(request(None, &[])).await.unwrap_err();
        assert!(matches!(err, VideoError::InvalidInput(_)));

        let empty = UploadedFile::from_bytes("clip.mp4", Vec::new());
        let err = fx
            .pipeline
            .upload(request(Some(empty), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, VideoError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn text_file_is_unsupported() {
        let fx = fixture(FailingExtractor);
        let file = UploadedFile::from_bytes("notes.txt", vec![0; 10]);
        let err = fx
            .pipeline
            .upload(request(Some(file), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, VideoError::UnsupportedMediaType));

        let file = UploadedFile::from_bytes("no-extension", vec![0; 10]);
        let err = fx
            .pipeline
            .upload(request(Some(file), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, VideoError::UnsupportedMediaType));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_before_any_write() {
        let fx = fixture(FailingExtractor);
        let file = UploadedFile::new("big.mp4", 101 * 1024 * 1024, Cursor::new(vec![0u8; 16]));
        let err = fx
            .pipeline
            .upload(request(Some(file), &["Music"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VideoError::PayloadTooLarge { .. }));
        assert!(!fx.pipeline.layout().videos_dir().exists());
        assert!(fx.store.list_categories().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlong_title_is_invalid_input() {
        let fx = fixture(FailingExtractor);
        let mut req = request(Some(UploadedFile::from_bytes("a.mp4", vec![1; 8])), &[]);
        req.title = "x".repeat(MAX_TITLE_CHARS + 1);
        let err = fx.pipeline.upload(req).await.unwrap_err();
        assert!(matches!(err, VideoError::InvalidInput(_)));

        let mut req = request(Some(UploadedFile::from_bytes("a.mp4", vec![1; 8])), &[]);
        req.title = "   ".into();
        assert!(matches!(
            fx.pipeline.upload(req).await.unwrap_err(),
            VideoError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn valid_upload_persists_files_and_categories() {
        let fx = fixture(FixedExtractor(b"jpeg"));
        let file = UploadedFile::from_bytes("My Clip.MP4", b"video-bytes".to_vec());
        let record = fx
            .pipeline
            .upload(request(Some(file), &["Music", "Travel"]))
            .await
            .unwrap();

        assert_eq!(record.title, "Holiday");
        assert_eq!(record.description, "beach day");
        assert!(record.file_name.ends_with(".mp4"));
        assert_ne!(record.file_name, "My Clip.MP4");
        assert!(record.thumbnail_file_name.ends_with(".jpg"));
        assert_eq!(record.categories.len(), 2);

        let layout = fx.pipeline.layout();
        let video = layout.resolve(&record.file_path).unwrap();
        let thumb = layout.resolve(&record.thumbnail_path).unwrap();
        assert_eq!(std::fs::read(video).unwrap(), b"video-bytes");
        assert_eq!(std::fs::read(thumb).unwrap(), b"jpeg");

        let conn = Connection::open(fx.store.path()).unwrap();
        let links: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM video_categories WHERE video_id = ?1",
                [record.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(links, 2);
    }

    #[tokio::test]
    async fn categories_are_deduplicated_ignoring_case_and_order() {
        let fx = fixture(FailingExtractor);
        let first = fx
            .pipeline
            .upload(request(
                Some(UploadedFile::from_bytes("a.mov", vec![1; 4])),
                &["news", " Sport ", "NEWS", "", "sport"],
            ))
            .await
            .unwrap();
        let mut names: Vec<_> = first.categories.iter().map(|c| c.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["Sport", "news"]);

        let second = fx
            .pipeline
            .upload(request(
                Some(UploadedFile::from_bytes("b.avi", vec![1; 4])),
                &["SPORT", "News"],
            ))
            .await
            .unwrap();
        let mut first_ids: Vec<_> = first.categories.iter().map(|c| c.id).collect();
        let mut second_ids: Vec<_> = second.categories.iter().map(|c| c.id).collect();
        first_ids.sort();
        second_ids.sort();
        assert_eq!(first_ids, second_ids);
        assert_eq!(fx.store.list_categories().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn thumbnail_failure_does_not_fail_upload() {
        let fx = fixture(FailingExtractor);
        let record = fx
            .pipeline
            .upload(request(Some(UploadedFile::from_bytes("a.mp4", vec![1; 4])), &[]))
            .await
            .unwrap();
        let thumb = fx.pipeline.layout().resolve(&record.thumbnail_path).unwrap();
        assert!(thumb.metadata().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn persistence_failure_removes_written_files() {
        let fx = fixture(FixedExtractor(b"jpeg"));
        Connection::open(fx.store.path())
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_videos BEFORE INSERT ON videos
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let err = fx
            .pipeline
            .upload(request(Some(UploadedFile::from_bytes("a.mp4", vec![1; 4])), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, VideoError::Storage(_)));

        let layout = fx.pipeline.layout();
        assert!(files_in(layout.videos_dir()).is_empty());
        assert!(files_in(layout.thumbnails_dir()).is_empty());
    }

    #[tokio::test]
    async fn abandoned_upload_removes_written_files() {
        let started = Arc::new(Notify::new());
        let fx = fixture(HangingExtractor(started.clone()));
        let mut upload = Box::pin(fx.pipeline.upload(request(
            Some(UploadedFile::from_bytes("a.mp4", vec![1; 4])),
            &["Music"],
        )));

        tokio::select! {
            _ = &mut upload => panic!("upload finished despite a hanging extractor"),
            _ = started.notified() => {}
            _ = tokio::time::sleep(Duration::from_secs(10)) => panic!("extractor never ran"),
        }
        let layout = fx.pipeline.layout();
        assert_eq!(files_in(layout.videos_dir()).len(), 1);

        // Equivalent to axum dropping the handler after a disconnect.
        drop(upload);
        assert!(files_in(layout.videos_dir()).is_empty());
        assert!(files_in(layout.thumbnails_dir()).is_empty());
        assert!(fx.store.list_videos().unwrap().is_empty());
    }

    #[tokio::test]
    async fn text_limits_are_inclusive() {
        let fx = fixture(FailingExtractor);
        let mut req = request(Some(UploadedFile::from_bytes("a.mp4", vec![1; 8])), &[]);
        req.title = "t".repeat(MAX_TITLE_CHARS);
        req.description = Some("d".repeat(MAX_DESCRIPTION_CHARS));
        let record = fx.pipeline.upload(req).await.unwrap();
        assert_eq!(record.title.chars().count(), MAX_TITLE_CHARS);
        assert_eq!(record.description.chars().count(), MAX_DESCRIPTION_CHARS);
    }

    #[tokio::test]
    async fn overlong_description_is_invalid_input() {
        let fx = fixture(FailingExtractor);
        let mut req = request(Some(UploadedFile::from_bytes("a.mp4", vec![1; 8])), &[]);
        req.description = Some("d".repeat(MAX_DESCRIPTION_CHARS + 1));
        let err = fx.pipeline.upload(req).await.unwrap_err();
        assert!(matches!(err, VideoError::InvalidInput(_)));
        assert_eq!(err.to_string(), "Description must be at most 160 characters");
        assert!(files_in(fx.pipeline.layout().videos_dir()).is_empty());
    }

    #[tokio::test]
    async fn file_at_size_limit_is_accepted() {
        let fx = fixture(FailingExtractor);
        let file = UploadedFile::new("exact.mp4", MAX_UPLOAD_BYTES, Cursor::new(vec![1u8; 16]));
        let record = fx.pipeline.upload(request(Some(file), &[])).await.unwrap();
        assert!(record.file_name.ends_with(".mp4"));
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        assert_eq!(allowed_extension("a.MOV").unwrap(), "mov");
        assert!(allowed_extension("a.mkv").is_err());
    }
}
