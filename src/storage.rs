//! On-disk layout of the storage root.
//!
//! Uploaded videos live in `<root>/UploadedVideos` and their thumbnails in the
//! nested `<root>/UploadedVideos/thumbnails`. The database only records paths
//! relative to the root (always `/`-separated) so the root can be moved
//! without rewriting rows.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

pub const VIDEOS_SUBDIR: &str = "UploadedVideos";
pub const THUMBNAILS_SUBDIR: &str = "thumbnails";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    videos: PathBuf,
    thumbnails: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let videos = root.join(VIDEOS_SUBDIR);
        let thumbnails = videos.join(THUMBNAILS_SUBDIR);
        Self {
            root,
            videos,
            thumbnails,
        }
    }

    pub fn videos_dir(&self) -> &Path {
        &self.videos
    }

    pub fn thumbnails_dir(&self) -> &Path {
        &self.thumbnails
    }

    /// Creates both content directories. Safe to call concurrently and on
    /// every upload; existing directories are left alone.
    pub async fn ensure_dirs(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.thumbnails).await
    }

    pub fn video_relative_path(file_name: &str) -> String {
        format!("{VIDEOS_SUBDIR}/{file_name}")
    }

    pub fn thumbnail_relative_path(file_name: &str) -> String {
        format!("{VIDEOS_SUBDIR}/{THUMBNAILS_SUBDIR}/{file_name}")
    }

    /// Maps a stored relative path back onto the root. Returns `None` for
    /// empty, absolute or `..`-bearing paths so a tampered row can never
    /// point outside the storage root.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        if relative.trim().is_empty() {
            return None;
        }
        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn thumbnails_nest_under_videos() {
        let layout = StorageLayout::new("/srv/media");
        assert_eq!(layout.videos_dir(), Path::new("/srv/media/UploadedVideos"));
        assert_eq!(
            layout.thumbnails_dir(),
            Path::new("/srv/media/UploadedVideos/thumbnails")
        );
    }

    #[test]
    fn relative_paths_round_trip_through_resolve() {
        let layout = StorageLayout::new("/srv/media");
        let rel = StorageLayout::thumbnail_relative_path("abc.jpg");
        assert_eq!(rel, "UploadedVideos/thumbnails/abc.jpg");
        assert_eq!(
            layout.resolve(&rel).unwrap(),
            PathBuf::from("/srv/media/UploadedVideos/thumbnails/abc.jpg")
        );
    }

    #[test]
    fn resolve_rejects_escapes() {
        let layout = StorageLayout::new("/srv/media");
        assert!(layout.resolve("../etc/passwd").is_none());
        assert!(layout.resolve("/etc/passwd").is_none());
        assert!(layout.resolve("UploadedVideos/../../x").is_none());
        assert!(layout.resolve("  ").is_none());
    }

    #[tokio::test]
    async fn ensure_dirs_is_idempotent() {
        let temp = tempdir().unwrap();
        let layout = StorageLayout::new(temp.path());
        layout.ensure_dirs().await.unwrap();
        layout.ensure_dirs().await.unwrap();
        assert!(layout.thumbnails_dir().is_dir());
    }
}
