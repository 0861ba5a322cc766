//! Thumbnail extraction.
//!
//! The real work is delegated to an external `ffmpeg` binary. Whatever happens
//! there, [`generate_thumbnail`] leaves a JPEG at the target path: a captured
//! frame when extraction works, a blank placeholder otherwise.

use std::{
    future::Future,
    io::Cursor,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use image::{ImageFormat, Rgb, RgbImage};
use tokio::{process::Command, time};
use tracing::{debug, warn};

/// Edge length of generated thumbnails, in pixels.
pub const THUMBNAIL_SIZE: u32 = 256;

/// Seek offsets tried in order; the second covers clips shorter than a second.
const SEEK_OFFSETS: [&str; 2] = ["1", "0"];

/// Produces a still image for a video. Implementations may fail freely;
/// callers go through [`generate_thumbnail`], which absorbs failures.
pub trait ThumbnailExtractor: Send + Sync {
    fn extract(&self, video: &Path, target: &Path) -> impl Future<Output = Result<()>> + Send;
}

/// Captures a frame with `ffmpeg` and scales it to a square thumbnail.
#[derive(Debug, Clone)]
pub struct FfmpegThumbnailer {
    binary: PathBuf,
    timeout: Duration,
}

impl FfmpegThumbnailer {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn capture_at(&self, video: &Path, target: &Path, offset: &str) -> Result<()> {
        let scale = format!("scale={THUMBNAIL_SIZE}:{THUMBNAIL_SIZE}");
        let command = Command::new(&self.binary)
            .args(["-y", "-loglevel", "error", "-ss", offset, "-i"])
            .arg(video.as_os_str())
            .args(["-frames:v", "1", "-vf", scale.as_str()])
            .arg(target.as_os_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = time::timeout(self.timeout, command)
            .await
            .map_err(|_| anyhow!("ffmpeg timed out after {:?}", self.timeout))?
            .with_context(|| format!("spawning {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("ffmpeg exited with {}: {}", output.status, stderr.trim());
        }

        let written = tokio::fs::metadata(target)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if written == 0 {
            bail!("ffmpeg produced no image at {}", target.display());
        }
        Ok(())
    }
}

impl ThumbnailExtractor for FfmpegThumbnailer {
    async fn extract(&self, video: &Path, target: &Path) -> Result<()> {
        let mut last_error = anyhow!("no seek offsets attempted");
        for offset in SEEK_OFFSETS {
            match self.capture_at(video, target, offset).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(offset, error = %err, "frame capture attempt failed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThumbnailOutcome {
    Extracted,
    Fallback,
}

/// Guarantees a thumbnail file at `target`. Extraction failures are logged
/// and replaced by a blank image; the only error returned is a failure to
/// write that placeholder.
pub async fn generate_thumbnail<E: ThumbnailExtractor>(
    extractor: &E,
    video: &Path,
    target: &Path,
) -> Result<()> {
    produce(extractor, video, target).await.map(|_| ())
}

async fn produce<E: ThumbnailExtractor>(
    extractor: &E,
    video: &Path,
    target: &Path,
) -> Result<ThumbnailOutcome> {
    let failure = match extractor.extract(video, target).await {
        Ok(()) if is_non_empty_file(target).await => return Ok(ThumbnailOutcome::Extracted),
        Ok(()) => anyhow!("extractor reported success but left no file"),
        Err(err) => err,
    };

    warn!(
        video = %video.display(),
        error = %failure,
        "thumbnail extraction failed; writing placeholder"
    );
    write_placeholder(target).await?;
    Ok(ThumbnailOutcome::Fallback)
}

async fn is_non_empty_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

async fn write_placeholder(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = placeholder_jpeg()?;
    tokio::fs::write(target, bytes)
        .await
        .with_context(|| format!("writing placeholder thumbnail {}", target.display()))
}

/// A blank white square JPEG.
fn placeholder_jpeg() -> Result<Vec<u8>> {
    let image = RgbImage::from_pixel(THUMBNAIL_SIZE, THUMBNAIL_SIZE, Rgb([255, 255, 255]));
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Jpeg)
        .context("encoding placeholder thumbnail")?;
    Ok(buffer.into_inner())
}
