//! Thumbnail rendering for image entries.
//!
//! Sources are recognised by file extension. Rendering runs on the
//! blocking pool and results are kept in a small LRU keyed by path,
//! size and modification time, so an edited image renders again.

use std::io::Cursor;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageOutputFormat};
use lru::LruCache;
use tracing::debug;

use super::backend::{FileHandle, StorageError};
use crate::sync::MutexExt;

/// Bounding box of a rendered thumbnail.
pub const THUMBNAIL_SIZE: u32 = 200;

const JPEG_QUALITY: u8 = 80;
const MAX_SOURCE_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_CAPACITY: usize = 64;

/// Whether `name` looks like an image this build can decode.
pub fn is_image(name: &str) -> bool {
    let Some(ext) = Path::new(name).extension() else {
        return false;
    };
    matches!(
        ImageFormat::from_extension(ext),
        Some(
            ImageFormat::Png
                | ImageFormat::Jpeg
                | ImageFormat::Gif
                | ImageFormat::Bmp
                | ImageFormat::WebP
        )
    )
}

/// Decode `source` and encode an aspect-preserving JPEG no larger than
/// [`THUMBNAIL_SIZE`] on either side.
pub fn render(source: &[u8]) -> Result<Vec<u8>, StorageError> {
    let image = image::load_from_memory(source)
        .map_err(|e| StorageError::Other(format!("decode: {e}")))?;
    // JPEG has no alpha channel.
    let thumb = DynamicImage::ImageRgb8(image.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE).to_rgb8());
    let mut out = Cursor::new(Vec::new());
    thumb
        .write_to(&mut out, ImageOutputFormat::Jpeg(JPEG_QUALITY))
        .map_err(|e| StorageError::Other(format!("encode: {e}")))?;
    Ok(out.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    path: String,
    size: u64,
    modified_ms: u64,
}

pub struct ThumbnailCache {
    entries: Mutex<LruCache<Key, Bytes>>,
}

impl Default for ThumbnailCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ThumbnailCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The rendered thumbnail of `file`, stored under `path`.
    pub async fn get_or_render(
        &self,
        path: &str,
        file: &dyn FileHandle,
    ) -> Result<Bytes, StorageError> {
        let meta = file.metadata().await?;
        let key = Key {
            path: path.to_string(),
            size: meta.size,
            modified_ms: meta.modified_ms(),
        };
        let hit = self.entries.locked().get(&key).cloned();
        if let Some(hit) = hit {
            return Ok(hit);
        }
        if meta.size > MAX_SOURCE_BYTES {
            return Err(StorageError::OutOfRange);
        }

        let source = file.read(0, meta.size).await?;
        let rendered = tokio::task::spawn_blocking(move || render(&source))
            .await
            .map_err(|e| StorageError::Other(format!("render task: {e}")))??;
        debug!(%path, bytes = rendered.len(), "rendered thumbnail");

        let rendered = Bytes::from(rendered);
        self.entries.locked().put(key, rendered.clone());
        Ok(rendered)
    }

    pub fn len(&self) -> usize {
        self.entries.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        width,
        height,
        image::Rgb([200, 30, 30]),
    ));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageOutputFormat::Png).unwrap();
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::backend::MemoryBackend;

    #[test]
    fn recognises_images_by_extension() {
        assert!(is_image("cat.JPG"));
        assert!(is_image("a.png"));
        assert!(!is_image("notes.txt"));
        assert!(!is_image("README"));
    }

    #[test]
    fn render_preserves_aspect() {
        let jpeg = render(&sample_png(400, 100)).unwrap();
        let back = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((back.width(), back.height()), (200, 50));
    }

    #[test]
    fn garbage_does_not_render() {
        assert!(matches!(render(b"nope"), Err(StorageError::Other(_))));
    }

    #[tokio::test]
    async fn cache_reuses_renders() {
        let backend = MemoryBackend::new();
        backend.add_file("/p.png", sample_png(50, 50));
        let file = backend.root().file("p.png", false).await.unwrap();

        let cache = ThumbnailCache::new(4);
        let first = cache.get_or_render("/p.png", file.as_ref()).await.unwrap();
        let second = cache.get_or_render("/p.png", file.as_ref()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }
}
