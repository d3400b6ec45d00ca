//! Lazy thumbnail generation for image assets.
//!
//! Previews are derived data: regenerated when the asset's content timestamp
//! moves past the cached copy, persisted beside the asset as
//! `<id>_thumbnail.png`, and safe to discard at any time. Failures degrade
//! to `ThumbnailUnavailable` and never fail the asset's own operations.

use std::io::Cursor;
use std::num::NonZeroUsize;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use lru::LruCache;

use crate::error::{LibraryError, Result};
use crate::model::{AssetId, AssetRecord};
use crate::store::LibraryStore;

/// Extensions the preview pipeline will attempt to decode.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff", "tif", "ico", "avif", "jfif", "pjpeg",
    "pjp",
];

/// Short edge of a generated preview, in pixels.
const THUMB_EDGE: u32 = 320;

const CACHE_ENTRIES: usize = 64;

pub fn is_image_ext(ext: &str) -> bool {
    IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e))
}

/// Decode image bytes and produce a PNG preview whose short edge is at most
/// `THUMB_EDGE` pixels. Images already smaller pass through at native size.
pub fn render_thumbnail(data: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data)
        .map_err(|e| LibraryError::ThumbnailUnavailable(e.to_string()))?;
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(LibraryError::ThumbnailUnavailable("empty image".into()));
    }
    let short = w.min(h);
    let img = if short > THUMB_EDGE {
        let scale = THUMB_EDGE as f64 / short as f64;
        img.resize(
            (w as f64 * scale).round() as u32,
            (h as f64 * scale).round() as u32,
            FilterType::Lanczos3,
        )
    } else {
        img
    };
    let img = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| LibraryError::ThumbnailUnavailable(e.to_string()))?;
    Ok(out)
}

struct CachedThumb {
    content_mtime: i64,
    png: Vec<u8>,
}

/// Preview server with an in-memory LRU keyed by asset id. Entries are
/// validated against the asset's content timestamp on every request.
pub struct Thumbnailer {
    cache: LruCache<AssetId, CachedThumb>,
}

impl Thumbnailer {
    pub fn new() -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(CACHE_ENTRIES).unwrap()),
        }
    }

    /// Serve the preview for an asset, regenerating from current binary
    /// content when the cached copy is missing or stale. The generated PNG
    /// is also persisted beside the asset; persistence failures are logged
    /// and ignored since the cache copy can still be served.
    pub fn preview(&mut self, store: &LibraryStore, asset: &AssetRecord) -> Result<Vec<u8>> {
        if !is_image_ext(&asset.ext) {
            return Err(LibraryError::ThumbnailUnavailable(format!(
                "no preview for .{} assets",
                asset.ext
            )));
        }
        if let Some(hit) = self.cache.get(&asset.id) {
            if hit.content_mtime == asset.mtime {
                return Ok(hit.png.clone());
            }
        }

        let data = store.read_content_full(asset)?;
        let png = render_thumbnail(&data)?;
        if let Err(e) = store.write_thumbnail(&asset.id, &png) {
            tracing::warn!("could not persist thumbnail for {}: {}", asset.id, e);
        }
        self.cache.put(
            asset.id.clone(),
            CachedThumb {
                content_mtime: asset.mtime,
                png: png.clone(),
            },
        );
        Ok(png)
    }

    /// Drop the cached preview after a content write.
    pub fn invalidate(&mut self, id: &str) {
        self.cache.pop(id);
    }
}

impl Default for Thumbnailer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            w,
            h,
            image::Rgb([120, 30, 200]),
        ));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png).unwrap();
        out
    }

    fn asset(id: &str, ext: &str, mtime: i64) -> AssetRecord {
        serde_json::from_value(serde_json::json!({
            "id": id, "name": "pic", "ext": ext, "mtime": mtime,
        }))
        .unwrap()
    }

    #[test]
    fn renders_and_scales_down() {
        let png = render_thumbnail(&png_bytes(800, 400)).unwrap();
        let thumb = image::load_from_memory(&png).unwrap();
        assert_eq!(thumb.dimensions().1, THUMB_EDGE);
        assert_eq!(thumb.dimensions().0, 640);
    }

    #[test]
    fn small_images_keep_their_size() {
        let png = render_thumbnail(&png_bytes(16, 12)).unwrap();
        let thumb = image::load_from_memory(&png).unwrap();
        assert_eq!(thumb.dimensions(), (16, 12));
    }

    #[test]
    fn garbage_bytes_degrade_cleanly() {
        assert!(matches!(
            render_thumbnail(b"definitely not an image"),
            Err(LibraryError::ThumbnailUnavailable(_))
        ));
    }

    #[test]
    fn preview_caches_until_content_changes() {
        let dir = TempDir::new().unwrap();
        let store = LibraryStore::new(dir.path());
        let rec = asset("A1", "png", 100);
        store.write_content(&rec, 0, &png_bytes(64, 64)).unwrap();

        let mut thumbs = Thumbnailer::new();
        let first = thumbs.preview(&store, &rec).unwrap();
        assert!(store.thumbnail_path("A1").exists());

        // underlying bytes change without a timestamp move: cache still wins
        store.truncate_content(&rec, 0).unwrap();
        store.write_content(&rec, 0, &png_bytes(32, 32)).unwrap();
        assert_eq!(thumbs.preview(&store, &rec).unwrap(), first);

        // a newer content timestamp forces regeneration
        let newer = asset("A1", "png", 200);
        let second = thumbs.preview(&store, &newer).unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn non_image_assets_have_no_preview() {
        let dir = TempDir::new().unwrap();
        let store = LibraryStore::new(dir.path());
        let mut thumbs = Thumbnailer::new();
        assert!(matches!(
            thumbs.preview(&store, &asset("A2", "pdf", 1)),
            Err(LibraryError::ThumbnailUnavailable(_))
        ));
    }
}
