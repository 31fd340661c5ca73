//! Thumbnail derivation for newly stored images.

use crate::handler::{EventHandler, HandlerError};
use crate::model::ObjectCreatedEvent;
use crate::store::BlobStore;
use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Default thumbnail width in pixels
pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 150;

const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// Writes one resized JPEG per source object.
///
/// The derivative lives under the same key in the derivative store (with an
/// optional prefix), so any reader can compute its location from the source
/// key alone. Re-running for the same key rewrites identical bytes.
pub struct ThumbnailGenerator {
    sources: Arc<dyn BlobStore>,
    derivatives: Arc<dyn BlobStore>,
    target_width: u32,
    key_prefix: String,
}

impl ThumbnailGenerator {
    pub fn new(sources: Arc<dyn BlobStore>, derivatives: Arc<dyn BlobStore>) -> Self {
        Self {
            sources,
            derivatives,
            target_width: DEFAULT_THUMBNAIL_WIDTH,
            key_prefix: String::new(),
        }
    }

    pub fn with_target_width(mut self, width: u32) -> Self {
        self.target_width = width.max(1);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Location of the derivative for a source key
    pub fn derivative_key(&self, source_key: &str) -> String {
        format!("{}{}", self.key_prefix, source_key)
    }

    /// Decode, resize to the target width and re-encode as JPEG.
    pub fn render(&self, source: &[u8]) -> Result<Vec<u8>, HandlerError> {
        let decoded = image::load_from_memory(source)
            .map_err(|e| HandlerError::Permanent(format!("cannot decode image: {e}")))?;

        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(HandlerError::Permanent("image has no pixels".to_string()));
        }

        let target_height = scaled_height(width, height, self.target_width);
        let resized = decoded.resize_exact(self.target_width, target_height, FilterType::Triangle);

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
        let mut encoded = Cursor::new(Vec::new());
        rgb.write_to(&mut encoded, ImageFormat::Jpeg)
            .map_err(|e| HandlerError::Permanent(format!("cannot encode thumbnail: {e}")))?;

        Ok(encoded.into_inner())
    }
}

/// Height that keeps the aspect ratio at `target_width`, never below 1px.
fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    let scaled = (height as u64 * target_width as u64 + width as u64 / 2) / width as u64;
    scaled.clamp(1, u32::MAX as u64) as u32
}

#[async_trait]
impl EventHandler<ObjectCreatedEvent> for ThumbnailGenerator {
    fn name(&self) -> &'static str {
        "thumbnail-generator"
    }

    #[instrument(skip(self, event), fields(bucket = %event.bucket, key = %event.key))]
    async fn handle(&self, event: &ObjectCreatedEvent) -> Result<(), HandlerError> {
        let source = self.sources.get(&event.key).await?;

        debug!(size_bytes = source.len(), "Fetched source object");

        let thumbnail = match self.render(&source) {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                warn!(error = %e, "Source object is not a usable image");
                metrics::counter!("pipeline.thumbnails.rejected").increment(1);
                return Err(e);
            }
        };

        let derivative_key = self.derivative_key(&event.key);
        let size_bytes = thumbnail.len();
        self.derivatives
            .put(&derivative_key, thumbnail, THUMBNAIL_CONTENT_TYPE)
            .await?;

        metrics::counter!("pipeline.thumbnails.written").increment(1);
        info!(derivative_key = %derivative_key, size_bytes, "Thumbnail written");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;
    use image::{Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 40, 10]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn generator() -> (ThumbnailGenerator, Arc<MemoryBlobStore>, Arc<MemoryBlobStore>) {
        let sources = Arc::new(MemoryBlobStore::new());
        let derivatives = Arc::new(MemoryBlobStore::new());
        let generator = ThumbnailGenerator::new(sources.clone(), derivatives.clone());
        (generator, sources, derivatives)
    }

    #[test]
    fn test_scaled_height_preserves_aspect_ratio() {
        assert_eq!(scaled_height(300, 200, 150), 100);
        assert_eq!(scaled_height(1920, 1080, 150), 84);
        assert_eq!(scaled_height(10_000, 1, 150), 1);
    }

    #[tokio::test]
    async fn test_writes_resized_jpeg_under_same_key() {
        let (generator, sources, derivatives) = generator();
        sources.insert("i1", png(600, 300));

        generator
            .handle(&ObjectCreatedEvent::new("images", "i1"))
            .await
            .unwrap();

        let thumbnail = derivatives.object("i1").expect("derivative written");
        assert_eq!(derivatives.content_type("i1").as_deref(), Some("image/jpeg"));

        let decoded = image::load_from_memory(&thumbnail).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (150, 75));
    }

    #[tokio::test]
    async fn test_key_prefix_namespaces_derivatives() {
        let (generator, sources, derivatives) = generator();
        let generator = generator.with_key_prefix("thumbs/").with_target_width(50);
        sources.insert("albums/i1.png", png(100, 100));

        generator
            .handle(&ObjectCreatedEvent::new("images", "albums/i1.png"))
            .await
            .unwrap();

        assert_eq!(derivatives.keys(), vec!["thumbs/albums/i1.png".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_source_is_permanent() {
        let (generator, sources, derivatives) = generator();
        sources.insert("broken", b"definitely not an image".to_vec());

        let err = generator
            .handle(&ObjectCreatedEvent::new("images", "broken"))
            .await
            .unwrap_err();

        assert!(err.is_permanent());
        assert!(derivatives.keys().is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let (generator, _, _) = generator();

        let err = generator
            .handle(&ObjectCreatedEvent::new("images", "nope"))
            .await
            .unwrap_err();

        assert!(err.is_permanent());
    }
}
