pub mod resize;

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::image::codecs::jpeg::JpegEncoder;
use ::image::codecs::png::PngEncoder;
use ::image::{DynamicImage, ImageFormat, ImageReader};
use bytes::Bytes;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use crate::core::config::ImageConfig;
use crate::core::error::ImageError;
use crate::core::types::{ImageMeta, ImageSize};
use crate::observability::metrics as obs;
use crate::storage::{image_headers, read_bounded, ObjectStore};

pub use resize::{plan_resize, CropRect, ResizePlan};

pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PNG: &str = "image/png";
pub const MIME_GIF: &str = "image/gif";

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

fn invalid(reason: impl std::fmt::Display) -> ImageError {
    ImageError::InvalidImage {
        reason: reason.to_string(),
    }
}

/// Mime type for the formats the service accepts.
fn accepted_mime(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Jpeg => Some(MIME_JPEG),
        ImageFormat::Png => Some(MIME_PNG),
        ImageFormat::Gif => Some(MIME_GIF),
        _ => None,
    }
}

/// Read the format and dimensions from the image header without decoding
/// the pixels.
pub fn probe(data: &[u8]) -> Result<(&'static str, u32, u32), ImageError> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(invalid)?;
    let format = reader
        .format()
        .ok_or_else(|| invalid("unrecognized image format"))?;
    let mime = accepted_mime(format)
        .ok_or_else(|| invalid(format!("unsupported image format {:?}", format)))?;
    let (width, height) = reader.into_dimensions().map_err(invalid)?;
    if width == 0 || height == 0 {
        return Err(invalid("image has no pixels"));
    }
    Ok((mime, width, height))
}

fn decode(data: &[u8]) -> Result<DynamicImage, ImageError> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(invalid)?
        .decode()
        .map_err(invalid)
}

/// Encode as JPEG (alpha is dropped) or PNG.
fn encode(img: &DynamicImage, mime: &str, jpeg_quality: u8) -> Result<Bytes, ImageError> {
    let mut buf = Vec::new();
    let result = if mime == MIME_PNG {
        img.write_with_encoder(PngEncoder::new(&mut buf))
    } else {
        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, jpeg_quality))
    };
    result.map_err(|e| ImageError::EncodeFailed {
        reason: e.to_string(),
    })?;
    Ok(Bytes::from(buf))
}

/// Run CPU-bound codec work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ImageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ImageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ImageError::EncodeFailed {
            reason: format!("image task failed: {}", e),
        })?
}

// ---------------------------------------------------------------------------
// ImageService
// ---------------------------------------------------------------------------

/// Stores originals bounded to the configured maximum and serves them at any
/// requested size, caching resized variants in a second store.
pub struct ImageService<O> {
    canonical: Arc<O>,
    variants: Arc<O>,
    config: ImageConfig,
}

impl<O: ObjectStore> ImageService<O> {
    pub fn new(canonical: O, variants: O, config: ImageConfig) -> Self {
        Self {
            canonical: Arc::new(canonical),
            variants: Arc::new(variants),
            config,
        }
    }

    pub fn canonical(&self) -> &O {
        &self.canonical
    }

    pub fn variants(&self) -> &O {
        &self.variants
    }

    pub fn max_source_bytes(&self) -> u64 {
        self.config.max_source_bytes
    }

    fn exceeds_max(&self, width: u32, height: u32) -> bool {
        (self.config.max_width > 0 && width > self.config.max_width)
            || (self.config.max_height > 0 && height > self.config.max_height)
    }

    /// Box the originals are bounded to. An unbounded axis keeps its size.
    fn max_size(&self, width: u32, height: u32) -> ImageSize {
        let w = if self.config.max_width > 0 { self.config.max_width } else { width };
        let h = if self.config.max_height > 0 { self.config.max_height } else { height };
        ImageSize::new(w, h)
    }

    async fn store_original(
        &self,
        id: &str,
        data: Bytes,
        mime: &str,
        width: u32,
        height: u32,
    ) -> Result<ImageMeta, ImageError> {
        let size = data.len() as u64;
        self.canonical
            .put(id, data, mime, image_headers(width, height, Some(id)))
            .await?;
        Ok(ImageMeta {
            mime_type: mime.to_string(),
            width,
            height,
            size,
            name: Some(id.to_string()),
        })
    }

    /// Store an encoded image read from `reader`.
    ///
    /// Inputs above `max_source_bytes` are rejected. Images larger than the
    /// configured maximum are shrunk to fit and re-encoded as JPEG; anything
    /// else is stored byte for byte.
    pub async fn put_reader<R>(&self, id: &str, reader: R) -> Result<ImageMeta, ImageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let limit = self.config.max_source_bytes;
        let data = read_bounded(reader, limit.saturating_add(1)).await?;
        if data.len() as u64 > limit {
            return Err(invalid(format!("image exceeds {} bytes", limit)));
        }
        self.put_bytes(id, data).await
    }

    /// [`ImageService::put_reader`] over bytes already in memory.
    pub async fn put_bytes(&self, id: &str, data: Bytes) -> Result<ImageMeta, ImageError> {
        let (mime, width, height) = probe(&data)?;
        if !self.exceeds_max(width, height) {
            debug!(id, mime, width, height, "storing original as-is");
            return self.store_original(id, data, mime, width, height).await;
        }

        let bound = self.max_size(width, height);
        let quality = self.config.jpeg_quality;
        let start = Instant::now();
        let (encoded, w, h) = blocking(move || {
            let img = resize::resize(decode(&data)?, &bound);
            let encoded = encode(&img, MIME_JPEG, quality)?;
            Ok((encoded, img.width(), img.height()))
        })
        .await?;
        obs::record_resize_duration(start.elapsed().as_secs_f64());

        debug!(id, from_width = width, from_height = height, width = w, height = h, "stored bounded original");
        self.store_original(id, encoded, MIME_JPEG, w, h).await
    }

    /// Store a decoded image. Always encoded as JPEG.
    pub async fn put(&self, id: &str, img: DynamicImage) -> Result<ImageMeta, ImageError> {
        let bound = self
            .exceeds_max(img.width(), img.height())
            .then(|| self.max_size(img.width(), img.height()));
        let quality = self.config.jpeg_quality;
        let (encoded, w, h) = blocking(move || {
            let img = match bound {
                Some(bound) => resize::resize(img, &bound),
                None => img,
            };
            let encoded = encode(&img, MIME_JPEG, quality)?;
            Ok((encoded, img.width(), img.height()))
        })
        .await?;
        self.store_original(id, encoded, MIME_JPEG, w, h).await
    }

    /// Reject requested dimensions above the configured output bound.
    pub fn check_size(&self, size: &ImageSize) -> Result<(), ImageError> {
        let (max_width, max_height) = (self.config.max_output_width, self.config.max_output_height);
        if size.width > max_width || size.height > max_height {
            return Err(ImageError::SizeTooLarge {
                width: size.width,
                height: size.height,
                max_width,
                max_height,
            });
        }
        Ok(())
    }

    /// Read an image at `size`, or the original when no size is requested.
    ///
    /// Resized copies come from the variants store when present. On a miss
    /// the original is resized, returned, and written to the variants store
    /// in the background.
    pub async fn get_reader(
        &self,
        id: &str,
        size: Option<&ImageSize>,
    ) -> Result<(Bytes, ImageMeta), ImageError> {
        let size = match size {
            Some(size) if !size.is_original() => *size,
            _ => return self.get_original(id).await,
        };
        self.check_size(&size)?;

        let variant_name = size.variant_name(id);
        let variant_id = self.variants.id_from_name(&variant_name);
        match self.variants.get_reader(&variant_id).await {
            Ok(out) => {
                obs::inc_variant_cache_hit();
                let meta = out.image_meta();
                return Ok((out.body, meta));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(id, variant = %variant_name, error = %e, "variant read failed, resizing"),
        }
        obs::inc_variant_cache_miss();

        let original = self
            .canonical
            .get_reader(&self.canonical.id_from_name(id))
            .await?;
        let original_mime = original.image_meta().mime_type;
        let mime = if original_mime == MIME_PNG { MIME_PNG } else { MIME_JPEG };
        let quality = self.config.jpeg_quality;

        let start = Instant::now();
        let body = original.body;
        let (max_width, max_height) = (self.config.max_output_width, self.config.max_output_height);
        let (encoded, w, h) = blocking(move || {
            let img = decode(&body)?;
            let plan = plan_resize(img.width(), img.height(), &size);
            // A single requested axis can still scale the other one past the bound.
            let enlarges = plan.width > img.width() || plan.height > img.height();
            if enlarges && (plan.width > max_width || plan.height > max_height) {
                return Err(ImageError::SizeTooLarge {
                    width: plan.width,
                    height: plan.height,
                    max_width,
                    max_height,
                });
            }
            let img = resize::apply_plan(img, &plan);
            let encoded = encode(&img, mime, quality)?;
            Ok((encoded, img.width(), img.height()))
        })
        .await?;
        obs::record_resize_duration(start.elapsed().as_secs_f64());

        let meta = ImageMeta {
            mime_type: mime.to_string(),
            width: w,
            height: h,
            size: encoded.len() as u64,
            name: Some(variant_name.clone()),
        };

        let variants = self.variants.clone();
        let data = encoded.clone();
        let headers = image_headers(w, h, Some(&variant_name));
        tokio::spawn(async move {
            if let Err(e) = variants.put(&variant_name, data, mime, headers).await {
                obs::inc_background_write_failure("variant");
                warn!(variant = %variant_name, error = %e, "failed to cache resized variant");
            }
        });

        Ok((encoded, meta))
    }

    async fn get_original(&self, id: &str) -> Result<(Bytes, ImageMeta), ImageError> {
        let out = self
            .canonical
            .get_reader(&self.canonical.id_from_name(id))
            .await?;
        let mut meta = out.image_meta();
        if meta.width == 0 || meta.height == 0 || meta.mime_type.is_empty() {
            // Objects written without image headers: read them from the bytes.
            if let Ok((mime, w, h)) = probe(&out.body) {
                meta.mime_type = mime.to_string();
                meta.width = w;
                meta.height = h;
            }
        }
        Ok((out.body, meta))
    }

    /// Server-side copy of an original. Returns the destination's canonical id.
    pub async fn copy(&self, dst: &str, src: &str) -> Result<String, ImageError> {
        let dst_id = self.canonical.id_from_name(dst);
        let src_id = self.canonical.id_from_name(src);
        Ok(self.canonical.copy(&dst_id, &src_id).await?)
    }

    /// Time-limited URL for the original.
    pub async fn expiring_url(&self, id: &str, ttl: Duration) -> Result<String, ImageError> {
        let canonical_id = self.canonical.id_from_name(id);
        Ok(self.canonical.expiring_url(&canonical_id, ttl).await?)
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------
