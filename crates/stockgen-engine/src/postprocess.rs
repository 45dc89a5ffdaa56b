use std::fs;
use std::path::PathBuf;

use image::codecs::jpeg::{JpegEncoder, PixelDensity};
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder, Rgb, RgbImage};
use moxcms::ColorProfile;
use stockgen_contracts::config::PipelineSettings;
use stockgen_contracts::generation::{FinalImageAsset, NormalizedImage};

use crate::error::PostProcessError;
use crate::normalize::{content_hash, probe_dimensions};

pub const JPEG_MIME: &str = "image/jpeg";

/// Produces the square, print-density JPEG that gets written to disk.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    settings: PipelineSettings,
}

impl PostProcessor {
    pub fn new(settings: PipelineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn process(&self, image: &NormalizedImage) -> Result<FinalImageAsset, PostProcessError> {
        let encoded = self.render(image)?;
        let hash = content_hash(&encoded);

        fs::create_dir_all(&self.settings.output_dir)?;
        let path = self.output_path(&hash);
        fs::write(&path, &encoded)?;

        tracing::debug!(path = %path.display(), bytes = encoded.len(), "wrote stock asset");
        Ok(FinalImageAsset {
            file_path: path,
            byte_size: encoded.len() as u64,
            width: self.settings.target_size,
            height: self.settings.target_size,
            mime_type: JPEG_MIME.to_string(),
            content_hash: hash,
        })
    }

    /// Encodes without touching the filesystem. Identical input and settings
    /// give identical bytes.
    pub fn render(&self, image: &NormalizedImage) -> Result<Vec<u8>, PostProcessError> {
        let target = self.settings.target_size;
        if target == 0 {
            return Err(PostProcessError::Encoding(
                "target size must be positive".to_string(),
            ));
        }

        let source_len = image.bytes.len() as u64;
        if source_len > self.settings.max_source_bytes {
            return Err(PostProcessError::Oversize {
                actual: source_len,
                limit: self.settings.max_source_bytes,
            });
        }
        let (width, height) = probe_dimensions(&image.bytes)
            .map_err(|err| PostProcessError::Encoding(format!("unreadable source: {err}")))?;
        let decoded_len = width as u64 * height as u64 * 4;
        if decoded_len > self.settings.max_decoded_bytes {
            return Err(PostProcessError::Oversize {
                actual: decoded_len,
                limit: self.settings.max_decoded_bytes,
            });
        }

        let source = image::load_from_memory(&image.bytes)
            .map_err(|err| PostProcessError::Encoding(format!("decode failed: {err}")))?;
        let flattened = flatten_on_white(&source);
        let square = DynamicImage::ImageRgb8(flattened)
            .resize_to_fill(target, target, FilterType::Lanczos3)
            .to_rgb8();

        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, self.settings.jpeg_quality);
        encoder.set_pixel_density(PixelDensity::dpi(self.settings.dpi));
        encoder
            .set_exif_metadata(exif_payload(self.settings.dpi))
            .map_err(|err| PostProcessError::Encoding(format!("exif rejected: {err}")))?;
        encoder
            .set_icc_profile(srgb_icc_profile()?)
            .map_err(|err| PostProcessError::Encoding(format!("icc profile rejected: {err}")))?;
        encoder
            .encode_image(&square)
            .map_err(|err| PostProcessError::Encoding(format!("jpeg encode failed: {err}")))?;
        Ok(jpeg)
    }

    fn output_path(&self, hash: &str) -> PathBuf {
        let stamp = chrono::Utc::now().timestamp_millis();
        let short = &hash[..hash.len().min(12)];
        self.settings.output_dir.join(format!("{stamp}-{short}.jpg"))
    }
}

fn flatten_on_white(source: &DynamicImage) -> RgbImage {
    if !source.color().has_alpha() {
        return source.to_rgb8();
    }
    let rgba = source.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |channel: u8| ((channel as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    out
}

const TAG_X_RESOLUTION: u16 = 0x011A;
const TAG_Y_RESOLUTION: u16 = 0x011B;
const TAG_RESOLUTION_UNIT: u16 = 0x0128;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_COLOR_SPACE: u16 = 0xA001;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

pub fn srgb_icc_profile() -> Result<Vec<u8>, PostProcessError> {
    ColorProfile::new_srgb()
        .encode()
        .map_err(|err| PostProcessError::Encoding(format!("srgb profile: {err}")))
}

/// Big-endian TIFF block declaring resolution in inches and sRGB colour space.
/// The encoder adds the `Exif\0\0` APP1 header.
pub fn exif_payload(dpi: u16) -> Vec<u8> {
    // Layout: header(8) | IFD0 4 entries (54) | Exif IFD 1 entry (18) | 2 rationals (16)
    const IFD0_OFFSET: u32 = 8;
    const EXIF_IFD_OFFSET: u32 = IFD0_OFFSET + 2 + 4 * 12 + 4;
    const X_RES_OFFSET: u32 = EXIF_IFD_OFFSET + 2 + 12 + 4;
    const Y_RES_OFFSET: u32 = X_RES_OFFSET + 8;

    let mut tiff = Vec::with_capacity(Y_RES_OFFSET as usize + 8);
    tiff.extend_from_slice(b"MM");
    tiff.extend_from_slice(&42u16.to_be_bytes());
    tiff.extend_from_slice(&IFD0_OFFSET.to_be_bytes());

    tiff.extend_from_slice(&4u16.to_be_bytes());
    push_entry(&mut tiff, TAG_X_RESOLUTION, TYPE_RATIONAL, X_RES_OFFSET.to_be_bytes());
    push_entry(&mut tiff, TAG_Y_RESOLUTION, TYPE_RATIONAL, Y_RES_OFFSET.to_be_bytes());
    push_entry(&mut tiff, TAG_RESOLUTION_UNIT, TYPE_SHORT, short_value(2));
    push_entry(&mut tiff, TAG_EXIF_IFD, TYPE_LONG, EXIF_IFD_OFFSET.to_be_bytes());
    tiff.extend_from_slice(&0u32.to_be_bytes());

    tiff.extend_from_slice(&1u16.to_be_bytes());
    push_entry(&mut tiff, TAG_COLOR_SPACE, TYPE_SHORT, short_value(1));
    tiff.extend_from_slice(&0u32.to_be_bytes());

    for _ in 0..2 {
        tiff.extend_from_slice(&(dpi as u32).to_be_bytes());
        tiff.extend_from_slice(&1u32.to_be_bytes());
    }
    tiff
}

fn push_entry(out: &mut Vec<u8>, tag: u16, kind: u16, value: [u8; 4]) {
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&kind.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&value);
}

fn short_value(value: u16) -> [u8; 4] {
    let [hi, lo] = value.to_be_bytes();
    [hi, lo, 0, 0]
}
