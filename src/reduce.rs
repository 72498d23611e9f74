//! # Image reduction
//!
//! Photos embedded in a vCard end up inside a QR symbol, and a symbol at error correction
//! level Q holds well under 2 KB of binary data. Any uploaded image is therefore shrunk hard
//! before it is embedded.
//!
//! ## Pipeline
//!
//! - Pass 1: downscale to at most 50px, JPEG at quality 20, stepping quality down toward ~3 KB
//! - Pass 2, only if pass 1 is still above 4 KB: at most 40px, quality 10, toward ~2 KB
//! - Grayscale by averaging R, G and B of every pixel
//! - Final single-channel JPEG at quality 10
//!
//! The output is never larger than [`SIZE_CEILING`]. Anything that cannot be decoded or encoded
//! is an error, and nothing partial is returned.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, GrayImage, Luma};
use thiserror::Error;
use tracing::debug;

/// Largest encoded image that may be embedded in a vCard.
pub const SIZE_CEILING: usize = 4096;

/// Largest upload accepted for reduction.
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

const FINAL_QUALITY: u8 = 10;
const QUALITY_STEP: u8 = 5;
const MIN_QUALITY: u8 = 5;

struct Pass {
    target_bytes: usize,
    max_dimension: u32,
    quality: u8,
}

const FIRST_PASS: Pass = Pass {
    target_bytes: 3 * 1024,
    max_dimension: 50,
    quality: 20,
};

const SECOND_PASS: Pass = Pass {
    target_bytes: 2 * 1024,
    max_dimension: 40,
    quality: 10,
};

#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("invalid image data URL")]
    InvalidDataUrl,

    #[error("unsupported image type: {0}")]
    UnsupportedType(String),

    #[error("invalid base64 image payload")]
    Base64(#[from] base64::DecodeError),

    #[error("image upload of {size} bytes exceeds the {limit} byte limit")]
    UploadTooLarge { size: usize, limit: usize },

    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("could not encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("reduced image is {size} bytes, above the {ceiling} byte ceiling")]
    TooLarge { size: usize, ceiling: usize },
}

/// An image payload ready to be embedded, with its declared MIME type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedImage {
    bytes: Vec<u8>,
    mime: String,
}

impl EncodedImage {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The vCard `TYPE` parameter, e.g. `JPEG` for `image/jpeg`.
    pub fn vcard_type(&self) -> String {
        self.mime
            .strip_prefix("image/")
            .unwrap_or(&self.mime)
            .split(['+', ';'])
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.to_base64())
    }
}

/// Splits a `data:image/<type>;base64,<payload>` URL into its MIME type and decoded bytes.
pub fn decode_data_url(url: &str) -> Result<EncodedImage, ReduceError> {
    let rest = url.strip_prefix("data:").ok_or(ReduceError::InvalidDataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(ReduceError::InvalidDataUrl)?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or(ReduceError::InvalidDataUrl)?;

    if !mime.starts_with("image/") {
        return Err(ReduceError::UnsupportedType(mime.to_string()));
    }

    let bytes = STANDARD.decode(payload.trim())?;
    Ok(EncodedImage::new(bytes, mime))
}

/// Reduces an uploaded data URL. See [`reduce_image`].
pub fn reduce_data_url(url: &str) -> Result<EncodedImage, ReduceError> {
    let upload = decode_data_url(url)?;
    reduce_image(upload.bytes())
}

/// Shrinks an encoded image (any format the `image` crate can decode) to a grayscale JPEG no
/// larger than [`SIZE_CEILING`].
pub fn reduce_image(bytes: &[u8]) -> Result<EncodedImage, ReduceError> {
    reduce_with(bytes, SIZE_CEILING).map(|(image, _)| image)
}

/// The full pipeline, running pass 2 whenever pass 1 leaves more than `second_pass_above`
/// bytes. Returns the image and the number of compression passes run.
fn reduce_with(
    bytes: &[u8],
    second_pass_above: usize,
) -> Result<(EncodedImage, u8), ReduceError> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(ReduceError::UploadTooLarge {
            size: bytes.len(),
            limit: MAX_UPLOAD_BYTES,
        });
    }

    let source = image::load_from_memory(bytes).map_err(ReduceError::Decode)?;
    let (compressed, passes) = compress_passes(&source, second_pass_above)?;

    let reduced = image::load_from_memory(&compressed).map_err(ReduceError::Decode)?;
    let gray = DynamicImage::ImageLuma8(grayscale(&reduced));
    let output = encode_jpeg(&gray, FINAL_QUALITY)?;

    debug!(
        original = bytes.len(),
        compressed = compressed.len(),
        output = output.len(),
        passes,
        "Reduced image"
    );

    if output.len() > SIZE_CEILING {
        return Err(ReduceError::TooLarge {
            size: output.len(),
            ceiling: SIZE_CEILING,
        });
    }

    Ok((EncodedImage::new(output, "image/jpeg"), passes))
}

/// Runs pass 1 and, when the result is above `second_pass_above` bytes, pass 2 on its output.
/// Returns the JPEG bytes and the number of passes run.
fn compress_passes(
    source: &DynamicImage,
    second_pass_above: usize,
) -> Result<(Vec<u8>, u8), ReduceError> {
    let first = compress(source, &FIRST_PASS)?;
    if first.len() <= second_pass_above {
        return Ok((first, 1));
    }

    debug!(size = first.len(), "First pass above ceiling, running second pass");
    let intermediate = image::load_from_memory(&first).map_err(ReduceError::Decode)?;
    Ok((compress(&intermediate, &SECOND_PASS)?, 2))
}

fn compress(img: &DynamicImage, pass: &Pass) -> Result<Vec<u8>, ReduceError> {
    let resized = if img.width() > pass.max_dimension || img.height() > pass.max_dimension {
        img.resize(pass.max_dimension, pass.max_dimension, FilterType::Triangle)
    } else {
        img.clone()
    };
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

    let mut quality = pass.quality;
    loop {
        let encoded = encode_jpeg(&rgb, quality)?;
        if encoded.len() <= pass.target_bytes || quality <= MIN_QUALITY {
            return Ok(encoded);
        }
        quality = quality.saturating_sub(QUALITY_STEP).max(MIN_QUALITY);
    }
}

/// Replaces every pixel with the plain average of its red, green and blue channels.
pub fn grayscale(img: &DynamicImage) -> GrayImage {
    let rgb = img.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        Luma([((r as u16 + g as u16 + b as u16) / 3) as u8])
    })
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ReduceError> {
    let mut bytes = Vec::new();
    img.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, quality))
        .map_err(ReduceError::Encode)?;
    Ok(bytes)
}
