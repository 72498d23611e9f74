//! QR symbol encoding and rasterisation.
//!
//! Encoding goes through the [`QrRenderer`] trait so that the capacity fallback can tell a
//! payload that does not fit apart from every other failure. Rasterisation turns the resulting
//! [`QrMatrix`] into a grayscale image, a PNG or SVG data URL, or an SVG document.
use std::{fmt, io::Cursor, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, GrayImage, ImageBuffer, ImageFormat, Luma};
use qrcode::{types::QrError as SymbolError, EcLevel, QrCode};
use thiserror::Error;

/// Error correction level for a QR code.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum ErrorCorrection {
    /// Tolerates ~7% erroneous codewords.
    Low,
    /// Tolerates ~15% erroneous codewords.
    Medium,
    /// Tolerates ~25% erroneous codewords.
    #[default]
    Quartile,
    /// Tolerates ~30% erroneous codewords.
    High,
}

impl ErrorCorrection {
    fn ec_level(self) -> EcLevel {
        use ErrorCorrection::*;
        match self {
            Low => EcLevel::L,
            Medium => EcLevel::M,
            Quartile => EcLevel::Q,
            High => EcLevel::H,
        }
    }

    /// Single-letter name used in configuration (`L`, `M`, `Q`, `H`).
    pub fn letter(self) -> char {
        use ErrorCorrection::*;
        match self {
            Low => 'L',
            Medium => 'M',
            Quartile => 'Q',
            High => 'H',
        }
    }
}

impl fmt::Display for ErrorCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for ErrorCorrection {
    type Err = QrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l" | "low" => Ok(Self::Low),
            "m" | "medium" => Ok(Self::Medium),
            "q" | "quartile" => Ok(Self::Quartile),
            "h" | "high" => Ok(Self::High),
            other => Err(QrError::UnknownLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum QrError {
    /// The payload does not fit in any symbol version at the requested level.
    #[error("payload of {len} bytes exceeds QR capacity at error correction level {ecc}")]
    CapacityExceeded { len: usize, ecc: ErrorCorrection },

    #[error("QR encoding failed: {0}")]
    Encoding(String),

    #[error("unknown error correction level: {0}")]
    UnknownLevel(String),

    #[error("unknown QR output format: {0}")]
    UnknownFormat(String),

    #[error("QR rasterisation failed: {0}")]
    Image(#[from] image::ImageError),
}

impl QrError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, QrError::CapacityExceeded { .. })
    }
}

/// An encoded QR symbol: a square grid of dark and light modules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrMatrix {
    /// Width and height in modules, between 21 and 177 for standard symbols.
    size: i32,
    version: u8,
    ecc: ErrorCorrection,
    /// Row-major, `true` = dark.
    modules: Vec<bool>,
}

impl QrMatrix {
    /// Builds a matrix from row-major module colors.
    ///
    /// # Panics
    ///
    /// Panics if `modules.len()` is not `size * size`.
    pub fn new(size: usize, modules: Vec<bool>, version: u8, ecc: ErrorCorrection) -> Self {
        assert_eq!(modules.len(), size * size, "Module count must be size squared");
        Self {
            size: size as i32,
            version,
            ecc,
            modules,
        }
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn ecc(&self) -> ErrorCorrection {
        self.ecc
    }

    /// Returns the color of the module at the given coordinates, `true` for dark.
    /// Coordinates outside the symbol are light.
    pub fn get_module(&self, x: i32, y: i32) -> bool {
        (0..self.size).contains(&x)
            && (0..self.size).contains(&y)
            && self.modules[(y * self.size + x) as usize]
    }
}

/// Encodes a text payload into a QR symbol.
///
/// Implementations must report a payload that does not fit with
/// [`QrError::CapacityExceeded`] so callers can degrade the payload instead of failing.
pub trait QrRenderer: Send + Sync {
    fn encode(&self, payload: &str, ecc: ErrorCorrection) -> Result<QrMatrix, QrError>;
}

/// Byte-mode encoder over every standard symbol version (1 to 40).
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardRenderer;

impl QrRenderer for StandardRenderer {
    fn encode(&self, payload: &str, ecc: ErrorCorrection) -> Result<QrMatrix, QrError> {
        let code = QrCode::with_error_correction_level(payload.as_bytes(), ecc.ec_level())
            .map_err(|e| match e {
                SymbolError::DataTooLong => QrError::CapacityExceeded {
                    len: payload.len(),
                    ecc,
                },
                other => QrError::Encoding(other.to_string()),
            })?;

        let version = match code.version() {
            qrcode::Version::Normal(v) | qrcode::Version::Micro(v) => v as u8,
        };
        let modules = code
            .to_colors()
            .into_iter()
            .map(|c| c == qrcode::Color::Dark)
            .collect();

        Ok(QrMatrix::new(code.width(), modules, version, ecc))
    }
}

/// Output image format for rendered symbols.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum QrFormat {
    #[default]
    Png,
    Svg,
}

impl FromStr for QrFormat {
    type Err = QrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "svg" => Ok(Self::Svg),
            other => Err(QrError::UnknownFormat(other.to_string())),
        }
    }
}

/// Largest accepted pixels-per-module setting.
pub const MAX_MODULE_SIZE: u32 = 64;

/// Largest accepted quiet zone, in modules.
pub const MAX_MARGIN: u32 = 16;

/// How a [`QrMatrix`] is turned into an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderOptions {
    pub format: QrFormat,
    /// Pixels per module (PNG only), at most [`MAX_MODULE_SIZE`].
    pub module_size: u32,
    /// Quiet zone width in modules, at most [`MAX_MARGIN`].
    pub margin: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            format: QrFormat::Png,
            module_size: 10,
            margin: 2,
        }
    }
}

/// Renders the symbol as a `data:` URL in the configured format.
pub fn render_data_url(qr: &QrMatrix, options: &RenderOptions) -> Result<String, QrError> {
    match options.format {
        QrFormat::Png => to_png_data_url(qr, options.module_size, options.margin),
        QrFormat::Svg => Ok(to_svg_data_url(qr, options.margin)),
    }
}

/// Converts a QR symbol into a grayscale image buffer.
///
/// # Arguments
///
/// * `qr` - The encoded symbol.
/// * `module_size` - Pixels per module, clamped to `1..=MAX_MODULE_SIZE`.
/// * `margin` - Quiet zone around the symbol in modules, capped at [`MAX_MARGIN`].
///
/// # Example
///
/// ```rust
/// use qircard::qr::{to_image_buffer, ErrorCorrection, QrRenderer, StandardRenderer};
///
/// let qr = StandardRenderer.encode("Hello, world!", ErrorCorrection::Low).unwrap();
/// let img = to_image_buffer(&qr, 1, 4);
/// assert_eq!(img.dimensions(), (29, 29));
/// ```
pub fn to_image_buffer(qr: &QrMatrix, module_size: u32, margin: u32) -> GrayImage {
    let module_size = module_size.clamp(1, MAX_MODULE_SIZE);
    let margin = margin.min(MAX_MARGIN);
    let border = margin as i32;
    let size = (qr.size() as u32 + 2 * margin) * module_size;
    let mut img = ImageBuffer::new(size, size);

    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let qr_x = (x / module_size) as i32 - border;
        let qr_y = (y / module_size) as i32 - border;
        *pixel = if qr.get_module(qr_x, qr_y) {
            Luma([0u8])
        } else {
            Luma([255u8])
        };
    }

    img
}

/// Encodes the symbol as PNG bytes.
pub fn to_png(qr: &QrMatrix, module_size: u32, margin: u32) -> Result<Vec<u8>, QrError> {
    let img = to_image_buffer(qr, module_size, margin);
    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(img).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

/// PNG rendering wrapped in a `data:image/png;base64,` URL.
pub fn to_png_data_url(qr: &QrMatrix, module_size: u32, margin: u32) -> Result<String, QrError> {
    let png = to_png(qr, module_size, margin)?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
}

/// Renders the symbol as a standalone SVG document, one unit per module, surrounded by
/// `border` light modules, capped at [`MAX_MARGIN`].
pub fn to_svg_string(qr: &QrMatrix, border: u32) -> String {
    let border = border.min(MAX_MARGIN) as i32;
    let dimension = qr.size() + border * 2;
    let mut result = String::new();
    result += "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";
    result += "<!DOCTYPE svg PUBLIC \"-//W3C//DTD SVG 1.1//EN\" \"http://www.w3.org/Graphics/SVG/1.1/DTD/svg11.dtd\">\n";
    result += &format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" version=\"1.1\" viewBox=\"0 0 {0} {0}\" stroke=\"none\">\n",
        dimension
    );
    result += "\t<rect width=\"100%\" height=\"100%\" fill=\"#FFFFFF\"/>\n";
    result += "\t<path d=\"";
    let mut first = true;
    for y in 0..qr.size() {
        for x in 0..qr.size() {
            if qr.get_module(x, y) {
                if !first {
                    result += " ";
                }
                first = false;
                result += &format!("M{},{}h1v1h-1z", x + border, y + border);
            }
        }
    }
    result += "\" fill=\"#000000\"/>\n";
    result += "</svg>\n";
    result
}

pub fn to_svg_data_url(qr: &QrMatrix, border: u32) -> String {
    format!(
        "data:image/svg+xml;base64,{}",
        STANDARD.encode(to_svg_string(qr, border))
    )
}
