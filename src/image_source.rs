//! Resolves which image the session is currently operating on and owns all
//! encode/decode at the byte boundary.
//!
//! A freshly uploaded image always takes precedence over the last-known one.
//! Decoding is defensive: format allowlist, compressed-size cap and a
//! pre-decode dimension check so a hostile upload cannot decompression-bomb
//! the session.

use std::borrow::Cow;
use std::io::Cursor;

use image::{ImageFormat, ImageReader, Limits, RgbImage};
use tracing::{debug, instrument};

/// Maximum encoded image size accepted from uploads or the network fetch.
pub const MAX_ENCODED_BYTES: usize = 20 * 1024 * 1024;

/// Maximum decoded pixel count - prevents decompression bombs.
pub const MAX_PIXELS: u64 = 100_000_000;

/// Maximum single dimension of a decoded image.
pub const MAX_IMAGE_DIMENSION: u32 = 4096;

/// Allowed image formats - explicit allowlist.
const ALLOWED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
];

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("image decode failed")]
    Decode(#[from] image::ImageError),

    #[error("encoded image too large: {0} bytes (max: {MAX_ENCODED_BYTES})")]
    TooLarge(usize),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("image too large to decode: {width}x{height} pixels (max: {MAX_PIXELS})")]
    PixelCountTooLarge { width: u32, height: u32 },

    #[error("image encode failed")]
    Encode(#[source] image::ImageError),
}

/// Decodes encoded image bytes into an RGB pixel matrix.
///
/// # Errors
///
/// Returns [`DecodeError`] if the bytes are oversized, of a disallowed
/// format, corrupt, or describe an image beyond the pixel-count limits.
#[instrument(skip(bytes), fields(data_len = bytes.len()))]
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    if bytes.len() > MAX_ENCODED_BYTES {
        return Err(DecodeError::TooLarge(bytes.len()));
    }

    let format = image::guess_format(bytes)?;
    if !ALLOWED_FORMATS.contains(&format) {
        return Err(DecodeError::UnsupportedFormat(format!("{format:?}")));
    }

    // Dimension validation BEFORE the full decode.
    let (width, height) = peek_dimensions(bytes)?;
    if width == 0 || height == 0 {
        return Err(DecodeError::InvalidDimensions { width, height });
    }
    let pixel_count = u64::from(width).saturating_mul(u64::from(height));
    if pixel_count > MAX_PIXELS {
        return Err(DecodeError::PixelCountTooLarge { width, height });
    }

    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
    limits.max_image_height = Some(MAX_IMAGE_DIMENSION);
    reader.limits(limits);

    let decoded = reader.decode()?.to_rgb8();
    debug!(width, height, "image decoded");
    Ok(decoded)
}

/// Reads the header only, without decoding pixel data.
fn peek_dimensions(bytes: &[u8]) -> Result<(u32, u32), DecodeError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::Decode(image::ImageError::IoError(e)))?;
    Ok(reader.into_dimensions()?)
}

/// Encodes an RGB matrix as PNG, the canonical interchange encoding towards
/// the shell.
///
/// # Errors
///
/// Returns [`DecodeError::Encode`] if the PNG encoder fails.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(DecodeError::Encode)?;
    Ok(out)
}

/// Picks the active image: a fresh upload wins over the last-known matrix.
///
/// Returns `None` when neither source is available. A decode failure is
/// propagated so the caller can keep its previous display; no placeholder is
/// ever substituted.
///
/// # Errors
///
/// Returns [`DecodeError`] if `uploaded` is present but cannot be decoded.
pub fn resolve<'a>(
    uploaded: Option<&[u8]>,
    last_known: Option<&'a RgbImage>,
) -> Result<Option<Cow<'a, RgbImage>>, DecodeError> {
    match (uploaded, last_known) {
        (Some(bytes), _) => Ok(Some(Cow::Owned(decode_rgb(bytes)?))),
        (None, Some(last)) => Ok(Some(Cow::Borrowed(last))),
        (None, None) => Ok(None),
    }
}
