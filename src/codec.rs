use base64::{engine::general_purpose, Engine as _};
use image::RgbImage;

use crate::error::DecodeError;

const DATA_URL_SCHEME: &str = "data:";

/// Decodes a base64 (or `data:<mime>;base64,` prefixed) payload into an RGB image.
pub fn decode(payload: &str) -> Result<RgbImage, DecodeError> {
    let encoded = strip_data_url(payload);

    // Line-wrapped base64 is common from browsers and CLI tools.
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    let bytes = general_purpose::STANDARD.decode(compact)?;
    let image = image::load_from_memory(&bytes)?;

    Ok(image.to_rgb8())
}

/// Only strips when the payload both starts with the scheme and has a separator.
/// The body is the segment between the first and second separator.
fn strip_data_url(payload: &str) -> &str {
    if !payload.starts_with(DATA_URL_SCHEME) {
        return payload;
    }

    match payload.split(',').nth(1) {
        Some(body) => body,
        None => payload,
    }
}
