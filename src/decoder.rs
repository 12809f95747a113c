use image::{DynamicImage, GenericImageView, ImageBuffer, RgbImage};
use ndarray::Array3;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Image data is empty")]
    Empty,
    #[error("Unrecognised image format")]
    UnknownFormat,
    #[error("Error decoding image: {0}")]
    Malformed(String),
    #[error("Pixel buffer does not match image dimensions: {0}")]
    Shape(String),
}

/// Pixels in native resolution and channel count, laid out as
/// (height, width, channels).
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: Array3<u8>,
}

impl DecodedImage {
    pub fn from_array(pixels: Array3<u8>) -> Self {
        Self { pixels }
    }

    pub fn height(&self) -> usize {
        self.pixels.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.pixels.shape()[1]
    }

    pub fn channels(&self) -> usize {
        self.pixels.shape()[2]
    }

    pub fn pixels(&self) -> &Array3<u8> {
        &self.pixels
    }

    /// RGB view for models that expect three channels. Returns `None` when the
    /// channel count has no RGB interpretation.
    pub fn to_rgb(&self) -> Option<RgbImage> {
        let width = self.width() as u32;
        let height = self.height() as u32;
        let raw: Vec<u8> = self.pixels.iter().copied().collect();

        let image = match self.channels() {
            1 => DynamicImage::ImageLuma8(ImageBuffer::from_raw(width, height, raw)?),
            2 => DynamicImage::ImageLumaA8(ImageBuffer::from_raw(width, height, raw)?),
            3 => return ImageBuffer::from_raw(width, height, raw),
            4 => DynamicImage::ImageRgba8(ImageBuffer::from_raw(width, height, raw)?),
            _ => return None,
        };

        Some(image.to_rgb8())
    }
}

pub fn decode(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let image_reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    if image_reader.format().is_none() {
        return Err(DecodeError::UnknownFormat);
    }

    let image = image_reader
        .decode()
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let (width, height) = image.dimensions();
    let channels = image.color().channel_count() as usize;

    // 16-bit and float sources are narrowed to 8 bits per channel.
    let raw = match channels {
        1 => image.into_luma8().into_raw(),
        2 => image.into_luma_alpha8().into_raw(),
        3 => image.into_rgb8().into_raw(),
        _ => image.into_rgba8().into_raw(),
    };
    let channels = channels.min(4);

    let pixels = Array3::from_shape_vec((height as usize, width as usize, channels), raw)
        .map_err(|e| DecodeError::Shape(e.to_string()))?;

    tracing::debug!(width, height, channels, "Decoded image");

    Ok(DecodedImage { pixels })
}
