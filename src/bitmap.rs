//! Conversion of arbitrary images into packed 1-bit rasters.

use image::{imageops, DynamicImage, GenericImageView, GrayImage};

use crate::error::EncodeError;

/// How grayscale pixels are reduced to black and white.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Binarize {
    /// Pixels darker than the given luminance are printed.
    Threshold(u8),
    /// Floyd-Steinberg error diffusion, better for photos and drawings.
    FloydSteinberg,
}

impl Default for Binarize {
    fn default() -> Self {
        Binarize::FloydSteinberg
    }
}

/// Number of packed bytes needed for one row of `width` pixels.
pub fn bytes_per_row(width: u32) -> usize {
    (width as usize + 7) / 8
}

/// A 1-bit raster, 8 pixels per byte, MSB first, 1 = black dot.
///
/// Rows are padded on the right with zero bits so that each row occupies
/// exactly [`bytes_per_row`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Bitmap {
    /// Wrap already packed row data.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, EncodeError> {
        let expected = bytes_per_row(width) * height as usize;
        if data.len() != expected {
            return Err(EncodeError::InvalidBitmap {
                expected,
                actual: data.len(),
            });
        }

        Ok(Bitmap {
            width,
            height,
            data,
        })
    }

    /// Build a bitmap from a predicate returning `true` for black pixels.
    pub fn from_fn<F>(width: u32, height: u32, mut black: F) -> Self
    where
        F: FnMut(u32, u32) -> bool,
    {
        let row_len = bytes_per_row(width);
        let mut data = vec![0u8; row_len * height as usize];

        for y in 0..height {
            let row = &mut data[y as usize * row_len..(y as usize + 1) * row_len];
            for x in 0..width {
                if black(x, y) {
                    row[x as usize / 8] |= 0x80 >> (x % 8);
                }
            }
        }

        Bitmap {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_row(&self) -> usize {
        bytes_per_row(self.width)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Packed rows, top to bottom.
    pub fn rows(&self) -> std::slice::Chunks<'_, u8> {
        self.data.chunks(self.bytes_per_row().max(1))
    }

    /// Whether the pixel at (x, y) is printed. Out of range pixels are white.
    pub fn pixel(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let byte = self.data[y as usize * self.bytes_per_row() + x as usize / 8];
        byte & (0x80 >> (x % 8)) != 0
    }
}

/// Decode `source` and normalize it to a `target_width` dots wide bitmap.
///
/// Decoding is the only step that can fail; every decodable image, including
/// blank ones, produces a bitmap.
pub fn normalize(source: &[u8], target_width: u32, method: Binarize) -> Result<Bitmap, EncodeError> {
    let image = image::load_from_memory(source)?;
    log::debug!(
        "decoded source image {}x{}",
        image.width(),
        image.height()
    );
    Ok(normalize_image(&image, target_width, method))
}

/// Scale an already decoded image to `target_width`, keeping its aspect ratio,
/// then binarize and pack it.
pub fn normalize_image(image: &DynamicImage, target_width: u32, method: Binarize) -> Bitmap {
    let (src_width, src_height) = image.dimensions();

    if target_width == 0 || src_width == 0 || src_height == 0 {
        return Bitmap {
            width: target_width,
            height: 0,
            data: Vec::new(),
        };
    }

    let target_height = scaled_height(src_width, src_height, target_width);
    let resized = image.resize_exact(target_width, target_height, imageops::FilterType::Lanczos3);
    let mut gray = flatten_to_gray(&resized);

    let threshold = match method {
        Binarize::Threshold(level) => level,
        Binarize::FloydSteinberg => {
            // dither leaves only 0 and 255
            imageops::dither(&mut gray, &imageops::BiLevel);
            128
        }
    };

    log::debug!(
        "normalized {}x{} -> {}x{} with {:?}",
        src_width,
        src_height,
        target_width,
        target_height,
        method
    );

    Bitmap::from_fn(target_width, target_height, |x, y| {
        gray.get_pixel(x, y)[0] < threshold
    })
}

fn scaled_height(src_width: u32, src_height: u32, target_width: u32) -> u32 {
    let height = src_height as u64 * target_width as u64 / src_width as u64;
    height.max(1).min(u32::MAX as u64) as u32
}

// Transparent areas are blank paper, so alpha is composited onto white.
fn flatten_to_gray(image: &DynamicImage) -> GrayImage {
    let rgba = image.to_rgba8();
    GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let p = rgba.get_pixel(x, y);
        let luma = (299 * p[0] as u32 + 587 * p[1] as u32 + 114 * p[2] as u32) / 1000;
        let alpha = p[3] as u32;
        let value = (luma * alpha + 255 * (255 - alpha)) / 255;
        image::Luma([value as u8])
    })
}
