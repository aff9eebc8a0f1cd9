use crate::{
    actuator::Rgb,
    error::{Error, Result},
};
use rayon::prelude::*;
use std::path::Path;

/// A single-channel 8-bit camera frame.
///
/// Pixels are stored row-major, so the pixel at column `x` and row `y` lives
/// at `y * width + x`.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    /// Create a frame from a row-major buffer of intensities.
    ///
    /// ```text
    /// +--------+--------+-----+--------+
    /// |      0 |      1 | ... |    w-1 |
    /// +--------+--------+-----+--------+
    /// |      w |    w+1 | ... |   2w-1 |
    /// +--------+--------+-----+--------+
    /// |    ... |
    /// ```
    ///
    /// Returns an error if either dimension is zero or if `bytes` does not
    /// hold exactly `width * height` values.
    pub fn from_bytes(width: u32, height: u32, bytes: &[u8]) -> Result<Self> {
        let len = checked_len(width, height)?;
        if bytes.len() != len {
            return Err(Error::InvalidInput(format!(
                "expected {len} bytes for a {width}x{height} frame, got {}",
                bytes.len()
            )));
        }

        Ok(Self {
            width,
            height,
            pixels: bytes.to_vec(),
        })
    }

    /// Create a frame from a row-major buffer of RGB triplets.
    ///
    /// Without a `filter` the frame holds the luma of each pixel. With a
    /// `filter` colour whose dominant channel is clear, the frame holds that
    /// channel minus the mean of the other two. This rejects ambient white
    /// light when the lit LED has a saturated colour.
    pub fn from_rgb_bytes(
        width: u32,
        height: u32,
        bytes: &[u8],
        filter: Option<Rgb>,
    ) -> Result<Self> {
        let len = checked_len(width, height)?;
        if bytes.len() != len * 3 {
            return Err(Error::InvalidInput(format!(
                "expected {} bytes for a {width}x{height} RGB frame, got {}",
                len * 3,
                bytes.len()
            )));
        }

        let channel = filter.and_then(|color| color.dominant_channel());
        let pixels = bytes
            .par_chunks_exact(3)
            .map(|px| {
                let [r, g, b] = [px[0] as f64, px[1] as f64, px[2] as f64];
                let value = match channel {
                    Some(0) => r - (g + b) / 2.,
                    Some(1) => g - (r + b) / 2.,
                    Some(_) => b - (r + g) / 2.,
                    // ITU-R BT.601 luma, as used by most camera pipelines.
                    None => 0.299 * r + 0.587 * g + 0.114 * b,
                };
                value.round().clamp(0., 255.) as u8
            })
            .collect();

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Decode an image file into a luma frame.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let luma = image::ImageReader::open(path)?.decode()?.into_luma8();
        let (width, height) = luma.dimensions();
        Self::from_bytes(width, height, luma.as_raw())
    }

    /// Decode an image file, keeping only light close to `filter`.
    ///
    /// See [`Frame::from_rgb_bytes`].
    pub fn open_filtered(path: impl AsRef<Path>, filter: Rgb) -> Result<Self> {
        let rgb = image::ImageReader::open(path)?.decode()?.into_rgb8();
        let (width, height) = rgb.dimensions();
        Self::from_rgb_bytes(width, height, rgb.as_raw(), Some(filter))
    }

    /// Encode the frame to an image file, with the format chosen from the
    /// extension of `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        image::save_buffer(
            path,
            &self.pixels,
            self.width,
            self.height,
            image::ExtendedColorType::L8,
        )?;
        Ok(())
    }

    /// Subtract a `baseline` frame from this frame, saturating at zero.
    pub fn subtract(&self, baseline: &Frame) -> Result<Frame> {
        if self.dimensions() != baseline.dimensions() {
            return Err(Error::InvalidInput(format!(
                "baseline is {}x{} but frame is {}x{}",
                baseline.width, baseline.height, self.width, self.height
            )));
        }

        let pixels = self
            .pixels
            .par_iter()
            .zip(baseline.pixels.par_iter())
            .map(|(px, bg)| px.saturating_sub(*bg))
            .collect();

        Ok(Frame {
            width: self.width,
            height: self.height,
            pixels,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_slice(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    /// Returns the intensity at column `x` and row `y`, or `None` outside
    /// the frame.
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    /// Returns the column and row of the pixel at row-major offset `i`.
    pub(crate) fn coords(&self, i: usize) -> (u32, u32) {
        let width = self.width as usize;
        ((i % width) as u32, (i / width) as u32)
    }
}

fn checked_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput(format!(
            "frame dimensions must be non-zero, got {width}x{height}"
        )));
    }
    (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| Error::InvalidInput(format!("frame {width}x{height} is too large")))
}
