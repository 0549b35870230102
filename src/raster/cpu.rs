use image::{imageops::FilterType, RgbaImage};

use super::RasterContext;
use crate::{error::TranscodeError, texture::RasterImage};

/// Resamples on the CPU with the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct CpuRasterContext {
    filter: FilterType,
}

impl CpuRasterContext {
    pub fn new(filter: FilterType) -> Self {
        Self { filter }
    }
}

impl Default for CpuRasterContext {
    /// Bilinear, the same filtering a linear GPU sampler applies.
    fn default() -> Self {
        Self::new(FilterType::Triangle)
    }
}

impl RasterContext for CpuRasterContext {
    fn name(&self) -> &str {
        "cpu"
    }

    fn resample(
        &mut self,
        source: &RgbaImage,
        width: u32,
        height: u32,
    ) -> Result<RasterImage, TranscodeError> {
        if width == 0 || height == 0 {
            return Err(TranscodeError::Resample(format!(
                "cannot resample to {}x{}",
                width, height
            )));
        }

        if source.width() == width && source.height() == height {
            return Ok(RasterImage::from(source.clone()));
        }

        Ok(image::imageops::resize(source, width, height, self.filter).into())
    }
}
