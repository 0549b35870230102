//! Image decoding and power-of-two normalization.
//!
//! A [`Normalizer`] turns the encoded image stored in a texture record into an RGBA8
//! raster whose dimensions are powers of two and fit the requested box. Decoding goes
//! through an [`ImageDecoder`] and resampling through a [`RasterContext`], so hosts
//! without a GPU can use [`CpuRasterContext`] while others use the GPU one.

mod cpu;
#[cfg(feature = "wgpu")]
mod gpu;

use glam::{DVec2, UVec2};
use image::RgbaImage;
use tracing::{debug, warn};

use crate::{
    error::TranscodeError,
    options::{ResamplerKind, ResizeSpec},
    texture::RasterImage,
};

pub use cpu::CpuRasterContext;
#[cfg(feature = "wgpu")]
pub use gpu::GpuRasterContext;

/// Largest dimension `ensure_pot` rounds to.
pub const MAX_POT_DIMENSION: u32 = 1 << 31;

/// Largest RGBA8 raster a normalizer allocates.
pub const MAX_RASTER_BYTES: u64 = 1 << 30;

/// Decodes encoded image bytes (PNG, JPEG, ...) into RGBA8.
pub trait ImageDecoder: Send {
    fn decode(&self, encoded: &[u8]) -> Result<RgbaImage, TranscodeError>;
}

/// Decoder backed by the `image` crate's format detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, encoded: &[u8]) -> Result<RgbaImage, TranscodeError> {
        Ok(image::load_from_memory(encoded)?.into_rgba8())
    }
}

/// Resamples a decoded image to exact dimensions.
pub trait RasterContext: Send {
    fn name(&self) -> &str;

    fn resample(
        &mut self,
        source: &RgbaImage,
        width: u32,
        height: u32,
    ) -> Result<RasterImage, TranscodeError>;
}

/// Builds the raster context `kind` asks for. `Auto` falls back to the CPU when no GPU
/// context can be created.
pub fn make_raster_context(kind: ResamplerKind) -> Result<Box<dyn RasterContext>, TranscodeError> {
    match kind {
        ResamplerKind::Cpu => Ok(Box::new(CpuRasterContext::default())),
        #[cfg(feature = "wgpu")]
        ResamplerKind::Gpu => Ok(Box::new(GpuRasterContext::new()?)),
        #[cfg(not(feature = "wgpu"))]
        ResamplerKind::Gpu => Err(TranscodeError::ContextUnavailable(
            "built without the wgpu feature".to_owned(),
        )),
        ResamplerKind::Auto => {
            #[cfg(feature = "wgpu")]
            match GpuRasterContext::new() {
                Ok(context) => return Ok(Box::new(context)),
                Err(err) => warn!("GPU raster context unavailable, using CPU: {}", err),
            }
            #[cfg(not(feature = "wgpu"))]
            warn!("Built without GPU support, using CPU raster context");
            Ok(Box::new(CpuRasterContext::default()))
        }
    }
}

/// Smallest power of two that is `>= value`, never below 1.
pub fn ensure_pot(value: f64) -> u32 {
    if !(value > 1.0) {
        return 1;
    }
    if value >= MAX_POT_DIMENSION as f64 {
        return MAX_POT_DIMENSION;
    }
    (value.ceil() as u32).next_power_of_two()
}

/// Largest size with the aspect ratio of `original` that fits `target`, before rounding.
pub fn fit_within(original: UVec2, target: ResizeSpec) -> DVec2 {
    let aspect_ratio = original.x as f64 / original.y as f64;
    let mut size = DVec2::new(target.width as f64, target.height as f64);

    if size.x / size.y > aspect_ratio {
        size.x = size.y * aspect_ratio;
    } else {
        size.y = size.x / aspect_ratio;
    }
    size
}

/// Final raster dimensions for an image of size `original` normalized into `target`.
pub fn pot_dimensions(original: UVec2, target: ResizeSpec) -> UVec2 {
    let fitted = fit_within(original, target);
    UVec2::new(ensure_pot(fitted.x), ensure_pot(fitted.y))
}

/// Decode + resize stage of the pipeline.
pub struct Normalizer {
    decoder: Box<dyn ImageDecoder>,
    context: Box<dyn RasterContext>,
}

impl Normalizer {
    pub fn new(context: Box<dyn RasterContext>) -> Self {
        Self {
            decoder: Box::new(ImageCrateDecoder),
            context,
        }
    }

    pub fn cpu() -> Self {
        Self::new(Box::new(CpuRasterContext::default()))
    }

    /// Replace the image decoder, e.g. to plug in a host-provided one.
    pub fn with_decoder(mut self, decoder: Box<dyn ImageDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn context_name(&self) -> &str {
        self.context.name()
    }

    pub fn normalize(
        &mut self,
        encoded: &[u8],
        target: ResizeSpec,
    ) -> Result<RasterImage, TranscodeError> {
        let source = self.decoder.decode(encoded)?;
        if source.width() == 0 || source.height() == 0 {
            return Err(TranscodeError::Decode("image has no texels".to_owned()));
        }

        let size = pot_dimensions(UVec2::new(source.width(), source.height()), target);
        let bytes = size.x as u64 * size.y as u64 * 4;
        if bytes > MAX_RASTER_BYTES {
            return Err(TranscodeError::Resample(format!(
                "{}x{} raster needs {} bytes, more than the {} byte limit",
                size.x, size.y, bytes, MAX_RASTER_BYTES
            )));
        }
        debug!(
            "Normalizing {}x{} -> {}x{} ({})",
            source.width(),
            source.height(),
            size.x,
            size.y,
            self.context.name()
        );

        let raster = self.context.resample(&source, size.x, size.y)?;
        if raster.width() != size.x || raster.height() != size.y {
            return Err(TranscodeError::Resample(format!(
                "{} produced {}x{}, expected {}x{}",
                self.context.name(),
                raster.width(),
                raster.height(),
                size.x,
                size.y
            )));
        }
        Ok(raster)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgba};
    use proptest::prelude::*;

    use super::*;

    fn encode_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 7) as u8, (y * 3) as u8, 128, 255])
        });
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_ensure_pot_examples() {
        assert_eq!(ensure_pot(512.0), 512);
        assert_eq!(ensure_pot(513.0), 1024);
        assert_eq!(ensure_pot(1.0), 1);
        assert_eq!(ensure_pot(341.33), 512);
        assert_eq!(ensure_pot(0.25), 1);
        assert_eq!(ensure_pot(f64::NAN), 1);
    }

    #[test]
    fn test_pot_dimensions_for_landscape_image() {
        let fitted = fit_within(UVec2::new(300, 200), ResizeSpec::new(512, 512));
        assert_eq!(fitted.x, 512.0);
        assert!((fitted.y - 341.333).abs() < 1e-3);
        assert_eq!(
            pot_dimensions(UVec2::new(300, 200), ResizeSpec::new(512, 512)),
            UVec2::new(512, 512)
        );
        assert_eq!(
            pot_dimensions(UVec2::new(400, 100), ResizeSpec::new(512, 512)),
            UVec2::new(512, 128)
        );
    }

    #[test]
    fn test_pot_dimensions_for_portrait_box() {
        // Box wider than the image: height bounds the result.
        assert_eq!(
            pot_dimensions(UVec2::new(100, 200), ResizeSpec::new(1024, 256)),
            UVec2::new(128, 256)
        );
    }

    #[test]
    fn test_normalize_png() {
        let mut normalizer = Normalizer::cpu();
        let raster = normalizer
            .normalize(&encode_png(300, 200), ResizeSpec::new(256, 256))
            .unwrap();
        assert_eq!(raster.width(), 256);
        assert_eq!(raster.height(), 256);
        assert_eq!(raster.pixels().len(), 256 * 256 * 4);
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        let mut normalizer = Normalizer::cpu();
        let err = normalizer
            .normalize(b"definitely not an image", ResizeSpec::new(64, 64))
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Decode(_)));
    }

    struct SolidDecoder;

    impl ImageDecoder for SolidDecoder {
        fn decode(&self, _encoded: &[u8]) -> Result<RgbaImage, TranscodeError> {
            Ok(RgbaImage::from_pixel(8, 2, Rgba([10, 20, 30, 255])))
        }
    }

    #[test]
    fn test_cpu_context_by_kind() {
        let context = make_raster_context(ResamplerKind::Cpu).unwrap();
        assert_eq!(context.name(), "cpu");
    }

    #[test]
    fn test_custom_decoder_hook() {
        let mut normalizer = Normalizer::cpu().with_decoder(Box::new(SolidDecoder));
        let raster = normalizer.normalize(&[], ResizeSpec::new(16, 16)).unwrap();
        assert_eq!((raster.width(), raster.height()), (16, 4));
        assert_eq!(&raster.pixels()[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_normalize_refuses_huge_rasters() {
        let mut normalizer = Normalizer::cpu().with_decoder(Box::new(SolidDecoder));
        let err = normalizer
            .normalize(&[], ResizeSpec::new(4_000_000_000, 4_000_000_000))
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Resample(_)));
    }

    proptest! {
        #[test]
        fn prop_ensure_pot_is_smallest_power_of_two(value in 1u32..=(1 << 30)) {
            let pot = ensure_pot(value as f64);
            prop_assert!(pot.is_power_of_two());
            prop_assert!(pot >= value);
            prop_assert!(pot / 2 < value);
            if value.is_power_of_two() {
                prop_assert_eq!(pot, value);
            }
        }

        #[test]
        fn prop_fit_within_preserves_aspect(
            ow in 1u32..8192, oh in 1u32..8192, tw in 1u32..8192, th in 1u32..8192,
        ) {
            let fitted = fit_within(UVec2::new(ow, oh), ResizeSpec::new(tw, th));
            let expected = ow as f64 / oh as f64;
            let actual = fitted.x / fitted.y;
            prop_assert!((actual - expected).abs() <= expected * 1e-9);
            prop_assert!(fitted.x <= tw as f64 + 1e-6);
            prop_assert!(fitted.y <= th as f64 + 1e-6);
        }
    }
}
