use std::{collections::BTreeMap, time::Instant};

use image::{imageops::FilterType, Rgba, RgbaImage};
use intel_tex_2::{bc7, etc1, RgbaSurface};
use tracing::{debug, trace};

use super::{
    container::{self, ContainerDesc},
    CodecEncoder, CodecError, CodecModule, SourceKind, TextureKind,
};
use crate::texture::BlockFormat;

const ZSTD_LEVEL: i32 = 6;

/// Built-in engine driving the ISPC texture compressor.
///
/// UASTC mode emits BC7 blocks and ETC1S mode emits ETC1 blocks, wrapped in a KTX2 or
/// KTX 1.1 container.
///
/// The payloads carry plain BC7 / ETC2 `vkFormat`s, not Basis Universal data. Documents
/// still declare `KHR_texture_basisu`, which only allows Basis payloads, so strict glTF
/// consumers reject them. Plug in a Basis [`CodecModule`] when the output has to load
/// there.
#[derive(Debug, Default, Clone, Copy)]
pub struct IspcCodec;

impl CodecModule for IspcCodec {
    fn name(&self) -> &str {
        "ispc"
    }

    fn create_encoder(&self) -> Result<Box<dyn CodecEncoder>, CodecError> {
        Ok(Box::new(IspcEncoder::default()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EncoderSettings {
    debug: bool,
    uastc: bool,
    ktx2: bool,
    srgb: bool,
    mip_gen: bool,
    y_flip: bool,
    quality_level: u32,
    compression_level: u32,
    supercompression: bool,
    normal_map: bool,
    perceptual: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            debug: false,
            uastc: false,
            ktx2: true,
            srgb: true,
            mip_gen: false,
            y_flip: false,
            quality_level: 128,
            compression_level: 2,
            supercompression: false,
            normal_map: false,
            perceptual: true,
        }
    }
}

#[derive(Default)]
pub struct IspcEncoder {
    settings: EncoderSettings,
    key_values: BTreeMap<String, Vec<u8>>,
    source: Option<RgbaImage>,
    /// Container built by an `encode` call whose output buffer was too small.
    pending: Option<Vec<u8>>,
    last_error: Option<String>,
}

impl IspcEncoder {
    fn invalidate(&mut self) {
        self.pending = None;
    }

    fn format(&self) -> BlockFormat {
        if self.settings.uastc {
            BlockFormat::Bc7RgbaUnorm
        } else {
            BlockFormat::Etc1RgbUnorm
        }
    }

    fn srgb(&self) -> bool {
        self.settings.srgb && !self.settings.normal_map
    }

    /// Writer parameters recorded in the container metadata.
    fn writer_params(&self) -> String {
        let settings = &self.settings;
        let mut params = vec![if settings.uastc {
            format!("--bc7 --level {}", settings.compression_level)
        } else {
            format!("--etc1 --qlevel {}", settings.quality_level)
        }];
        if settings.mip_gen {
            params.push("--genmipmap".to_owned());
        }
        if settings.y_flip {
            params.push("--y_flip".to_owned());
        }
        if settings.normal_map {
            params.push("--normal_mode".to_owned());
        }
        if !settings.perceptual {
            params.push("--linear_metrics".to_owned());
        }
        if self.supercompressed() {
            params.push(format!("--zcmp {}", ZSTD_LEVEL));
        }
        params.join(" ")
    }

    fn supercompressed(&self) -> bool {
        self.settings.supercompression && self.settings.uastc && self.settings.ktx2
    }

    fn mip_chain(&self, source: &RgbaImage) -> Vec<RgbaImage> {
        let base = if self.settings.y_flip {
            image::imageops::flip_vertical(source)
        } else {
            source.clone()
        };

        let mut levels = vec![base];
        if self.settings.mip_gen {
            while let Some(previous) = levels
                .last()
                .filter(|level| level.width() > 1 || level.height() > 1)
            {
                let next = image::imageops::resize(
                    previous,
                    (previous.width() / 2).max(1),
                    (previous.height() / 2).max(1),
                    FilterType::Triangle,
                );
                levels.push(next);
            }
        }
        levels
    }

    fn compress_level(&self, level: &RgbaImage, opaque: bool) -> Vec<u8> {
        let padded = pad_to_blocks(level);
        let surface = RgbaSurface {
            data: padded.as_raw(),
            width: padded.width(),
            height: padded.height(),
            stride: padded.width() * 4,
        };

        let format = self.format();
        let blocks = match format {
            BlockFormat::Bc7RgbaUnorm => {
                let settings = match (self.settings.compression_level, opaque) {
                    (0, true) => bc7::opaque_ultra_fast_settings(),
                    (0, false) => bc7::alpha_ultra_fast_settings(),
                    (1, true) => bc7::opaque_very_fast_settings(),
                    (1, false) => bc7::alpha_very_fast_settings(),
                    (2..=3, true) => bc7::opaque_fast_settings(),
                    (2..=3, false) => bc7::alpha_fast_settings(),
                    (4..=5, true) => bc7::opaque_basic_settings(),
                    (4..=5, false) => bc7::alpha_basic_settings(),
                    (_, true) => bc7::opaque_slow_settings(),
                    (_, false) => bc7::alpha_slow_settings(),
                };
                bc7::compress_blocks(&settings, &surface)
            }
            BlockFormat::Etc1RgbUnorm => etc1::compress_blocks(etc1::slow_settings(), &surface),
        };
        debug_assert_eq!(blocks.len(), format.level_size(level.width(), level.height()));
        blocks
    }

    fn build_container(&self) -> Result<Vec<u8>, CodecError> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| CodecError::InvalidSource("no source image for slice 0".to_owned()))?;

        let start = Instant::now();
        let opaque = source.pixels().all(|texel| texel[3] == 255);
        let levels = self
            .mip_chain(source)
            .iter()
            .map(|level| self.compress_level(level, opaque))
            .collect::<Vec<_>>();

        let mut key_values = self.key_values.clone();
        key_values
            .entry("KTXwriter".to_owned())
            .or_insert_with(|| format!("texbake {}\0", env!("CARGO_PKG_VERSION")).into_bytes());
        key_values
            .entry("KTXwriterScParams".to_owned())
            .or_insert_with(|| format!("{}\0", self.writer_params()).into_bytes());

        let desc = ContainerDesc {
            format: self.format(),
            srgb: self.srgb(),
            width: source.width(),
            height: source.height(),
            levels: &levels,
            key_values: &key_values,
        };

        let bytes = if self.settings.ktx2 {
            container::write_ktx2(&desc, self.supercompressed().then_some(ZSTD_LEVEL))?
        } else {
            container::write_ktx(&desc)
        };

        if self.settings.debug {
            debug!(
                "Encoded {}x{} ({:?}, {} levels, opaque: {}) into {} bytes in {:.2?}",
                source.width(),
                source.height(),
                desc.format,
                levels.len(),
                opaque,
                bytes.len(),
                start.elapsed()
            );
        }
        Ok(bytes)
    }
}

/// Copies `image` into a buffer whose dimensions are multiples of 4, repeating the
/// last row and column into the padding.
fn pad_to_blocks(image: &RgbaImage) -> RgbaImage {
    let (width, height) = (image.width(), image.height());
    let padded_width = width.div_ceil(4) * 4;
    let padded_height = height.div_ceil(4) * 4;
    if padded_width == width && padded_height == height {
        return image.clone();
    }

    RgbaImage::from_fn(padded_width, padded_height, |x, y| -> Rgba<u8> {
        *image.get_pixel(x.min(width - 1), y.min(height - 1))
    })
}

impl CodecEncoder for IspcEncoder {
    fn set_debug(&mut self, enabled: bool) {
        self.settings.debug = enabled;
    }

    fn set_uastc(&mut self, enabled: bool) {
        self.settings.uastc = enabled;
        self.invalidate();
    }

    fn set_create_ktx2_file(&mut self, enabled: bool) {
        self.settings.ktx2 = enabled;
        self.invalidate();
    }

    fn set_ktx2_srgb_transfer_func(&mut self, enabled: bool) {
        self.settings.srgb = enabled;
        self.invalidate();
    }

    fn set_mip_gen(&mut self, enabled: bool) {
        self.settings.mip_gen = enabled;
        self.invalidate();
    }

    fn set_y_flip(&mut self, enabled: bool) {
        self.settings.y_flip = enabled;
        self.invalidate();
    }

    fn set_quality_level(&mut self, level: u32) {
        self.settings.quality_level = level;
        self.invalidate();
    }

    fn set_compression_level(&mut self, level: u32) {
        self.settings.compression_level = level;
        self.invalidate();
    }

    fn set_ktx2_uastc_supercompression(&mut self, enabled: bool) {
        self.settings.supercompression = enabled;
        self.invalidate();
    }

    fn set_normal_map(&mut self, enabled: bool) {
        self.settings.normal_map = enabled;
        self.invalidate();
    }

    fn set_perceptual(&mut self, enabled: bool) {
        self.settings.perceptual = enabled;
        self.invalidate();
    }

    fn set_tex_type(&mut self, kind: TextureKind) -> Result<(), CodecError> {
        if kind != TextureKind::Image2d {
            return Err(CodecError::Unsupported(format!(
                "texture type {:?}, only single 2D images are encoded",
                kind
            )));
        }
        Ok(())
    }

    fn set_key_value(&mut self, key: &str, value: &[u8]) {
        self.key_values.insert(key.to_owned(), value.to_vec());
        self.invalidate();
    }

    fn set_slice_source_image(
        &mut self,
        slice: u32,
        data: &[u8],
        width: u32,
        height: u32,
        kind: SourceKind,
    ) -> Result<(), CodecError> {
        if slice != 0 {
            return Err(CodecError::Unsupported(format!(
                "slice {}, only slice 0 is encoded",
                slice
            )));
        }

        let image = match kind {
            SourceKind::Raw => RgbaImage::from_raw(width, height, data.to_vec()).ok_or_else(|| {
                CodecError::InvalidSource(format!(
                    "{} bytes do not hold a {}x{} RGBA8 image",
                    data.len(),
                    width,
                    height
                ))
            })?,
            SourceKind::Png => image::load_from_memory_with_format(data, image::ImageFormat::Png)
                .map_err(|err| CodecError::InvalidSource(err.to_string()))?
                .into_rgba8(),
        };
        if image.width() == 0 || image.height() == 0 {
            return Err(CodecError::InvalidSource("image has no texels".to_owned()));
        }

        trace!("Slice {} set to {}x{}", slice, image.width(), image.height());
        self.source = Some(image);
        self.invalidate();
        Ok(())
    }

    fn encode(&mut self, output: &mut [u8]) -> usize {
        self.last_error = None;
        let bytes = match self.pending.take() {
            Some(bytes) => bytes,
            None => match self.build_container() {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.last_error = Some(err.to_string());
                    return 0;
                }
            },
        };

        if bytes.len() > output.len() {
            self.pending = Some(bytes);
            return 0;
        }

        output[..bytes.len()].copy_from_slice(&bytes);
        bytes.len()
    }

    fn required_output_len(&self) -> Option<usize> {
        self.pending.as_ref().map(Vec::len)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::container::KTX2_IDENTIFIER;

    fn gradient(width: u32, height: u32, alpha: u8) -> Vec<u8> {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 16) as u8, (y * 16) as u8, 64, alpha])
        })
        .into_raw()
    }

    fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn encode_once(encoder: &mut IspcEncoder) -> Vec<u8> {
        let mut output = vec![0u8; 1 << 20];
        let written = encoder.encode(&mut output);
        assert!(written > 0, "{:?}", encoder.last_error());
        output.truncate(written);
        output
    }

    #[test]
    fn test_encode_is_deterministic() {
        let mut encoder = IspcEncoder::default();
        encoder.set_uastc(true);
        encoder.set_mip_gen(true);
        encoder
            .set_slice_source_image(0, &gradient(16, 8, 255), 16, 8, SourceKind::Raw)
            .unwrap();

        let first = encode_once(&mut encoder);
        let second = encode_once(&mut encoder);
        assert_eq!(first, second);
        assert_eq!(&first[..12], &KTX2_IDENTIFIER);
        // VK_FORMAT_BC7_SRGB_BLOCK, not a Basis Universal payload.
        assert_eq!(read_u32(&first, 12), 146);
        // 16x8, 8x4, 4x2, 2x1, 1x1
        assert_eq!(read_u32(&first, 40), 5);
    }

    #[test]
    fn test_small_output_reports_required_length() {
        let mut encoder = IspcEncoder::default();
        encoder.set_uastc(true);
        encoder
            .set_slice_source_image(0, &gradient(8, 8, 128), 8, 8, SourceKind::Raw)
            .unwrap();

        let mut tiny = vec![0u8; 16];
        assert_eq!(encoder.encode(&mut tiny), 0);
        let required = encoder.required_output_len().unwrap();
        assert!(required > 16);

        let mut output = vec![0u8; required];
        assert_eq!(encoder.encode(&mut output), required);
        assert_eq!(encoder.required_output_len(), None);
    }

    #[test]
    fn test_etc1_mode_writes_etc2_rgb() {
        let mut encoder = IspcEncoder::default();
        encoder.set_uastc(false);
        encoder.set_ktx2_srgb_transfer_func(false);
        encoder
            .set_slice_source_image(0, &gradient(6, 6, 255), 6, 6, SourceKind::Raw)
            .unwrap();

        let bytes = encode_once(&mut encoder);
        assert_eq!(read_u32(&bytes, 12), 147);
        assert_eq!(read_u32(&bytes, 20), 6);
        // Padded to 8x8: four ETC1 blocks.
        let level_len = u64::from_le_bytes(bytes[88..96].try_into().unwrap());
        assert_eq!(level_len, 4 * 8);
    }

    #[test]
    fn test_legacy_ktx_container() {
        let mut encoder = IspcEncoder::default();
        encoder.set_uastc(true);
        encoder.set_create_ktx2_file(false);
        encoder.set_key_value("source", b"unit-test\0");
        encoder
            .set_slice_source_image(0, &gradient(4, 4, 255), 4, 4, SourceKind::Raw)
            .unwrap();

        let bytes = encode_once(&mut encoder);
        assert_eq!(&bytes[..12], &container::KTX_IDENTIFIER);
        assert!(bytes
            .windows(b"unit-test".len())
            .any(|window| window == b"unit-test"));
    }

    #[test]
    fn test_rejects_non_2d_and_bad_sources() {
        let mut encoder = IspcEncoder::default();
        assert!(encoder.set_tex_type(TextureKind::Image2d).is_ok());
        assert!(matches!(
            encoder.set_tex_type(TextureKind::CubemapArray),
            Err(CodecError::Unsupported(_))
        ));
        assert!(matches!(
            encoder.set_slice_source_image(0, &[0u8; 10], 4, 4, SourceKind::Raw),
            Err(CodecError::InvalidSource(_))
        ));
        assert!(matches!(
            encoder.set_slice_source_image(1, &gradient(4, 4, 255), 4, 4, SourceKind::Raw),
            Err(CodecError::Unsupported(_))
        ));
    }

    #[test]
    fn test_encode_without_source_fails() {
        let mut encoder = IspcEncoder::default();
        let mut output = vec![0u8; 1024];
        assert_eq!(encoder.encode(&mut output), 0);
        assert_eq!(encoder.required_output_len(), None);
        assert!(encoder.last_error().is_some());
    }

    #[test]
    fn test_y_flip_changes_payload() {
        let source = gradient(8, 8, 255);
        let mut plain = IspcEncoder::default();
        plain.set_uastc(true);
        plain
            .set_slice_source_image(0, &source, 8, 8, SourceKind::Raw)
            .unwrap();

        let mut flipped = IspcEncoder::default();
        flipped.set_uastc(true);
        flipped.set_y_flip(true);
        flipped
            .set_slice_source_image(0, &source, 8, 8, SourceKind::Raw)
            .unwrap();

        assert_ne!(encode_once(&mut plain), encode_once(&mut flipped));
    }
}
