//! Codec engine boundary.
//!
//! A [`CodecModule`] bootstraps encoders; a [`CodecEncoder`] is one configured,
//! non-reentrant encoder instance. The pipeline only talks to these traits, so a
//! different engine can be plugged in without touching the session or transcoder.

pub mod container;
#[cfg(feature = "intel_tex_2")]
mod ispc;

use thiserror::Error;

#[cfg(feature = "intel_tex_2")]
pub use ispc::{IspcCodec, IspcEncoder};

#[derive(Debug, Error)]
pub enum CodecError {
    /// The engine could not be loaded or initialized.
    #[error("Codec engine unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid source image: {0}")]
    InvalidSource(String),

    #[error("Unsupported by this engine: {0}")]
    Unsupported(String),

    #[error("Supercompression failed: {0}")]
    Supercompression(String),
}

/// How the bytes handed to [`CodecEncoder::set_slice_source_image`] are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Tightly packed RGBA8 texels.
    Raw,
    /// An encoded PNG file.
    Png,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextureKind {
    #[default]
    Image2d,
    Image2dArray,
    CubemapArray,
    VideoFrames,
    Volume,
}

pub trait CodecModule: Send + Sync {
    fn name(&self) -> &str;

    /// Initializes the engine if needed and constructs a fresh encoder.
    fn create_encoder(&self) -> Result<Box<dyn CodecEncoder>, CodecError>;
}

/// One encoder instance. Dropping it releases the engine's resources.
pub trait CodecEncoder: Send {
    fn set_debug(&mut self, enabled: bool);
    fn set_uastc(&mut self, enabled: bool);
    fn set_create_ktx2_file(&mut self, enabled: bool);
    fn set_ktx2_srgb_transfer_func(&mut self, enabled: bool);
    fn set_mip_gen(&mut self, enabled: bool);
    fn set_y_flip(&mut self, enabled: bool);
    fn set_quality_level(&mut self, level: u32);
    fn set_compression_level(&mut self, level: u32);
    fn set_ktx2_uastc_supercompression(&mut self, enabled: bool);
    fn set_normal_map(&mut self, enabled: bool);
    fn set_perceptual(&mut self, enabled: bool);
    fn set_tex_type(&mut self, kind: TextureKind) -> Result<(), CodecError>;
    fn set_key_value(&mut self, key: &str, value: &[u8]);

    fn set_slice_source_image(
        &mut self,
        slice: u32,
        data: &[u8],
        width: u32,
        height: u32,
        kind: SourceKind,
    ) -> Result<(), CodecError>;

    /// Encodes the configured slices into `output` and returns the number of bytes
    /// written. Zero means the encode failed or `output` was too small.
    fn encode(&mut self, output: &mut [u8]) -> usize;

    /// Output length the last `encode` needed, when the engine can tell.
    fn required_output_len(&self) -> Option<usize> {
        None
    }

    /// Reason the last `encode` returned zero, when the engine can tell.
    fn last_error(&self) -> Option<String> {
        None
    }
}
