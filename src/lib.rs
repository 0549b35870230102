//! Batch compression of scene textures into KTX2.
//!
//! A [`TextureCompressionStep`] walks the textures of a [`SceneDocument`], normalizes each
//! image to power-of-two dimensions and encodes it through one shared encoder session,
//! rewriting the texture record in place.

pub mod codec;
pub mod document;
pub mod raster;

mod error;
mod options;
mod session;
mod step;
mod texture;
mod transcode;

pub use document::{SceneDocument, Texture, TextureRecord, TextureSet};
#[cfg(feature = "gltf")]
pub use document::{GltfDocument, GltfOutput};
pub use error::TranscodeError;
pub use options::{
    EncodeOptions, EncodeOverrides, FailurePolicy, KvValue, OutputCapacity, ResamplerKind,
    ResizeOverride, ResizeSpec, TextureCompressionConfig, UriRewrite, MAX_RESIZE_DIMENSION,
};
pub use raster::Normalizer;
pub use session::{EncoderSession, SessionSlot};
#[cfg(feature = "intel_tex_2")]
pub use step::make_texture_compression_step;
pub use step::{
    rewrite_uri, BatchReport, TextureCompressionStep, TextureOutcome, TextureStatus,
    KHR_TEXTURE_BASISU, STEP_NAME,
};
pub use texture::{BlockFormat, ContainerKind, RasterImage};
pub use transcode::Transcoder;
