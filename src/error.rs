use thiserror::Error;

use crate::codec::CodecError;

/// Errors produced while transcoding the textures of a document.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The source image bytes could not be decoded.
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// The codec engine failed to bootstrap.
    #[error("Failed to initialize codec engine: {0}")]
    Initialization(String),

    /// The encoder produced no output for a {width}x{height} raster.
    #[error("Failed to encode {width}x{height} raster: {reason}")]
    Encode {
        width: u32,
        height: u32,
        reason: String,
    },

    /// The raster context failed to resample one image.
    #[error("Failed to resample image: {0}")]
    Resample(String),

    /// No raster context could be created.
    #[error("Raster context is not available: {0}")]
    ContextUnavailable(String),

    #[error("Invalid encode options: {0}")]
    InvalidOptions(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An encoder session already exists with a different configuration.
    #[error("Encoder session was created with different options")]
    SessionMismatch,

    /// A texture failed while the batch was running in fail-fast mode.
    #[error("Texture '{name}' failed: {source}")]
    Texture {
        name: String,
        #[source]
        source: Box<TranscodeError>,
    },
}

impl TranscodeError {
    /// Errors that make every remaining texture of a batch fail the same way.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Initialization(_)
            | Self::ContextUnavailable(_)
            | Self::InvalidOptions(_)
            | Self::InvalidConfig(_)
            | Self::SessionMismatch => true,
            Self::Texture { source, .. } => source.is_fatal(),
            Self::Decode(_) | Self::Encode { .. } | Self::Resample(_) => false,
        }
    }

    /// The innermost error, looking through the fail-fast texture wrapper.
    pub fn root(&self) -> &TranscodeError {
        match self {
            Self::Texture { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<image::ImageError> for TranscodeError {
    fn from(err: image::ImageError) -> Self {
        TranscodeError::Decode(err.to_string())
    }
}

impl From<CodecError> for TranscodeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Unavailable(msg) => TranscodeError::Initialization(msg),
            other => TranscodeError::Encode {
                width: 0,
                height: 0,
                reason: other.to_string(),
            },
        }
    }
}
