use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    codec::{CodecEncoder, CodecModule, TextureKind},
    error::TranscodeError,
    options::{EncodeOptions, EncodeOverrides},
};

/// A configured encoder, owned for the length of one batch.
///
/// The configuration is fixed at creation. Dropping the session releases the encoder.
pub struct EncoderSession {
    options: EncodeOptions,
    encoder: Box<dyn CodecEncoder>,
    codec_name: String,
}

impl EncoderSession {
    pub fn create(
        codec: &dyn CodecModule,
        overrides: &EncodeOverrides,
    ) -> Result<Self, TranscodeError> {
        let options = EncodeOptions::merged(overrides);
        options.validate()?;

        let mut encoder = codec
            .create_encoder()
            .map_err(|err| TranscodeError::Initialization(err.to_string()))?;
        apply_options(encoder.as_mut(), &options)?;

        info!(
            "Created {} encoder session ({}, {})",
            codec.name(),
            if options.uastc { "UASTC" } else { "ETC1S" },
            options.container().extension()
        );

        Ok(Self {
            options,
            encoder,
            codec_name: codec.name().to_owned(),
        })
    }

    pub fn options(&self) -> &EncodeOptions {
        &self.options
    }

    pub fn encoder_mut(&mut self) -> &mut dyn CodecEncoder {
        self.encoder.as_mut()
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        debug!("Released {} encoder session", self.codec_name);
    }
}

fn apply_options(
    encoder: &mut dyn CodecEncoder,
    options: &EncodeOptions,
) -> Result<(), TranscodeError> {
    encoder.set_debug(options.debug);
    encoder.set_uastc(options.uastc);
    encoder.set_create_ktx2_file(options.ktx2_file);
    encoder.set_ktx2_srgb_transfer_func(options.srgb_transfer_function);
    encoder.set_mip_gen(options.generate_mipmaps);
    if let Some(y_flip) = options.y_flip {
        encoder.set_y_flip(y_flip);
    }
    if let Some(level) = options.quality_level {
        encoder.set_quality_level(level);
    }
    if let Some(level) = options.compression_level {
        encoder.set_compression_level(level);
    }
    encoder.set_ktx2_uastc_supercompression(options.supercompression);
    if let Some(normal_map) = options.normal_map {
        encoder.set_normal_map(normal_map);
    }
    encoder.set_perceptual(options.perceptual);

    for (key, value) in &options.kv_data {
        encoder.set_key_value(key, &value.to_bytes());
    }

    encoder
        .set_tex_type(TextureKind::Image2d)
        .map_err(|err| TranscodeError::InvalidOptions(err.to_string()))
}

/// Lazily created, batch-scoped holder of an [`EncoderSession`].
pub struct SessionSlot {
    codec: Arc<dyn CodecModule>,
    session: Option<EncoderSession>,
}

impl SessionSlot {
    pub fn new(codec: Arc<dyn CodecModule>) -> Self {
        Self {
            codec,
            session: None,
        }
    }

    /// Returns the session, creating it on first use.
    ///
    /// Fails with [`TranscodeError::SessionMismatch`] when a session already exists
    /// with options that differ from `overrides`.
    pub fn acquire(
        &mut self,
        overrides: &EncodeOverrides,
    ) -> Result<&mut EncoderSession, TranscodeError> {
        if let Some(session) = &self.session {
            if session.options != EncodeOptions::merged(overrides) {
                return Err(TranscodeError::SessionMismatch);
            }
        }

        match &mut self.session {
            Some(session) => Ok(session),
            slot => {
                let session = EncoderSession::create(self.codec.as_ref(), overrides)?;
                Ok(slot.insert(session))
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn release(&mut self) {
        self.session = None;
    }
}
