use tracing::{debug, trace};

use crate::{
    codec::SourceKind, error::TranscodeError, options::OutputCapacity, session::EncoderSession,
    texture::RasterImage,
};

/// Feeds rasters through an encoder session, reusing one scratch buffer across calls.
pub struct Transcoder {
    scratch: Vec<u8>,
    capacity: OutputCapacity,
}

impl Transcoder {
    pub fn new(capacity: OutputCapacity) -> Self {
        Self {
            scratch: Vec::new(),
            capacity,
        }
    }

    /// Current scratch buffer size, zero until the first call.
    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    pub fn transcode(
        &mut self,
        session: &mut EncoderSession,
        raster: &RasterImage,
    ) -> Result<Vec<u8>, TranscodeError> {
        let (width, height) = (raster.width(), raster.height());
        let encode_error = |reason: String| TranscodeError::Encode {
            width,
            height,
            reason,
        };

        let encoder = session.encoder_mut();
        encoder
            .set_slice_source_image(0, raster.pixels(), width, height, SourceKind::Raw)
            .map_err(|err| encode_error(err.to_string()))?;

        if self.scratch.len() < self.capacity.initial {
            self.scratch.resize(self.capacity.initial, 0);
        }

        loop {
            let written = encoder.encode(&mut self.scratch);
            if written > 0 {
                trace!("Encoded {}x{} into {} bytes", width, height, written);
                return Ok(self.scratch[..written].to_vec());
            }

            let current = self.scratch.len();
            let next = match encoder.required_output_len() {
                Some(required) if required > current => required,
                Some(_) => {
                    return Err(encode_error(
                        encoder
                            .last_error()
                            .unwrap_or_else(|| "encoder wrote zero bytes".to_owned()),
                    ))
                }
                None => match encoder.last_error() {
                    Some(reason) => return Err(encode_error(reason)),
                    None => current.saturating_mul(2),
                },
            };

            if next > self.capacity.max {
                return Err(encode_error(format!(
                    "output needs more than the {} byte limit",
                    self.capacity.max
                )));
            }

            debug!("Growing encode buffer from {} to {} bytes", current, next);
            self.scratch.resize(next, 0);
        }
    }
}
