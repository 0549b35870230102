use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    codec::CodecModule,
    document::{SceneDocument, TextureRecord},
    error::TranscodeError,
    options::{EncodeOverrides, FailurePolicy, ResizeSpec, TextureCompressionConfig, UriRewrite},
    raster::Normalizer,
    session::SessionSlot,
    texture::ContainerKind,
    transcode::Transcoder,
};

pub const STEP_NAME: &str = "textureCompressKTX2";
pub const KHR_TEXTURE_BASISU: &str = "KHR_texture_basisu";

#[derive(Debug)]
pub enum TextureStatus {
    Compressed { width: u32, height: u32, bytes: usize },
    Skipped,
    Failed(TranscodeError),
}

#[derive(Debug)]
pub struct TextureOutcome {
    pub index: usize,
    pub name: String,
    pub status: TextureStatus,
    pub elapsed: Duration,
}

/// Per-texture results of one run, in document order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<TextureOutcome>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn compressed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, TextureStatus::Compressed { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, TextureStatus::Skipped))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TextureOutcome, &TranscodeError)> {
        self.outcomes.iter().filter_map(|outcome| match &outcome.status {
            TextureStatus::Failed(err) => Some((outcome, err)),
            _ => None,
        })
    }
}

struct Compressed {
    width: u32,
    height: u32,
    container: ContainerKind,
    payload: Vec<u8>,
}

/// Compresses every texture of a document into KTX2 (or KTX) with one shared encoder
/// session per run.
pub struct TextureCompressionStep {
    config: TextureCompressionConfig,
    codec: Arc<dyn CodecModule>,
    normalizer: Normalizer,
}

impl TextureCompressionStep {
    pub fn new(
        config: TextureCompressionConfig,
        codec: Arc<dyn CodecModule>,
        normalizer: Normalizer,
    ) -> Result<Self, TranscodeError> {
        config.validate()?;
        Ok(Self {
            config,
            codec,
            normalizer,
        })
    }

    pub fn name(&self) -> &'static str {
        STEP_NAME
    }

    pub fn config(&self) -> &TextureCompressionConfig {
        &self.config
    }

    /// Runs the batch over `document`.
    ///
    /// Textures committed before a fail-fast abort stay rewritten.
    pub fn run<D: SceneDocument>(&mut self, document: &mut D) -> Result<BatchReport, TranscodeError> {
        let start = Instant::now();
        document.require_extension(KHR_TEXTURE_BASISU);

        let mut slot = SessionSlot::new(self.codec.clone());
        let mut transcoder = Transcoder::new(self.config.output_capacity);
        let mut report = BatchReport::default();

        for (index, texture) in document.textures_mut().iter_mut().enumerate() {
            let texture_start = Instant::now();
            let name = texture.name().to_owned();
            let resize = self.config.resize_for(&name);

            let result = texture.image().map(|encoded| {
                compress(
                    &mut self.normalizer,
                    &mut slot,
                    &mut transcoder,
                    &self.config.encode_options,
                    encoded,
                    resize,
                )
            });

            let status = match result {
                None => {
                    warn!("Texture {} ('{}') has no image, skipping", index, name);
                    TextureStatus::Skipped
                }
                Some(Ok(compressed)) => {
                    let status = TextureStatus::Compressed {
                        width: compressed.width,
                        height: compressed.height,
                        bytes: compressed.payload.len(),
                    };
                    commit(texture, compressed, self.config.uri_rewrite);
                    status
                }
                Some(Err(err)) if err.is_fatal() => return Err(err),
                Some(Err(err)) => match self.config.failure_policy {
                    FailurePolicy::FailFast => {
                        return Err(TranscodeError::Texture {
                            name,
                            source: Box::new(err),
                        })
                    }
                    FailurePolicy::Continue => {
                        warn!("Texture {} ('{}') failed: {}", index, name, err);
                        TextureStatus::Failed(err)
                    }
                },
            };

            let elapsed = texture_start.elapsed();
            debug!("Texture {} ('{}') finished in {:.2?}", index, name, elapsed);
            report.outcomes.push(TextureOutcome {
                index,
                name,
                status,
                elapsed,
            });
        }

        report.elapsed = start.elapsed();
        info!(
            "{}: {} compressed, {} skipped, {} failed in {:.2?}",
            STEP_NAME,
            report.compressed_count(),
            report.skipped_count(),
            report.failures().count(),
            report.elapsed
        );
        Ok(report)
    }
}

fn compress(
    normalizer: &mut Normalizer,
    slot: &mut SessionSlot,
    transcoder: &mut Transcoder,
    overrides: &EncodeOverrides,
    encoded: &[u8],
    resize: ResizeSpec,
) -> Result<Compressed, TranscodeError> {
    let session = slot.acquire(overrides)?;
    let container = session.options().container();

    let raster = normalizer.normalize(encoded, resize)?;
    let payload = transcoder.transcode(session, &raster)?;

    Ok(Compressed {
        width: raster.width(),
        height: raster.height(),
        container,
        payload,
    })
}

fn commit<T: TextureRecord>(texture: &mut T, compressed: Compressed, rewrite: UriRewrite) {
    texture.set_image(compressed.payload);
    texture.set_mime_type(compressed.container.mime_type());
    if let Some(uri) = texture
        .uri()
        .map(|uri| rewrite_uri(uri, rewrite, compressed.container))
    {
        texture.set_uri(uri);
    }
}

/// `foo/bar.png` becomes `bar.ktx2` (basename) or `foo/bar.ktx2` (preserve path).
pub fn rewrite_uri(uri: &str, rewrite: UriRewrite, container: ContainerKind) -> String {
    let (directory, file) = match uri.rfind(['/', '\\']) {
        Some(split) => uri.split_at(split + 1),
        None => ("", uri),
    };
    let stem = match file.rfind('.') {
        Some(dot) if dot > 0 => &file[..dot],
        _ => file,
    };

    match rewrite {
        UriRewrite::Basename => format!("{}.{}", stem, container.extension()),
        UriRewrite::PreservePath => format!("{}{}.{}", directory, stem, container.extension()),
    }
}

/// Step with the built-in codec engine and the raster context `config.resampler` asks for.
#[cfg(feature = "intel_tex_2")]
pub fn make_texture_compression_step(
    config: TextureCompressionConfig,
) -> Result<TextureCompressionStep, TranscodeError> {
    config.validate()?;
    let normalizer = Normalizer::new(crate::raster::make_raster_context(config.resampler)?);
    TextureCompressionStep::new(config, Arc::new(crate::codec::IspcCodec), normalizer)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

    use super::*;
    use crate::{
        document::{Texture, TextureSet},
        options::OutputCapacity,
        session::tests::RecordingCodec,
    };

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([9, 8, 7, 255])))
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn small() -> TextureCompressionConfig {
        TextureCompressionConfig::new(ResizeSpec::new(16, 16))
    }

    fn step(config: TextureCompressionConfig, codec: Arc<RecordingCodec>) -> TextureCompressionStep {
        TextureCompressionStep::new(config, codec, Normalizer::cpu()).unwrap()
    }

    #[test]
    fn test_rewrite_uri() {
        let ktx2 = ContainerKind::Ktx2;
        assert_eq!(rewrite_uri("foo/bar.png", UriRewrite::Basename, ktx2), "bar.ktx2");
        assert_eq!(
            rewrite_uri("foo/bar.png", UriRewrite::PreservePath, ktx2),
            "foo/bar.ktx2"
        );
        assert_eq!(rewrite_uri("bar.tar.png", UriRewrite::Basename, ktx2), "bar.tar.ktx2");
        assert_eq!(rewrite_uri("dir\\.hidden", UriRewrite::PreservePath, ktx2), "dir\\.hidden.ktx2");
        assert_eq!(rewrite_uri("plain", UriRewrite::Basename, ContainerKind::Ktx), "plain.ktx");
    }

    #[test]
    fn test_skips_textures_without_image() {
        let codec = Arc::new(RecordingCodec::new());
        let mut document = TextureSet::new(vec![
            Texture::new("empty").with_uri("empty.png"),
            Texture::new("albedo").with_image(png(300, 200), "image/png"),
        ]);

        let report = step(TextureCompressionConfig::new(ResizeSpec::new(512, 512)), codec.clone())
            .run(&mut document)
            .unwrap();

        assert_eq!(document.textures.len(), 2);
        assert_eq!(document.textures[0], Texture::new("empty").with_uri("empty.png"));
        assert!(matches!(report.outcomes[0].status, TextureStatus::Skipped));
        assert!(matches!(
            report.outcomes[1].status,
            TextureStatus::Compressed {
                width: 512,
                height: 512,
                bytes: 4
            }
        ));
        assert_eq!(document.textures[1].mime_type.as_deref(), Some("image/ktx2"));
        assert!(codec.calls().contains(&"slice0=512x512:Raw".to_owned()));
        assert_eq!(document.extensions_required, vec![KHR_TEXTURE_BASISU]);
    }

    #[test]
    fn test_session_is_created_lazily_once() {
        let codec = Arc::new(RecordingCodec::new());
        let mut empty = TextureSet::new(vec![Texture::new("nothing")]);
        let mut compression = step(small(), codec.clone());
        compression.run(&mut empty).unwrap();
        assert_eq!(codec.created.load(std::sync::atomic::Ordering::SeqCst), 0);

        let mut document = TextureSet::new(vec![
            Texture::new("a").with_image(png(8, 8), "image/png"),
            Texture::new("b").with_image(png(8, 8), "image/png"),
        ]);
        compression.run(&mut document).unwrap();
        assert_eq!(codec.created.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_override_by_name() {
        let codec = Arc::new(RecordingCodec::new());
        let config = TextureCompressionConfig::new(ResizeSpec::new(64, 64))
            .with_override("hero", ResizeSpec::new(256, 256));
        let mut document = TextureSet::new(vec![
            Texture::new("hero").with_image(png(32, 32), "image/png"),
            Texture::new("prop").with_image(png(32, 32), "image/png"),
        ]);

        let report = step(config, codec).run(&mut document).unwrap();
        assert!(matches!(
            report.outcomes[0].status,
            TextureStatus::Compressed { width: 256, height: 256, .. }
        ));
        assert!(matches!(
            report.outcomes[1].status,
            TextureStatus::Compressed { width: 64, height: 64, .. }
        ));
    }

    #[test]
    fn test_continue_and_fail_fast_policies() {
        let textures = || {
            vec![
                Texture::new("good").with_image(png(4, 4), "image/png").with_uri("a/good.png"),
                Texture::new("bad").with_image(b"corrupt".to_vec(), "image/png"),
                Texture::new("late").with_image(png(4, 4), "image/png"),
            ]
        };

        let mut document = TextureSet::new(textures());
        let report = step(small(), Arc::new(RecordingCodec::new()))
            .run(&mut document)
            .unwrap();
        assert_eq!(report.compressed_count(), 2);
        let (failed, err) = report.failures().next().unwrap();
        assert_eq!(failed.name, "bad");
        assert!(matches!(err, TranscodeError::Decode(_)));
        assert_eq!(document.textures[0].uri.as_deref(), Some("good.ktx2"));
        assert_eq!(document.textures[1].image.as_deref(), Some(&b"corrupt"[..]));

        let mut document = TextureSet::new(textures());
        let config =
            small().with_failure_policy(FailurePolicy::FailFast);
        let err = step(config, Arc::new(RecordingCodec::new()))
            .run(&mut document)
            .unwrap_err();
        assert!(matches!(&err, TranscodeError::Texture { name, .. } if name == "bad"));
        // No rollback of earlier textures, nothing after the failure is touched.
        assert_eq!(document.textures[0].mime_type.as_deref(), Some("image/ktx2"));
        assert_eq!(document.textures[2].mime_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_invalid_options_are_rejected_up_front() {
        let config = small().with_encode_options(EncodeOverrides {
            compression_level: Some(9),
            ..Default::default()
        });
        let err = TextureCompressionStep::new(config, Arc::new(RecordingCodec::new()), Normalizer::cpu())
            .err()
            .unwrap();
        assert!(matches!(err, TranscodeError::InvalidOptions(_)));
    }

    #[test]
    fn test_session_setup_failure_is_batch_fatal() {
        let textures = || {
            vec![
                Texture::new("a").with_image(png(4, 4), "image/png"),
                Texture::new("b").with_image(png(4, 4), "image/png"),
            ]
        };

        for policy in [FailurePolicy::Continue, FailurePolicy::FailFast] {
            let codec = Arc::new(RecordingCodec::new().rejecting_tex_type());
            let mut document = TextureSet::new(textures());
            let err = step(small().with_failure_policy(policy), codec)
                .run(&mut document)
                .unwrap_err();
            assert!(matches!(err, TranscodeError::InvalidOptions(_)));
            assert_eq!(document.textures, textures());
        }
    }

    #[test]
    fn test_zero_byte_encode_fails_fast_after_earlier_commits() {
        let codec = Arc::new(RecordingCodec::new().with_encode_limit(1));
        let config = small()
            .with_failure_policy(FailurePolicy::FailFast)
            .with_output_capacity(OutputCapacity {
                initial: 64,
                max: 256,
            });
        let mut document = TextureSet::new(vec![
            Texture::new("first").with_image(png(4, 4), "image/png"),
            Texture::new("second").with_image(png(4, 4), "image/png"),
            Texture::new("third").with_image(png(4, 4), "image/png"),
        ]);

        let err = step(config, codec.clone()).run(&mut document).unwrap_err();
        match &err {
            TranscodeError::Texture { name, source } => {
                assert_eq!(name, "second");
                assert!(matches!(
                    **source,
                    TranscodeError::Encode {
                        width: 16,
                        height: 16,
                        ..
                    }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(document.textures[0].mime_type.as_deref(), Some("image/ktx2"));
        assert_eq!(document.textures[0].image.as_deref(), Some(&b"KTX2"[..]));
        assert_eq!(document.textures[1].mime_type.as_deref(), Some("image/png"));
        assert_eq!(document.textures[2].mime_type.as_deref(), Some("image/png"));
        // 64, 128 and 256 byte attempts before the limit is hit.
        let zero_writes = codec.calls().iter().filter(|call| *call == "encode=0").count();
        assert_eq!(zero_writes, 3);
    }
}
