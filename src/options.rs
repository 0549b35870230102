use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{error::TranscodeError, texture::ContainerKind};

/// Metadata value stored in the container's key/value section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KvValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl KvValue {
    /// Text values are stored NUL terminated.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => {
                let mut bytes = Vec::with_capacity(text.len() + 1);
                bytes.extend_from_slice(text.as_bytes());
                bytes.push(0);
                bytes
            }
            Self::Bytes(bytes) => bytes.clone(),
        }
    }
}

/// Fully resolved encoder configuration for one session.
///
/// Options without a default (`y_flip`, `compression_level`, `normal_map`) are only
/// forwarded to the encoder when set, leaving the engine's own default in place otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOptions {
    pub debug: bool,
    pub uastc: bool,
    pub ktx2_file: bool,
    pub srgb_transfer_function: bool,
    pub generate_mipmaps: bool,
    pub y_flip: Option<bool>,
    /// ETC1S quality, 1..=255.
    pub quality_level: Option<u32>,
    /// Encoder effort, 0..=6.
    pub compression_level: Option<u32>,
    pub supercompression: bool,
    pub normal_map: Option<bool>,
    pub perceptual: bool,
    pub kv_data: BTreeMap<String, KvValue>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            debug: false,
            uastc: true,
            ktx2_file: true,
            srgb_transfer_function: true,
            generate_mipmaps: true,
            y_flip: None,
            quality_level: Some(150),
            compression_level: None,
            supercompression: true,
            normal_map: None,
            perceptual: true,
            kv_data: BTreeMap::new(),
        }
    }
}

impl EncodeOptions {
    pub const QUALITY_LEVELS: std::ops::RangeInclusive<u32> = 1..=255;
    pub const COMPRESSION_LEVELS: std::ops::RangeInclusive<u32> = 0..=6;

    /// Defaults with every field the caller set replaced.
    pub fn merged(overrides: &EncodeOverrides) -> Self {
        let defaults = Self::default();
        let mut kv_data = defaults.kv_data;
        if let Some(extra) = &overrides.kv_data {
            kv_data.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Self {
            debug: overrides.debug.unwrap_or(defaults.debug),
            uastc: overrides.uastc.unwrap_or(defaults.uastc),
            ktx2_file: overrides.ktx2_file.unwrap_or(defaults.ktx2_file),
            srgb_transfer_function: overrides
                .srgb_transfer_function
                .unwrap_or(defaults.srgb_transfer_function),
            generate_mipmaps: overrides
                .generate_mipmaps
                .unwrap_or(defaults.generate_mipmaps),
            y_flip: overrides.y_flip.or(defaults.y_flip),
            quality_level: overrides.quality_level.or(defaults.quality_level),
            compression_level: overrides.compression_level.or(defaults.compression_level),
            supercompression: overrides
                .supercompression
                .unwrap_or(defaults.supercompression),
            normal_map: overrides.normal_map.or(defaults.normal_map),
            perceptual: overrides.perceptual.unwrap_or(defaults.perceptual),
            kv_data,
        }
    }

    pub fn validate(&self) -> Result<(), TranscodeError> {
        if let Some(level) = self.quality_level {
            if !Self::QUALITY_LEVELS.contains(&level) {
                return Err(TranscodeError::InvalidOptions(format!(
                    "quality level {} outside {:?}",
                    level,
                    Self::QUALITY_LEVELS
                )));
            }
        }
        if let Some(level) = self.compression_level {
            if !Self::COMPRESSION_LEVELS.contains(&level) {
                return Err(TranscodeError::InvalidOptions(format!(
                    "compression level {} outside {:?}",
                    level,
                    Self::COMPRESSION_LEVELS
                )));
            }
        }
        if let Some(key) = self.kv_data.keys().find(|k| k.is_empty() || k.contains('\0')) {
            return Err(TranscodeError::InvalidOptions(format!(
                "invalid metadata key {:?}",
                key
            )));
        }
        Ok(())
    }

    pub fn container(&self) -> ContainerKind {
        if self.ktx2_file {
            ContainerKind::Ktx2
        } else {
            ContainerKind::Ktx
        }
    }
}

/// Caller supplied subset of [`EncodeOptions`]. Unset fields keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EncodeOverrides {
    #[serde(alias = "enableDebug")]
    pub debug: Option<bool>,
    #[serde(alias = "isUASTC")]
    pub uastc: Option<bool>,
    #[serde(alias = "isKTX2File")]
    pub ktx2_file: Option<bool>,
    #[serde(alias = "isSetKTX2SRGBTransferFunc")]
    pub srgb_transfer_function: Option<bool>,
    #[serde(alias = "generateMipmap")]
    pub generate_mipmaps: Option<bool>,
    #[serde(alias = "isYFlip")]
    pub y_flip: Option<bool>,
    pub quality_level: Option<u32>,
    pub compression_level: Option<u32>,
    #[serde(alias = "needSupercompression")]
    pub supercompression: Option<bool>,
    #[serde(alias = "isNormalMap")]
    pub normal_map: Option<bool>,
    #[serde(alias = "isInputSRGB")]
    pub perceptual: Option<bool>,
    pub kv_data: Option<BTreeMap<String, KvValue>>,
}

/// Largest resize box edge a config accepts.
pub const MAX_RESIZE_DIMENSION: u32 = 16384;

/// Bounding box the normalized texture has to fit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct ResizeSpec {
    pub width: u32,
    pub height: u32,
}

impl ResizeSpec {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for ResizeSpec {
    fn default() -> Self {
        Self::new(1024, 1024)
    }
}

impl From<[u32; 2]> for ResizeSpec {
    fn from([width, height]: [u32; 2]) -> Self {
        Self { width, height }
    }
}

impl From<ResizeSpec> for [u32; 2] {
    fn from(spec: ResizeSpec) -> Self {
        [spec.width, spec.height]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeOverride {
    pub name: String,
    pub resize: ResizeSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Record the failure and move on to the next texture.
    #[default]
    Continue,
    /// Abort the batch on the first failing texture. Earlier textures stay committed.
    FailFast,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UriRewrite {
    /// `foo/bar.png` becomes `bar.ktx2`.
    #[default]
    Basename,
    /// `foo/bar.png` becomes `foo/bar.ktx2`.
    PreservePath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutputCapacity {
    /// Scratch buffer size the first encode attempt gets.
    pub initial: usize,
    /// Upper bound the scratch buffer may grow to while negotiating.
    pub max: usize,
}

impl Default for OutputCapacity {
    fn default() -> Self {
        Self {
            initial: 10 * 1024 * 1024,
            max: 256 * 1024 * 1024,
        }
    }
}

/// Which raster context resamples images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResamplerKind {
    /// GPU when one is available, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Gpu,
}

/// Configuration of a texture compression step.
///
/// Deserializes from the same JSON shape the step is usually configured with:
///
/// ```
/// use texbake::TextureCompressionConfig;
///
/// let config = TextureCompressionConfig::from_json(
///     r#"{ "resize": [512, 512], "perTextureOverrides": [{ "name": "hero", "resize": [2048, 2048] }] }"#,
/// )
/// .unwrap();
/// assert_eq!(config.resize_for("hero").width, 2048);
/// assert_eq!(config.resize_for("crate").width, 512);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextureCompressionConfig {
    pub resize: ResizeSpec,
    #[serde(alias = "basisOptions")]
    pub encode_options: EncodeOverrides,
    #[serde(alias = "resizeCustom")]
    pub per_texture_overrides: Vec<ResizeOverride>,
    pub failure_policy: FailurePolicy,
    pub uri_rewrite: UriRewrite,
    pub output_capacity: OutputCapacity,
    pub resampler: ResamplerKind,
}

impl TextureCompressionConfig {
    pub fn new(resize: ResizeSpec) -> Self {
        Self {
            resize,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, TranscodeError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| TranscodeError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_override(mut self, name: impl Into<String>, resize: ResizeSpec) -> Self {
        self.per_texture_overrides.push(ResizeOverride {
            name: name.into(),
            resize,
        });
        self
    }

    pub fn with_encode_options(mut self, overrides: EncodeOverrides) -> Self {
        self.encode_options = overrides;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_uri_rewrite(mut self, rewrite: UriRewrite) -> Self {
        self.uri_rewrite = rewrite;
        self
    }

    pub fn with_resampler(mut self, resampler: ResamplerKind) -> Self {
        self.resampler = resampler;
        self
    }

    pub fn with_output_capacity(mut self, capacity: OutputCapacity) -> Self {
        self.output_capacity = capacity;
        self
    }

    /// Resize box for the texture called `name`: first matching override, else the global box.
    pub fn resize_for(&self, name: &str) -> ResizeSpec {
        self.per_texture_overrides
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.resize)
            .unwrap_or(self.resize)
    }

    pub fn validate(&self) -> Result<(), TranscodeError> {
        let boxes = std::iter::once(("resize", self.resize)).chain(
            self.per_texture_overrides
                .iter()
                .map(|item| (item.name.as_str(), item.resize)),
        );
        for (label, spec) in boxes {
            if spec.width == 0 || spec.height == 0 {
                return Err(TranscodeError::InvalidConfig(format!(
                    "resize box for '{}' must be non-zero, got {}x{}",
                    label, spec.width, spec.height
                )));
            }
            if spec.width > MAX_RESIZE_DIMENSION || spec.height > MAX_RESIZE_DIMENSION {
                return Err(TranscodeError::InvalidConfig(format!(
                    "resize box for '{}' is {}x{}, edges are limited to {}",
                    label, spec.width, spec.height, MAX_RESIZE_DIMENSION
                )));
            }
        }

        let capacity = self.output_capacity;
        if capacity.initial == 0 || capacity.max < capacity.initial {
            return Err(TranscodeError::InvalidConfig(format!(
                "output capacity must satisfy 0 < initial <= max, got {} / {}",
                capacity.initial, capacity.max
            )));
        }

        EncodeOptions::merged(&self.encode_options).validate()
    }
}
