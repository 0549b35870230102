use image::RgbaImage;

/// Block-compressed payload formats the built-in engine can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFormat {
    Bc7RgbaUnorm,
    Etc1RgbUnorm,
}

impl BlockFormat {
    pub fn block_size(&self) -> usize {
        match self {
            Self::Bc7RgbaUnorm => 16,
            Self::Etc1RgbUnorm => 8,
        }
    }

    pub fn bytes_per_row(&self, width: u32) -> usize {
        width.div_ceil(4) as usize * self.block_size()
    }

    pub fn level_size(&self, width: u32, height: u32) -> usize {
        self.bytes_per_row(width) * height.div_ceil(4) as usize
    }

    pub fn has_alpha(&self) -> bool {
        matches!(self, Self::Bc7RgbaUnorm)
    }

    /// `VkFormat` value written into KTX2 headers.
    pub fn vk_format(&self, srgb: bool) -> u32 {
        match (self, srgb) {
            (Self::Bc7RgbaUnorm, false) => 145,
            (Self::Bc7RgbaUnorm, true) => 146,
            // ETC1 blocks are valid ETC2 RGB blocks.
            (Self::Etc1RgbUnorm, false) => 147,
            (Self::Etc1RgbUnorm, true) => 148,
        }
    }

    /// `glInternalFormat` value written into legacy KTX headers.
    pub fn gl_internal_format(&self, srgb: bool) -> u32 {
        match (self, srgb) {
            (Self::Bc7RgbaUnorm, false) => 0x8E8C,
            (Self::Bc7RgbaUnorm, true) => 0x8E8D,
            (Self::Etc1RgbUnorm, false) => 0x8D64,
            (Self::Etc1RgbUnorm, true) => 0x9275,
        }
    }

    pub fn gl_base_internal_format(&self) -> u32 {
        if self.has_alpha() {
            0x1908
        } else {
            0x1907
        }
    }
}

/// File container wrapping the compressed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Ktx2,
    /// KTX 1.1.
    Ktx,
}

impl ContainerKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Ktx2 => "image/ktx2",
            Self::Ktx => "image/ktx",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Ktx2 => "ktx2",
            Self::Ktx => "ktx",
        }
    }
}

/// Decoded RGBA8 raster, top-left origin, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RasterImage {
    pub const BYTES_PER_TEXEL: usize = 4;

    /// Returns `None` when `pixels` does not hold exactly `width * height` texels.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = width as usize * height as usize * Self::BYTES_PER_TEXEL;
        (pixels.len() == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

impl From<RgbaImage> for RasterImage {
    fn from(image: RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        }
    }
}
