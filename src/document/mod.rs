//! Scene documents whose textures the pipeline rewrites.

#[cfg(feature = "gltf")]
mod gltf;

#[cfg(feature = "gltf")]
pub use self::gltf::{GltfDocument, GltfOutput};

/// One texture image owned by a document.
pub trait TextureRecord {
    fn name(&self) -> &str;

    /// Encoded image bytes, `None` when the image data is not available.
    fn image(&self) -> Option<&[u8]>;
    fn set_image(&mut self, data: Vec<u8>);

    fn mime_type(&self) -> Option<&str>;
    fn set_mime_type(&mut self, mime_type: &str);

    fn uri(&self) -> Option<&str>;
    fn set_uri(&mut self, uri: String);
}

pub trait SceneDocument {
    type Texture: TextureRecord;

    fn textures_mut(&mut self) -> &mut [Self::Texture];

    /// Declares `name` as used and required by the document.
    fn require_extension(&mut self, name: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Texture {
    pub name: String,
    pub image: Option<Vec<u8>>,
    pub mime_type: Option<String>,
    pub uri: Option<String>,
}

impl Texture {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, data: Vec<u8>, mime_type: &str) -> Self {
        self.image = Some(data);
        self.mime_type = Some(mime_type.to_owned());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }
}

impl TextureRecord for Texture {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }

    fn set_image(&mut self, data: Vec<u8>) {
        self.image = Some(data);
    }

    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    fn set_mime_type(&mut self, mime_type: &str) {
        self.mime_type = Some(mime_type.to_owned());
    }

    fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    fn set_uri(&mut self, uri: String) {
        self.uri = Some(uri);
    }
}

/// A bare list of textures, for hosts that keep their own scene model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureSet {
    pub textures: Vec<Texture>,
    pub extensions_used: Vec<String>,
    pub extensions_required: Vec<String>,
}

impl TextureSet {
    pub fn new(textures: Vec<Texture>) -> Self {
        Self {
            textures,
            ..Default::default()
        }
    }
}

impl SceneDocument for TextureSet {
    type Texture = Texture;

    fn textures_mut(&mut self) -> &mut [Texture] {
        &mut self.textures
    }

    fn require_extension(&mut self, name: &str) {
        for list in [&mut self.extensions_used, &mut self.extensions_required] {
            if !list.iter().any(|existing| existing == name) {
                list.push(name.to_owned());
            }
        }
    }
}
