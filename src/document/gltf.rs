use std::{
    borrow::Cow,
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{SceneDocument, Texture};

const BASISU_EXTENSION: &str = "KHR_texture_basisu";

/// Where an image's bytes came from, which decides where they are written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageOrigin {
    View(usize),
    DataUri,
    External,
}

/// A glTF 2.0 document (GLB or JSON) whose images are exposed as texture records.
///
/// The raw JSON is kept alongside the typed view, so content this crate does not
/// understand survives a load/save round trip.
pub struct GltfDocument {
    json: Value,
    buffers: Vec<Vec<u8>>,
    textures: Vec<Texture>,
    origins: Vec<ImageOrigin>,
}

/// A glTF JSON file plus the resources it references by relative URI.
pub struct GltfOutput {
    pub json: Vec<u8>,
    pub resources: Vec<(String, Vec<u8>)>,
}

impl GltfDocument {
    /// Loads a GLB or a self-contained glTF. External images are left unloaded.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Self::load(data, None)
    }

    /// Loads a GLB or glTF file, resolving external buffers and images next to it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::load(&data, path.parent())
    }

    fn load(data: &[u8], base: Option<&Path>) -> Result<Self> {
        let json: Value = if data.starts_with(b"glTF") {
            let glb = gltf::Glb::from_slice(data)?;
            serde_json::from_slice(&glb.json)?
        } else {
            serde_json::from_slice(data)?
        };

        // Written documents require KHR_texture_basisu and drop `source`, which the
        // validating loader refuses.
        let gltf = gltf::Gltf::from_slice_without_validation(data)?;
        let buffers = gltf::import_buffers(&gltf.document, base, gltf.blob.clone())?
            .into_iter()
            .map(|data| data.0)
            .collect::<Vec<_>>();

        let mut textures = Vec::new();
        let mut origins = Vec::new();
        for image in gltf.document.images() {
            let name = image.name().unwrap_or_default().to_owned();

            let (texture, origin) = match image.source() {
                gltf::image::Source::View { view, mime_type } => {
                    let bytes = buffers
                        .get(view.buffer().index())
                        .and_then(|buffer| buffer.get(view.offset()..view.offset() + view.length()))
                        .ok_or_else(|| anyhow!("Image {} points outside its buffer", image.index()))?;
                    let texture = Texture {
                        name,
                        image: Some(bytes.to_vec()),
                        mime_type: Some(mime_type.to_owned()),
                        uri: None,
                    };
                    (texture, ImageOrigin::View(view.index()))
                }
                gltf::image::Source::Uri { uri, mime_type } => {
                    if let Some(data_uri) = uri.strip_prefix("data:") {
                        let (bytes, declared) = decode_data_uri(data_uri)
                            .with_context(|| format!("Image {} has a bad data URI", image.index()))?;
                        let texture = Texture {
                            name,
                            image: Some(bytes),
                            mime_type: mime_type.map(str::to_owned).or(declared),
                            uri: None,
                        };
                        (texture, ImageOrigin::DataUri)
                    } else {
                        let bytes = match base {
                            Some(base) => {
                                let path = base.join(&*urlencoding::decode(uri)?);
                                Some(
                                    std::fs::read(&path)
                                        .with_context(|| format!("Failed to read image {}", uri))?,
                                )
                            }
                            None => {
                                debug!("Image {} references external {}, not loaded", image.index(), uri);
                                None
                            }
                        };
                        let texture = Texture {
                            name,
                            image: bytes,
                            mime_type: mime_type
                                .map(str::to_owned)
                                .or_else(|| mime_type_from_uri(uri).map(str::to_owned)),
                            uri: Some(uri.to_owned()),
                        };
                        (texture, ImageOrigin::External)
                    }
                }
            };

            textures.push(texture);
            origins.push(origin);
        }

        debug!(
            "Loaded glTF with {} buffers and {} images",
            buffers.len(),
            textures.len()
        );

        Ok(Self {
            json,
            buffers,
            textures,
            origins,
        })
    }

    pub fn textures(&self) -> &[Texture] {
        &self.textures
    }

    pub fn json(&self) -> &Value {
        &self.json
    }

    /// Writes a GLB with every loaded image embedded in the binary chunk.
    pub fn to_glb(&self) -> Result<Vec<u8>> {
        let (json, bin, _) = self.pack(None)?;

        let mut json = serde_json::to_vec(&json)?;
        pad_to_four(&mut json, b' ');
        let bin = bin.map(|mut bin| {
            pad_to_four(&mut bin, 0);
            bin
        });

        let length = 12 + 8 + json.len() + bin.as_ref().map_or(0, |bin| 8 + bin.len());
        let glb = gltf::Glb {
            header: gltf::binary::Header {
                magic: *b"glTF",
                version: 2,
                length: u32::try_from(length).context("GLB exceeds 4 GiB")?,
            },
            json: Cow::Owned(json),
            bin: bin.map(Cow::Owned),
        };
        Ok(glb.to_vec()?)
    }

    /// Writes glTF JSON with the binary buffer stored at `bin_uri`. Images with a URI
    /// are written as their own resources, the rest go into the binary buffer.
    pub fn to_gltf(&self, bin_uri: &str) -> Result<GltfOutput> {
        let (json, bin, mut resources) = self.pack(Some(bin_uri))?;
        if let Some(bin) = bin {
            resources.insert(0, (bin_uri.to_owned(), bin));
        }
        Ok(GltfOutput {
            json: serde_json::to_vec_pretty(&json)?,
            resources,
        })
    }

    /// Writes the document to `path`, as GLB when the extension is `glb` and as glTF
    /// with its resources next to it otherwise.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("glb"))
        {
            std::fs::write(path, self.to_glb()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            return Ok(());
        }

        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
        let output = self.to_gltf(&format!("{}.bin", stem))?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();

        std::fs::write(path, &output.json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        for (uri, data) in &output.resources {
            let target: PathBuf = base.join(uri);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, data)
                .with_context(|| format!("Failed to write {}", target.display()))?;
        }
        Ok(())
    }

    /// Rebuilds the JSON and a single consolidated buffer from the current texture records.
    ///
    /// Buffer view indices are stable: image views get their new payload in place and
    /// images that were not stored in a view get a view appended.
    #[allow(clippy::type_complexity)]
    fn pack(
        &self,
        bin_uri: Option<&str>,
    ) -> Result<(Value, Option<Vec<u8>>, Vec<(String, Vec<u8>)>)> {
        let mut json = self.json.clone();
        let root = json
            .as_object_mut()
            .ok_or_else(|| anyhow!("glTF root is not an object"))?;

        let mut view_owners = BTreeMap::new();
        for (image, origin) in self.origins.iter().enumerate() {
            if let ImageOrigin::View(view) = origin {
                view_owners.entry(*view).or_insert(image);
            }
        }

        let mut bin = Vec::new();
        let mut views = root
            .get("bufferViews")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for (index, view) in views.iter_mut().enumerate() {
            let owned = view_owners
                .get(&index)
                .and_then(|&image| self.textures[image].image.as_deref());
            let bytes = match owned {
                Some(bytes) => bytes,
                None => self.view_bytes(view)?,
            };
            let offset = append_aligned(&mut bin, bytes);

            let view = view
                .as_object_mut()
                .ok_or_else(|| anyhow!("Buffer view {} is not an object", index))?;
            view.insert("buffer".to_owned(), json!(0));
            view.insert("byteOffset".to_owned(), json!(offset));
            view.insert("byteLength".to_owned(), json!(bytes.len()));
        }

        let mut resources = Vec::new();
        if let Some(images) = root.get_mut("images").and_then(Value::as_array_mut) {
            for (index, (texture, origin)) in self.textures.iter().zip(&self.origins).enumerate() {
                let image = images
                    .get_mut(index)
                    .and_then(Value::as_object_mut)
                    .ok_or_else(|| anyhow!("Image {} is not an object", index))?;

                if let Some(mime_type) = &texture.mime_type {
                    image.insert("mimeType".to_owned(), json!(mime_type));
                }
                if let ImageOrigin::View(_) = origin {
                    continue;
                }

                match (&texture.image, &texture.uri) {
                    (Some(bytes), Some(uri)) if bin_uri.is_some() => {
                        image.insert("uri".to_owned(), json!(uri));
                        image.remove("bufferView");
                        resources.push((uri.clone(), bytes.clone()));
                    }
                    (Some(bytes), _) => {
                        let offset = append_aligned(&mut bin, bytes);
                        image.remove("uri");
                        image.insert("bufferView".to_owned(), json!(views.len()));
                        views.push(json!({
                            "buffer": 0,
                            "byteOffset": offset,
                            "byteLength": bytes.len(),
                        }));
                    }
                    (None, Some(uri)) => {
                        image.insert("uri".to_owned(), json!(uri));
                    }
                    (None, None) => {}
                }
            }
        }

        let bin = if views.is_empty() {
            root.remove("bufferViews");
            root.remove("buffers");
            None
        } else {
            let mut buffer = Map::new();
            buffer.insert("byteLength".to_owned(), json!(bin.len()));
            if let Some(uri) = bin_uri {
                buffer.insert("uri".to_owned(), json!(uri));
            }
            root.insert("bufferViews".to_owned(), Value::Array(views));
            root.insert("buffers".to_owned(), json!([buffer]));
            Some(bin)
        };

        patch_basisu_textures(root, &self.textures);
        Ok((json, bin, resources))
    }

    fn view_bytes(&self, view: &Value) -> Result<&[u8]> {
        let field = |name: &str| view.get(name).and_then(Value::as_u64).map(|value| value as usize);
        let buffer = field("buffer").ok_or_else(|| anyhow!("Buffer view without buffer"))?;
        let offset = field("byteOffset").unwrap_or(0);
        let length = field("byteLength").ok_or_else(|| anyhow!("Buffer view without byteLength"))?;

        self.buffers
            .get(buffer)
            .and_then(|data| data.get(offset..offset + length))
            .ok_or_else(|| anyhow!("Buffer view points outside buffer {}", buffer))
    }
}

impl SceneDocument for GltfDocument {
    type Texture = Texture;

    fn textures_mut(&mut self) -> &mut [Texture] {
        &mut self.textures
    }

    fn require_extension(&mut self, name: &str) {
        let Some(root) = self.json.as_object_mut() else {
            warn!("glTF root is not an object, cannot declare {}", name);
            return;
        };

        for key in ["extensionsUsed", "extensionsRequired"] {
            let list = root.entry(key).or_insert_with(|| json!([]));
            if let Some(list) = list.as_array_mut() {
                if !list.iter().any(|existing| existing == name) {
                    list.push(json!(name));
                }
            }
        }
    }
}

/// Points textures whose image is KTX2 at it through `KHR_texture_basisu`, once the
/// extension is declared.
fn patch_basisu_textures(root: &mut Map<String, Value>, textures: &[Texture]) {
    let declared = root
        .get("extensionsUsed")
        .and_then(Value::as_array)
        .is_some_and(|used| used.iter().any(|name| name == BASISU_EXTENSION));
    if !declared {
        return;
    }

    let Some(entries) = root.get_mut("textures").and_then(Value::as_array_mut) else {
        return;
    };
    for texture in entries.iter_mut().filter_map(Value::as_object_mut) {
        let Some(source) = texture.get("source").and_then(Value::as_u64) else {
            continue;
        };
        let is_ktx2 = textures
            .get(source as usize)
            .and_then(|record| record.mime_type.as_deref())
            == Some("image/ktx2");
        if !is_ktx2 {
            continue;
        }

        texture.remove("source");
        let extensions = texture
            .entry("extensions")
            .or_insert_with(|| json!({}));
        if let Some(extensions) = extensions.as_object_mut() {
            extensions.insert(BASISU_EXTENSION.to_owned(), json!({ "source": source }));
        }
    }
}

fn decode_data_uri(data_uri: &str) -> Result<(Vec<u8>, Option<String>)> {
    let (header, payload) = data_uri
        .split_once(',')
        .ok_or_else(|| anyhow!("missing ',' separator"))?;
    let Some(mime_type) = header.strip_suffix(";base64") else {
        bail!("only base64 data URIs are supported");
    };

    let bytes = STANDARD.decode(payload)?;
    let mime_type = (!mime_type.is_empty()).then(|| mime_type.to_owned());
    Ok((bytes, mime_type))
}

fn mime_type_from_uri(uri: &str) -> Option<&'static str> {
    let extension = Path::new(uri).extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "ktx2" => Some("image/ktx2"),
        "ktx" => Some("image/ktx"),
        _ => None,
    }
}

fn append_aligned(bin: &mut Vec<u8>, bytes: &[u8]) -> usize {
    pad_to_four(bin, 0);
    let offset = bin.len();
    bin.extend_from_slice(bytes);
    offset
}

fn pad_to_four(bytes: &mut Vec<u8>, fill: u8) {
    bytes.resize(bytes.len().div_ceil(4) * 4, fill);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TextureRecord;

    fn gltf_with_data_uri() -> Vec<u8> {
        let png = STANDARD.encode([0x89, b'P', b'N', b'G']);
        serde_json::to_vec(&json!({
            "asset": { "version": "2.0", "generator": "unit test" },
            "images": [
                { "name": "inline", "uri": format!("data:image/png;base64,{}", png) },
                { "name": "outside", "uri": "textures/wall.png" },
            ],
            "textures": [{ "source": 0 }, { "source": 1 }],
            "extras": { "keep": true },
        }))
        .unwrap()
    }

    #[test]
    fn test_data_uri_and_external_images() {
        let document = GltfDocument::from_slice(&gltf_with_data_uri()).unwrap();
        let textures = document.textures();
        assert_eq!(textures.len(), 2);

        assert_eq!(textures[0].name(), "inline");
        assert_eq!(textures[0].image(), Some(&[0x89, b'P', b'N', b'G'][..]));
        assert_eq!(textures[0].mime_type(), Some("image/png"));
        assert_eq!(textures[0].uri(), None);

        assert_eq!(textures[1].image(), None);
        assert_eq!(textures[1].mime_type(), Some("image/png"));
        assert_eq!(textures[1].uri(), Some("textures/wall.png"));
    }

    #[test]
    fn test_glb_embeds_images_and_keeps_unknown_fields() {
        let mut document = GltfDocument::from_slice(&gltf_with_data_uri()).unwrap();
        document.textures_mut()[0].set_image(vec![1, 2, 3, 4, 5]);
        document.textures_mut()[0].set_mime_type("image/ktx2");
        document.require_extension(BASISU_EXTENSION);

        let glb = document.to_glb().unwrap();
        assert_eq!(&glb[..4], b"glTF");
        assert_eq!(u32::from_le_bytes(glb[8..12].try_into().unwrap()) as usize, glb.len());

        let parsed = gltf::Glb::from_slice(&glb).unwrap();
        let json: Value = serde_json::from_slice(&parsed.json).unwrap();
        assert_eq!(json["extras"]["keep"], json!(true));
        assert_eq!(json["extensionsRequired"], json!([BASISU_EXTENSION]));
        assert_eq!(json["images"][0]["mimeType"], json!("image/ktx2"));
        assert_eq!(json["images"][0]["bufferView"], json!(0));
        assert!(json["images"][0].get("uri").is_none());
        assert_eq!(json["images"][1]["uri"], json!("textures/wall.png"));
        assert_eq!(
            json["textures"][0],
            json!({ "extensions": { BASISU_EXTENSION: { "source": 0 } } })
        );
        assert_eq!(json["textures"][1], json!({ "source": 1 }));

        let bin = parsed.bin.unwrap();
        assert_eq!(&bin[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(json["buffers"], json!([{ "byteLength": 5 }]));
    }

    #[test]
    fn test_written_glb_loads_again() {
        let mut document = GltfDocument::from_slice(&gltf_with_data_uri()).unwrap();
        document.textures_mut()[0].set_image(vec![1, 2, 3, 4, 5]);
        document.textures_mut()[0].set_mime_type("image/ktx2");
        document.require_extension(BASISU_EXTENSION);
        let glb = document.to_glb().unwrap();

        let mut reloaded = GltfDocument::from_slice(&glb).unwrap();
        assert_eq!(reloaded.textures().len(), 2);
        assert_eq!(reloaded.textures()[0].image(), Some(&[1u8, 2, 3, 4, 5][..]));
        assert_eq!(reloaded.textures()[0].mime_type(), Some("image/ktx2"));
        assert_eq!(reloaded.textures()[1].uri(), Some("textures/wall.png"));

        reloaded.require_extension(BASISU_EXTENSION);
        let reloaded_glb = reloaded.to_glb().unwrap();
        let again = gltf::Glb::from_slice(&reloaded_glb).unwrap();
        let json: Value = serde_json::from_slice(&again.json).unwrap();
        assert_eq!(json["extensionsRequired"], json!([BASISU_EXTENSION]));
        assert_eq!(
            json["textures"][0],
            json!({ "extensions": { BASISU_EXTENSION: { "source": 0 } } })
        );
    }

    #[test]
    fn test_loads_documents_requiring_other_extensions() {
        let png = STANDARD.encode([0x89, b'P', b'N', b'G']);
        let data = serde_json::to_vec(&json!({
            "asset": { "version": "2.0" },
            "extensionsUsed": ["KHR_mesh_quantization", "KHR_draco_mesh_compression"],
            "extensionsRequired": ["KHR_mesh_quantization", "KHR_draco_mesh_compression"],
            "images": [{ "uri": format!("data:image/png;base64,{}", png) }],
            "textures": [{ "source": 0 }],
        }))
        .unwrap();

        let document = GltfDocument::from_slice(&data).unwrap();
        assert_eq!(document.textures().len(), 1);
        assert_eq!(
            document.json()["extensionsRequired"],
            json!(["KHR_mesh_quantization", "KHR_draco_mesh_compression"])
        );
    }

    #[test]
    fn test_open_decodes_percent_encoded_uris() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("my tex.png"), [0x89, b'P', b'N', b'G']).unwrap();
        let gltf = json!({
            "asset": { "version": "2.0" },
            "images": [{ "uri": "my%20tex.png" }],
            "textures": [{ "source": 0 }],
        });
        std::fs::write(dir.path().join("scene.gltf"), serde_json::to_vec(&gltf).unwrap()).unwrap();

        let document = GltfDocument::open(dir.path().join("scene.gltf")).unwrap();
        assert_eq!(document.textures()[0].image(), Some(&[0x89, b'P', b'N', b'G'][..]));
        assert_eq!(document.textures()[0].uri(), Some("my%20tex.png"));
    }

    #[test]
    fn test_gltf_writes_external_images_as_resources() {
        let mut document = GltfDocument::from_slice(&gltf_with_data_uri()).unwrap();
        document.textures_mut()[1].set_image(vec![7; 8]);
        document.textures_mut()[1].set_uri("wall.ktx2".to_owned());

        let output = document.to_gltf("scene.bin").unwrap();
        let json: Value = serde_json::from_slice(&output.json).unwrap();
        assert_eq!(json["images"][1]["uri"], json!("wall.ktx2"));
        assert_eq!(json["buffers"][0]["uri"], json!("scene.bin"));

        let names = output
            .resources
            .iter()
            .map(|(uri, _)| uri.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["scene.bin", "wall.ktx2"]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(GltfDocument::from_slice(b"not a scene").is_err());
    }

    #[test]
    fn test_data_uri_parsing() {
        let (bytes, mime) = decode_data_uri("image/png;base64,AAEC").unwrap();
        assert_eq!(bytes, vec![0, 1, 2]);
        assert_eq!(mime.as_deref(), Some("image/png"));
        assert!(decode_data_uri("image/png,plain").is_err());
        assert_eq!(mime_type_from_uri("a/b/C.PNG"), Some("image/png"));
        assert_eq!(mime_type_from_uri("noext"), None);
    }
}
