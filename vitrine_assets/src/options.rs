use crate::asset::Asset;
use crate::error::AssetError;
use crate::scene::MaterialDesc;
use derivative::Derivative;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type OnLoad = Arc<dyn Fn(&Asset) + Send + Sync>;
pub type OnError = Arc<dyn Fn(&AssetError) + Send + Sync>;

/// Options for [`crate::AssetCache::load`].
///
/// Everything except the callbacks takes part in the cache key.
#[derive(Derivative, Clone, Default)]
#[derivative(Debug)]
pub struct LoadOptions {
    /// Directory of the compressed geometry (Draco) decoder
    pub geometry_codec_path: Option<String>,
    /// Directory of the compressed texture (Basis/KTX2) transcoder
    pub texture_codec_path: Option<String>,
    /// Replacement material per loaded material name
    pub material_overrides: BTreeMap<String, MaterialDesc>,
    #[derivative(Debug = "ignore")]
    pub on_load: Option<OnLoad>,
    #[derivative(Debug = "ignore")]
    pub on_error: Option<OnError>,
}

impl LoadOptions {
    pub fn with_geometry_codec(mut self, path: impl Into<String>) -> Self {
        self.geometry_codec_path = Some(path.into());
        self
    }

    pub fn with_texture_codec(mut self, path: impl Into<String>) -> Self {
        self.texture_codec_path = Some(path.into());
        self
    }

    pub fn with_override(mut self, material: impl Into<String>, desc: MaterialDesc) -> Self {
        self.material_overrides.insert(material.into(), desc);
        self
    }

    pub fn on_load(mut self, f: impl Fn(&Asset) + Send + Sync + 'static) -> Self {
        self.on_load = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&AssetError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Codec paths after normalisation
    pub fn codecs(&self) -> Codecs {
        Codecs {
            geometry: normalize_codec_path(self.geometry_codec_path.as_deref()),
            texture: normalize_codec_path(self.texture_codec_path.as_deref()),
        }
    }
}

/// Decoders available to a load
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Codecs {
    pub geometry: Option<String>,
    pub texture: Option<String>,
}

/// Empty paths count as absent and trailing separators are dropped, so `/draco/` and `/draco`
/// name the same decoder.
fn normalize_codec_path(path: Option<&str>) -> Option<String> {
    let path = path?.trim();
    if path.is_empty() {
        return None;
    }
    match path.trim_end_matches('/') {
        "" => Some(String::from("/")),
        trimmed => Some(trimmed.to_string()),
    }
}
