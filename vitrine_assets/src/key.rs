use crate::error::AssetError;
use crate::options::LoadOptions;
use crate::scene::MaterialDesc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Identity of a cache entry: the source path plus the canonical serialization of the options
/// that influence the loaded payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    path: String,
    options: String,
}

/// Field order is fixed and maps are ordered, which makes the serialization independent of the
/// order options were supplied in
#[derive(Serialize)]
struct CanonicalOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    geometry_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    texture_codec: Option<String>,
    #[serde(skip_serializing_if = "no_overrides")]
    material_overrides: &'a BTreeMap<String, MaterialDesc>,
}

fn no_overrides(overrides: &&BTreeMap<String, MaterialDesc>) -> bool {
    overrides.is_empty()
}

impl AssetKey {
    /// Derive the key for `path` loaded with `options`.
    ///
    /// Fails with [`AssetError::InvalidKey`] on empty or malformed paths.
    pub fn resolve(path: &str, options: &LoadOptions) -> Result<Self, AssetError> {
        if path.trim().is_empty() {
            return Err(AssetError::InvalidKey {
                path: path.to_string(),
                reason: "path is empty",
            });
        }
        if path.contains('\0') {
            return Err(AssetError::InvalidKey {
                path: path.to_string(),
                reason: "path contains a NUL byte",
            });
        }
        // non-finite factors all serialize as null and would share a key
        if !options.material_overrides.values().all(MaterialDesc::is_finite) {
            return Err(AssetError::InvalidKey {
                path: path.to_string(),
                reason: "material override has a non-finite factor",
            });
        }
        let codecs = options.codecs();
        let canonical = CanonicalOptions {
            geometry_codec: codecs.geometry,
            texture_codec: codecs.texture,
            material_overrides: &options.material_overrides,
        };
        let options = serde_json::to_string(&canonical).map_err(|_| AssetError::InvalidKey {
            path: path.to_string(),
            reason: "options could not be serialized",
        })?;
        Ok(Self {
            path: path.to_string(),
            options,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Canonical options string, `{}` for default options
    pub fn options(&self) -> &str {
        &self.options
    }
}

impl Display for AssetKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.path, self.options)
    }
}
