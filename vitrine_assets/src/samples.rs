use crate::error::AssetError;
use serde_json::json;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

const GLB_MAGIC: &[u8; 4] = b"glTF";
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F534A;
const GLB_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;

const FLOAT: u32 = 5126;
const UNSIGNED_SHORT: u32 = 5123;

/// Built-in demo models served under `/models/<name>.glb`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SampleModel {
    Cube,
    Sphere,
    /// Small scene with a two-primitive mesh, a sun and a camera
    Test,
}

impl SampleModel {
    pub const ALL: [SampleModel; 3] = [SampleModel::Cube, SampleModel::Sphere, SampleModel::Test];

    pub fn name(&self) -> &'static str {
        match self {
            SampleModel::Cube => "cube",
            SampleModel::Sphere => "sphere",
            SampleModel::Test => "test",
        }
    }

    pub fn path(&self) -> String {
        format!("/models/{}.glb", self.name())
    }

    /// Self-contained GLB for this model. Geometry is described by accessor counts and bounds only.
    pub fn to_glb(&self) -> Vec<u8> {
        let document = match self {
            SampleModel::Cube => cube(),
            SampleModel::Sphere => sphere(),
            SampleModel::Test => test_scene(),
        };
        to_glb(document.to_string().as_bytes())
    }
}

impl Display for SampleModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleModel {
    type Err = AssetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SampleModel::ALL
            .into_iter()
            .find(|model| model.name() == s)
            .ok_or_else(|| AssetError::UnknownSample(s.to_string()))
    }
}

/// Wrap a glTF JSON document into a binary container without a BIN chunk
pub fn to_glb(json: &[u8]) -> Vec<u8> {
    let padded = json.len().next_multiple_of(4);
    let total = GLB_HEADER_LEN + CHUNK_HEADER_LEN + padded;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(GLB_MAGIC);
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(padded as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(json);
    out.resize(total, b' ');
    out
}

fn cube() -> serde_json::Value {
    json!({
        "asset": { "version": "2.0", "generator": "vitrine" },
        "scene": 0,
        "scenes": [{ "name": "Cube", "nodes": [0] }],
        "nodes": [{ "name": "Cube", "mesh": 0 }],
        "meshes": [{
            "name": "Cube",
            "primitives": [{
                "attributes": { "POSITION": 0, "NORMAL": 1 },
                "indices": 2,
                "material": 0
            }]
        }],
        "materials": [{
            "name": "Paint",
            "pbrMetallicRoughness": {
                "baseColorFactor": [0.8, 0.2, 0.2, 1.0],
                "metallicFactor": 0.1,
                "roughnessFactor": 0.6
            }
        }],
        "accessors": [
            { "componentType": FLOAT, "count": 24, "type": "VEC3",
              "min": [-1.0, -1.0, -1.0], "max": [1.0, 1.0, 1.0] },
            { "componentType": FLOAT, "count": 24, "type": "VEC3" },
            { "componentType": UNSIGNED_SHORT, "count": 36, "type": "SCALAR" }
        ]
    })
}

fn sphere() -> serde_json::Value {
    json!({
        "asset": { "version": "2.0", "generator": "vitrine" },
        "scene": 0,
        "scenes": [{ "name": "Sphere", "nodes": [0] }],
        "nodes": [{ "name": "Sphere", "mesh": 0 }],
        "meshes": [{
            "name": "Sphere",
            "primitives": [{
                "attributes": { "POSITION": 0, "NORMAL": 1, "TEXCOORD_0": 2 },
                "indices": 3,
                "material": 0
            }]
        }],
        "materials": [{
            "name": "Chrome",
            "pbrMetallicRoughness": {
                "baseColorTexture": { "index": 0 },
                "metallicRoughnessTexture": { "index": 2 },
                "metallicFactor": 1.0,
                "roughnessFactor": 0.2
            },
            "normalTexture": { "index": 1 }
        }],
        "textures": [{ "source": 0 }, { "source": 1 }, { "source": 2 }],
        "images": [
            { "uri": "textures/chrome.png" },
            { "uri": "textures/chrome_normal.png" },
            { "uri": "textures/chrome_orm.png" }
        ],
        "accessors": [
            { "componentType": FLOAT, "count": 561, "type": "VEC3",
              "min": [-1.0, -1.0, -1.0], "max": [1.0, 1.0, 1.0] },
            { "componentType": FLOAT, "count": 561, "type": "VEC3" },
            { "componentType": FLOAT, "count": 561, "type": "VEC2" },
            { "componentType": UNSIGNED_SHORT, "count": 2880, "type": "SCALAR" }
        ]
    })
}

fn test_scene() -> serde_json::Value {
    json!({
        "asset": { "version": "2.0", "generator": "vitrine" },
        "extensionsUsed": ["KHR_lights_punctual"],
        "extensions": {
            "KHR_lights_punctual": {
                "lights": [{ "type": "directional", "color": [1.0, 1.0, 0.9], "intensity": 3.0 }]
            }
        },
        "scene": 0,
        "scenes": [{ "name": "Test", "nodes": [0] }],
        "nodes": [
            { "name": "Test", "children": [1, 2, 3] },
            { "name": "Widget", "mesh": 0, "translation": [2.0, 0.0, 0.0] },
            {
                "name": "Sun",
                "rotation": [-0.3826834, 0.0, 0.0, 0.9238795],
                "extensions": { "KHR_lights_punctual": { "light": 0 } }
            },
            { "name": "Camera", "camera": 0, "translation": [0.0, 1.0, 6.0] }
        ],
        "cameras": [{ "type": "perspective", "perspective": { "yfov": 0.8, "znear": 0.1 } }],
        "meshes": [{
            "name": "Widget",
            "primitives": [
                { "attributes": { "POSITION": 0 }, "indices": 2, "material": 0 },
                { "attributes": { "POSITION": 1 }, "material": 1 }
            ]
        }],
        "materials": [
            { "name": "Body", "pbrMetallicRoughness": { "baseColorFactor": [0.2, 0.4, 0.8, 1.0] } },
            { "name": "Trim", "pbrMetallicRoughness": { "metallicFactor": 0.9 }, "doubleSided": true }
        ],
        "accessors": [
            { "componentType": FLOAT, "count": 8, "type": "VEC3",
              "min": [-0.5, 0.0, -0.5], "max": [0.5, 1.0, 0.5] },
            { "componentType": FLOAT, "count": 12, "type": "VEC3",
              "min": [-0.75, 1.0, -0.75], "max": [0.75, 1.25, 0.75] },
            { "componentType": UNSIGNED_SHORT, "count": 36, "type": "SCALAR" }
        ]
    })
}
