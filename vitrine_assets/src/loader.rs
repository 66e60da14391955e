use crate::config::ShadowPolicy;
use crate::error::LoadError;
use crate::gpu::{Disposable, GpuTracker, ResourceKind};
use crate::options::Codecs;
use crate::scene::{
    Aabb, Drawable, Geometry, GeometryInfo, Light, LightKind, Material, MaterialDesc, Node,
    NodeKind, TextureSlot,
};
use crate::source::AssetSource;
use gltf::json::validation::Checked;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Compressed geometry, needs a geometry codec
pub const DRACO_EXTENSION: &str = "KHR_draco_mesh_compression";
/// Compressed textures, needs a texture codec
pub const BASISU_EXTENSION: &str = "KHR_texture_basisu";
/// Required extensions that are understood without any configuration
const BUILTIN_EXTENSIONS: [&str; 5] = [
    "EXT_meshopt_compression",
    "KHR_lights_punctual",
    "KHR_mesh_quantization",
    "KHR_texture_transform",
    "KHR_materials_unlit",
];
/// Deepest node hierarchy that is decoded
const MAX_NODE_DEPTH: usize = 256;

/// Everything needed to turn fetched bytes into a scene graph
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub path: String,
    pub codecs: Codecs,
    pub overrides: BTreeMap<String, MaterialDesc>,
    pub shadows: ShadowPolicy,
}

/// Fetch `request.path` from `source` and decode it
pub async fn load(
    source: &dyn AssetSource,
    request: &DecodeRequest,
    gpu: &GpuTracker,
) -> Result<Node, LoadError> {
    let bytes = source
        .fetch(&request.path)
        .await
        .map_err(|e| LoadError::Fetch {
            path: request.path.clone(),
            reason: format!("{e:#}"),
        })?;
    tracing::debug!("Fetched {} ({} bytes)", request.path, bytes.len());
    decode(&bytes, request, gpu)
}

/// Decode a glTF/GLB document into a scene graph with resident GPU resources
pub fn decode(bytes: &[u8], request: &DecodeRequest, gpu: &GpuTracker) -> Result<Node, LoadError> {
    // Validation rejects any required extension the gltf crate does not implement, which includes
    // the compression extensions handled by codecs.
    let gltf = gltf::Gltf::from_slice_without_validation(bytes).map_err(|e| LoadError::Parse {
        path: request.path.clone(),
        reason: e.to_string(),
    })?;
    check_extensions(&gltf.document, request)?;
    let malformed = |reason: String| LoadError::Parse {
        path: request.path.clone(),
        reason,
    };
    check_references(gltf.document.as_json()).map_err(malformed)?;

    let scene = gltf
        .document
        .default_scene()
        .or_else(|| gltf.document.scenes().next())
        .ok_or_else(|| LoadError::EmptyScene {
            path: request.path.clone(),
        })?;
    check_hierarchy(gltf.document.as_json(), scene.index()).map_err(malformed)?;

    let decoder = SceneDecoder {
        gpu,
        materials: gltf
            .document
            .materials()
            .map(|material| Arc::new(material_desc(&material)))
            .collect(),
        default_material: Arc::new(MaterialDesc::default()),
    };
    let mut root = Node::group(
        scene.name().map(String::from),
        scene.nodes().map(|node| decoder.node(&node)).collect(),
    );

    apply_shadow_policy(&mut root, &request.shadows, gpu);
    apply_material_overrides(&mut root, &request.overrides, gpu);

    tracing::info!(
        "Decoded {}: {} drawables, {} lights",
        request.path,
        root.drawables().len(),
        root.lights().len()
    );
    Ok(root)
}

fn check_extensions(document: &gltf::Document, request: &DecodeRequest) -> Result<(), LoadError> {
    for extension in document.extensions_required() {
        let extension: &str = extension.as_ref();
        let missing = match extension {
            DRACO_EXTENSION => request.codecs.geometry.is_none(),
            BASISU_EXTENSION => request.codecs.texture.is_none(),
            known if BUILTIN_EXTENSIONS.contains(&known) => false,
            unknown => {
                tracing::warn!("{} requires unknown extension {}", request.path, unknown);
                false
            }
        };
        if missing {
            return Err(LoadError::MissingCodec {
                path: request.path.clone(),
                extension: extension.to_string(),
            });
        }
    }
    Ok(())
}

fn in_range(what: &str, index: usize, len: usize) -> Result<(), String> {
    if index < len {
        Ok(())
    } else {
        Err(format!("{what} refers to missing index {index}"))
    }
}

/// Every index the decoder follows must point at an existing item, the gltf accessors panic otherwise
fn check_references(json: &gltf::json::Root) -> Result<(), String> {
    if let Some(scene) = json.scene {
        in_range("scene", scene.value(), json.scenes.len())?;
    }
    for (i, scene) in json.scenes.iter().enumerate() {
        for node in &scene.nodes {
            in_range(&format!("scenes[{i}].nodes"), node.value(), json.nodes.len())?;
        }
    }

    let lights = json
        .extensions
        .as_ref()
        .and_then(|extensions| extensions.khr_lights_punctual.as_ref())
        .map(|punctual| punctual.lights.as_slice())
        .unwrap_or_default();
    for (i, node) in json.nodes.iter().enumerate() {
        if let Some(mesh) = node.mesh {
            in_range(&format!("nodes[{i}].mesh"), mesh.value(), json.meshes.len())?;
        }
        if let Some(camera) = node.camera {
            in_range(&format!("nodes[{i}].camera"), camera.value(), json.cameras.len())?;
        }
        for child in node.children.iter().flatten() {
            in_range(&format!("nodes[{i}].children"), child.value(), json.nodes.len())?;
        }
        if let Some(light) = node
            .extensions
            .as_ref()
            .and_then(|extensions| extensions.khr_lights_punctual.as_ref())
        {
            in_range(&format!("nodes[{i}].light"), light.light.value(), lights.len())?;
        }
    }

    for (i, mesh) in json.meshes.iter().enumerate() {
        for (j, primitive) in mesh.primitives.iter().enumerate() {
            let what = format!("meshes[{i}].primitives[{j}]");
            for accessor in primitive.attributes.values().chain(primitive.indices.iter()) {
                in_range(&what, accessor.value(), json.accessors.len())?;
            }
            if let Some(material) = primitive.material {
                in_range(&what, material.value(), json.materials.len())?;
            }
        }
    }

    for (i, material) in json.materials.iter().enumerate() {
        let pbr = &material.pbr_metallic_roughness;
        let textures = [
            pbr.base_color_texture.as_ref().map(|info| info.index),
            pbr.metallic_roughness_texture.as_ref().map(|info| info.index),
            material.normal_texture.as_ref().map(|info| info.index),
            material.occlusion_texture.as_ref().map(|info| info.index),
            material.emissive_texture.as_ref().map(|info| info.index),
        ];
        for texture in textures.into_iter().flatten() {
            in_range(&format!("materials[{i}]"), texture.value(), json.textures.len())?;
        }
    }
    for (i, texture) in json.textures.iter().enumerate() {
        let what = format!("textures[{i}].source");
        in_range(&what, texture.source.value(), json.images.len())?;
    }
    for (i, image) in json.images.iter().enumerate() {
        match image.buffer_view {
            Some(view) => {
                let what = format!("images[{i}].bufferView");
                in_range(&what, view.value(), json.buffer_views.len())?;
                if image.mime_type.is_none() {
                    return Err(format!("images[{i}] has a bufferView but no mimeType"));
                }
            }
            None if image.uri.is_none() => {
                return Err(format!("images[{i}] has neither a uri nor a bufferView"));
            }
            None => {}
        }
    }

    for (i, light) in lights.iter().enumerate() {
        use gltf::json::extensions::scene::khr_lights_punctual::Type;
        match light.type_ {
            Checked::Invalid => return Err(format!("lights[{i}] has an unknown type")),
            Checked::Valid(Type::Spot) if light.spot.is_none() => {
                return Err(format!("spot lights[{i}] has no cone"));
            }
            Checked::Valid(_) => {}
        }
    }
    Ok(())
}

/// The nodes below `scene` must form trees no deeper than [`MAX_NODE_DEPTH`]
fn check_hierarchy(json: &gltf::json::Root, scene: usize) -> Result<(), String> {
    let Some(scene) = json.scenes.get(scene) else {
        return Err(format!("scene {scene} does not exist"));
    };
    let mut visited = HashSet::new();
    let mut pending: Vec<(usize, usize)> =
        scene.nodes.iter().map(|node| (node.value(), 1)).collect();
    while let Some((index, depth)) = pending.pop() {
        if !visited.insert(index) {
            return Err(format!("node {index} is reached more than once"));
        }
        if depth > MAX_NODE_DEPTH {
            return Err(format!("node hierarchy is deeper than {MAX_NODE_DEPTH}"));
        }
        let Some(node) = json.nodes.get(index) else {
            return Err(format!("node {index} does not exist"));
        };
        pending.extend(
            node.children
                .iter()
                .flatten()
                .map(|child| (child.value(), depth + 1)),
        );
    }
    Ok(())
}

struct SceneDecoder<'a> {
    gpu: &'a GpuTracker,
    /// Indexed like the document's materials
    materials: Vec<Arc<MaterialDesc>>,
    default_material: Arc<MaterialDesc>,
}

impl SceneDecoder<'_> {
    fn node(&self, node: &gltf::Node) -> Node {
        let name = node.name().map(String::from);
        let mut children: Vec<Node> = node.children().map(|child| self.node(&child)).collect();

        let mut kinds: Vec<NodeKind> = Vec::new();
        if let Some(mesh) = node.mesh() {
            kinds.extend(
                mesh.primitives()
                    .map(|primitive| NodeKind::Drawable(self.drawable(&primitive))),
            );
        }
        if let Some(light) = node.light() {
            kinds.push(NodeKind::Light(light_of(&light)));
        }
        if kinds.is_empty() && node.camera().is_some() {
            kinds.push(NodeKind::Other);
        }

        // A node carrying several primitives (or a mesh and a light) becomes a group with one
        // child per part, placed ahead of its regular children.
        let kind = if kinds.len() == 1 {
            kinds.remove(0)
        } else {
            let parts: Vec<Node> = kinds
                .drain(..)
                .map(|kind| Node::new(name.clone(), kind))
                .collect();
            children.splice(0..0, parts);
            NodeKind::Group
        };

        Node {
            name,
            transform: glam::Mat4::from_cols_array_2d(&node.transform().matrix()),
            kind,
            children,
        }
    }

    fn drawable(&self, primitive: &gltf::Primitive) -> Drawable {
        let positions = primitive.get(&gltf::Semantic::Positions);
        let info = GeometryInfo {
            vertex_count: positions.as_ref().map_or(0, |accessor| accessor.count() as usize),
            index_count: primitive.indices().map(|accessor| accessor.count() as usize),
            bounds: positions.as_ref().and_then(accessor_bounds),
        };
        let desc = primitive
            .material()
            .index()
            .and_then(|index| self.materials.get(index).cloned())
            .unwrap_or_else(|| self.default_material.clone());
        Drawable {
            geometry: Geometry::new(info, self.gpu),
            materials: vec![Material::from_desc(desc, self.gpu)],
            cast_shadow: false,
            receive_shadow: false,
        }
    }
}

fn vec3(value: gltf::json::Value) -> Option<glam::Vec3> {
    let values = value.as_array()?;
    if values.len() < 3 {
        return None;
    }
    Some(glam::Vec3::new(
        values[0].as_f64()? as f32,
        values[1].as_f64()? as f32,
        values[2].as_f64()? as f32,
    ))
}

fn accessor_bounds(accessor: &gltf::Accessor) -> Option<Aabb> {
    Some(Aabb::new(vec3(accessor.min()?)?, vec3(accessor.max()?)?))
}

fn texture_source(texture: &gltf::Texture) -> String {
    match texture.source().source() {
        gltf::image::Source::Uri { uri, .. } => uri.to_string(),
        gltf::image::Source::View { view, .. } => format!("bufferView#{}", view.index()),
    }
}

fn material_desc(material: &gltf::Material) -> MaterialDesc {
    let pbr = material.pbr_metallic_roughness();
    let mut maps = BTreeMap::new();
    if let Some(info) = pbr.base_color_texture() {
        maps.insert(TextureSlot::BaseColor, texture_source(&info.texture()));
    }
    // glTF packs roughness and metalness into one image
    if let Some(info) = pbr.metallic_roughness_texture() {
        let source = texture_source(&info.texture());
        maps.insert(TextureSlot::Roughness, source.clone());
        maps.insert(TextureSlot::Metalness, source);
    }
    if let Some(normal) = material.normal_texture() {
        maps.insert(TextureSlot::Normal, texture_source(&normal.texture()));
    }
    if let Some(occlusion) = material.occlusion_texture() {
        maps.insert(
            TextureSlot::AmbientOcclusion,
            texture_source(&occlusion.texture()),
        );
    }
    if let Some(info) = material.emissive_texture() {
        maps.insert(TextureSlot::Emissive, texture_source(&info.texture()));
    }
    MaterialDesc {
        name: material.name().map(String::from),
        base_color: pbr.base_color_factor(),
        metalness: pbr.metallic_factor(),
        roughness: pbr.roughness_factor(),
        emissive: material.emissive_factor(),
        double_sided: material.double_sided(),
        maps,
    }
}

fn light_of(light: &gltf::khr_lights_punctual::Light) -> Light {
    use gltf::khr_lights_punctual::Kind;
    Light {
        kind: match light.kind() {
            Kind::Directional => LightKind::Directional,
            Kind::Point => LightKind::Point,
            Kind::Spot {
                inner_cone_angle,
                outer_cone_angle,
            } => LightKind::Spot {
                inner_cone: inner_cone_angle,
                outer_cone: outer_cone_angle,
            },
        },
        color: glam::Vec3::from(light.color()),
        intensity: light.intensity(),
        range: light.range(),
        shadow: None,
    }
}

/// Mark drawables per `policy` and give lights a shadow map when lights cast shadows
pub fn apply_shadow_policy(root: &mut Node, policy: &ShadowPolicy, gpu: &GpuTracker) {
    root.walk_mut(&mut |node| match &mut node.kind {
        NodeKind::Drawable(drawable) => {
            drawable.cast_shadow = policy.cast;
            drawable.receive_shadow = policy.receive;
        }
        NodeKind::Light(light) => {
            if policy.lights && light.shadow.is_none() {
                light.shadow = Some(gpu.upload(ResourceKind::LightShadow));
            }
        }
        NodeKind::Group | NodeKind::Other => {}
    });
}

/// Replace every material whose name has an override, releasing the replaced material
pub fn apply_material_overrides(
    root: &mut Node,
    overrides: &BTreeMap<String, MaterialDesc>,
    gpu: &GpuTracker,
) {
    if overrides.is_empty() {
        return;
    }
    let overrides: BTreeMap<&str, Arc<MaterialDesc>> = overrides
        .iter()
        .map(|(name, desc)| (name.as_str(), Arc::new(desc.clone())))
        .collect();
    let mut replaced = 0usize;
    root.walk_mut(&mut |node| {
        if let NodeKind::Drawable(drawable) = &mut node.kind {
            for material in drawable.materials.iter_mut() {
                let Some(desc) = material.name().and_then(|name| overrides.get(name)) else {
                    continue;
                };
                let mut previous =
                    std::mem::replace(material, Material::from_desc(desc.clone(), gpu));
                previous.dispose(gpu);
                replaced += 1;
            }
        }
    });
    tracing::debug!("Applied {} material overrides", replaced);
}
