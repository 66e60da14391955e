use crate::gpu::{Disposable, GpuHandle, GpuTracker, ResourceId, ResourceKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Axis aligned bounding box
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Aabb {
    pub min: glam::Vec3,
    pub max: glam::Vec3,
}

impl Aabb {
    pub fn new(min: glam::Vec3, max: glam::Vec3) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Bounding box of `self` after being transformed by `transform`
    pub fn transformed(&self, transform: &glam::Mat4) -> Aabb {
        let corners = [
            glam::Vec3::new(self.min.x, self.min.y, self.min.z),
            glam::Vec3::new(self.max.x, self.min.y, self.min.z),
            glam::Vec3::new(self.min.x, self.max.y, self.min.z),
            glam::Vec3::new(self.max.x, self.max.y, self.min.z),
            glam::Vec3::new(self.min.x, self.min.y, self.max.z),
            glam::Vec3::new(self.max.x, self.min.y, self.max.z),
            glam::Vec3::new(self.min.x, self.max.y, self.max.z),
            glam::Vec3::new(self.max.x, self.max.y, self.max.z),
        ];
        let first = transform.transform_point3(corners[0]);
        corners[1..]
            .iter()
            .map(|corner| transform.transform_point3(*corner))
            .fold(Aabb { min: first, max: first }, |acc, p| Aabb {
                min: acc.min.min(p),
                max: acc.max.max(p),
            })
    }

    pub fn center(&self) -> glam::Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> glam::Vec3 {
        self.max - self.min
    }
}

/// Texture slots a material can reference
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TextureSlot {
    BaseColor,
    Normal,
    Roughness,
    Metalness,
    AmbientOcclusion,
    Emissive,
    Specular,
    Alpha,
    Environment,
}

impl TextureSlot {
    pub const ALL: [TextureSlot; 9] = [
        TextureSlot::BaseColor,
        TextureSlot::Normal,
        TextureSlot::Roughness,
        TextureSlot::Metalness,
        TextureSlot::AmbientOcclusion,
        TextureSlot::Emissive,
        TextureSlot::Specular,
        TextureSlot::Alpha,
        TextureSlot::Environment,
    ];
}

/// CPU-side description of a material. Also used to express material overrides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterialDesc {
    pub name: Option<String>,
    pub base_color: [f32; 4],
    pub metalness: f32,
    pub roughness: f32,
    pub emissive: [f32; 3],
    pub double_sided: bool,
    /// Image source per slot
    pub maps: BTreeMap<TextureSlot, String>,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            name: None,
            base_color: [1.0; 4],
            metalness: 1.0,
            roughness: 1.0,
            emissive: [0.0; 3],
            double_sided: false,
            maps: BTreeMap::new(),
        }
    }
}

impl MaterialDesc {
    /// Whether every factor is a finite number
    pub fn is_finite(&self) -> bool {
        self.base_color
            .iter()
            .chain(&self.emissive)
            .chain([&self.metalness, &self.roughness])
            .all(|factor| factor.is_finite())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_base_color(mut self, base_color: [f32; 4]) -> Self {
        self.base_color = base_color;
        self
    }

    pub fn with_map(mut self, slot: TextureSlot, source: impl Into<String>) -> Self {
        self.maps.insert(slot, source.into());
        self
    }
}

#[derive(Debug, PartialEq)]
pub struct Texture {
    pub source: Arc<str>,
    pub gpu: GpuHandle,
}

impl Texture {
    pub fn duplicate(&self, gpu: &GpuTracker) -> Self {
        Self {
            source: self.source.clone(),
            gpu: gpu.upload(ResourceKind::Texture),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Material {
    pub desc: Arc<MaterialDesc>,
    pub gpu: GpuHandle,
    pub textures: BTreeMap<TextureSlot, Texture>,
}

impl Material {
    /// Upload a material and one texture per map in `desc`
    pub fn from_desc(desc: Arc<MaterialDesc>, gpu: &GpuTracker) -> Self {
        let textures = desc
            .maps
            .iter()
            .map(|(slot, source)| {
                (
                    *slot,
                    Texture {
                        source: Arc::from(source.as_str()),
                        gpu: gpu.upload(ResourceKind::Texture),
                    },
                )
            })
            .collect();
        Self {
            desc,
            gpu: gpu.upload(ResourceKind::Material),
            textures,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.desc.name.as_deref()
    }

    pub fn duplicate(&self, gpu: &GpuTracker) -> Self {
        Self {
            desc: self.desc.clone(),
            gpu: gpu.upload(ResourceKind::Material),
            textures: self
                .textures
                .iter()
                .map(|(slot, texture)| (*slot, texture.duplicate(gpu)))
                .collect(),
        }
    }
}

impl Disposable for Material {
    fn dispose(&mut self, gpu: &GpuTracker) {
        self.gpu.dispose(gpu);
        for texture in self.textures.values_mut() {
            texture.gpu.dispose(gpu);
        }
    }
}

/// Immutable facts about a primitive's geometry
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryInfo {
    pub vertex_count: usize,
    pub index_count: Option<usize>,
    /// Local space bounds, [`None`] if the position accessor carries no min/max
    pub bounds: Option<Aabb>,
}

#[derive(Debug, PartialEq)]
pub struct Geometry {
    pub info: Arc<GeometryInfo>,
    pub gpu: GpuHandle,
}

impl Geometry {
    pub fn new(info: GeometryInfo, gpu: &GpuTracker) -> Self {
        Self {
            info: Arc::new(info),
            gpu: gpu.upload(ResourceKind::Geometry),
        }
    }

    pub fn duplicate(&self, gpu: &GpuTracker) -> Self {
        Self {
            info: self.info.clone(),
            gpu: gpu.upload(ResourceKind::Geometry),
        }
    }
}

#[derive(Debug)]
pub struct Drawable {
    pub geometry: Geometry,
    pub materials: Vec<Material>,
    pub cast_shadow: bool,
    pub receive_shadow: bool,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum LightKind {
    Directional,
    Point,
    Spot { inner_cone: f32, outer_cone: f32 },
}

#[derive(Debug)]
pub struct Light {
    pub kind: LightKind,
    pub color: glam::Vec3,
    pub intensity: f32,
    pub range: Option<f32>,
    /// Shadow map, only allocated for shadow casting lights
    pub shadow: Option<GpuHandle>,
}

#[derive(Debug)]
pub enum NodeKind {
    Drawable(Drawable),
    Light(Light),
    Group,
    /// Cameras and anything else that owns no GPU resources
    Other,
}

/// A node of a loaded scene graph. Children are owned.
#[derive(Debug)]
pub struct Node {
    pub name: Option<String>,
    pub transform: glam::Mat4,
    pub kind: NodeKind,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: Option<String>, kind: NodeKind) -> Self {
        Self {
            name,
            transform: glam::Mat4::IDENTITY,
            kind,
            children: Vec::new(),
        }
    }

    pub fn group(name: Option<String>, children: Vec<Node>) -> Self {
        Self {
            children,
            ..Self::new(name, NodeKind::Group)
        }
    }

    /// Depth first, parents before children
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Node)) {
        f(self);
        for child in self.children.iter() {
            child.walk(f);
        }
    }

    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut Node)) {
        f(self);
        for child in self.children.iter_mut() {
            child.walk_mut(f);
        }
    }

    pub fn drawables(&self) -> Vec<&Drawable> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let NodeKind::Drawable(drawable) = &node.kind {
                out.push(drawable);
            }
        });
        out
    }

    pub fn lights(&self) -> Vec<&Light> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let NodeKind::Light(light) = &node.kind {
                out.push(light);
            }
        });
        out
    }

    /// Ids of every GPU resource reachable from this node
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut out = Vec::new();
        self.walk(&mut |node| match &node.kind {
            NodeKind::Drawable(drawable) => {
                out.push(drawable.geometry.gpu.id());
                for material in drawable.materials.iter() {
                    out.push(material.gpu.id());
                    out.extend(material.textures.values().map(|texture| texture.gpu.id()));
                }
            }
            NodeKind::Light(light) => {
                out.extend(light.shadow.as_ref().map(GpuHandle::id));
            }
            NodeKind::Group | NodeKind::Other => {}
        });
        out
    }

    /// Structurally independent copy. Shares CPU-side data, owns fresh GPU handles.
    pub fn duplicate(&self, gpu: &GpuTracker) -> Node {
        let kind = match &self.kind {
            NodeKind::Drawable(drawable) => NodeKind::Drawable(Drawable {
                geometry: drawable.geometry.duplicate(gpu),
                materials: drawable
                    .materials
                    .iter()
                    .map(|material| material.duplicate(gpu))
                    .collect(),
                cast_shadow: drawable.cast_shadow,
                receive_shadow: drawable.receive_shadow,
            }),
            NodeKind::Light(light) => NodeKind::Light(Light {
                kind: light.kind,
                color: light.color,
                intensity: light.intensity,
                range: light.range,
                shadow: light
                    .shadow
                    .as_ref()
                    .map(|_| gpu.upload(ResourceKind::LightShadow)),
            }),
            NodeKind::Group => NodeKind::Group,
            NodeKind::Other => NodeKind::Other,
        };
        Node {
            name: self.name.clone(),
            transform: self.transform,
            kind,
            children: self
                .children
                .iter()
                .map(|child| child.duplicate(gpu))
                .collect(),
        }
    }

    /// World space bounds of all drawables below this node, `parent` being the parent's world
    /// transform
    pub fn world_bounds(&self, parent: &glam::Mat4) -> Option<Aabb> {
        let world = *parent * self.transform;
        let own = match &self.kind {
            NodeKind::Drawable(drawable) => drawable
                .geometry
                .info
                .bounds
                .map(|bounds| bounds.transformed(&world)),
            _ => None,
        };
        self.children
            .iter()
            .filter_map(|child| child.world_bounds(&world))
            .fold(own, |acc, bounds| match acc {
                None => Some(bounds),
                Some(acc) => Some(acc.union(&bounds)),
            })
    }
}

impl Disposable for Node {
    fn dispose(&mut self, gpu: &GpuTracker) {
        self.walk_mut(&mut |node| match &mut node.kind {
            NodeKind::Drawable(drawable) => {
                drawable.geometry.gpu.dispose(gpu);
                for material in drawable.materials.iter_mut() {
                    material.dispose(gpu);
                }
            }
            NodeKind::Light(light) => {
                if let Some(shadow) = light.shadow.as_mut() {
                    shadow.dispose(gpu);
                }
            }
            NodeKind::Group | NodeKind::Other => {}
        });
    }
}
