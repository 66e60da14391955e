use crate::cache::Lease;
use crate::gpu::{Disposable, GpuTracker, ResourceId};
use crate::key::AssetKey;
use crate::scene::{Aabb, Drawable, Light, Node};
use crate::stage::MountId;
use derivative::Derivative;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Unique per checked-out copy
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId(pub(crate) u64);

impl Display for AssetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A checked-out copy of a cached asset.
///
/// The copy owns its GPU handles and may be mutated freely. Dropping it disposes it.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Asset {
    id: AssetId,
    key: AssetKey,
    root: Node,
    parent: Option<MountId>,
    #[derivative(Debug = "ignore")]
    lease: Option<Lease>,
    #[derivative(Debug = "ignore")]
    gpu: Arc<GpuTracker>,
    disposed: bool,
}

impl Asset {
    pub(crate) fn new(
        id: AssetId,
        key: AssetKey,
        root: Node,
        lease: Lease,
        gpu: Arc<GpuTracker>,
    ) -> Self {
        Self {
            id,
            key,
            root,
            parent: None,
            lease: Some(lease),
            gpu,
            disposed: false,
        }
    }

    pub fn id(&self) -> AssetId {
        self.id
    }

    /// Key of the cache record this copy was made from
    pub fn key(&self) -> &AssetKey {
        &self.key
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    pub fn drawables(&self) -> Vec<&Drawable> {
        self.root.drawables()
    }

    pub fn lights(&self) -> Vec<&Light> {
        self.root.lights()
    }

    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.root.resource_ids()
    }

    /// World space bounds of every drawable, [`None`] if nothing has bounds
    pub fn bounds(&self) -> Option<Aabb> {
        self.root.world_bounds(&glam::Mat4::IDENTITY)
    }

    /// Move the root so the bounds are centred on the origin. Returns the applied offset.
    pub fn center(&mut self) -> Option<glam::Vec3> {
        let offset = -self.bounds()?.center();
        self.root.transform = glam::Mat4::from_translation(offset) * self.root.transform;
        Some(offset)
    }

    pub fn parent(&self) -> Option<MountId> {
        self.parent
    }

    pub(crate) fn attach(&mut self, parent: MountId) {
        self.parent = Some(parent);
    }

    pub(crate) fn detach(&mut self) -> Option<MountId> {
        self.parent.take()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Release every GPU resource of this copy, detach it and give back its lease.
    ///
    /// Only the first call has an effect.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.root.dispose(&self.gpu);
        self.detach();
        self.lease = None;
        tracing::trace!("Disposed asset {} of {}", self.id, self.key);
    }
}

impl Drop for Asset {
    fn drop(&mut self) {
        self.dispose();
    }
}
