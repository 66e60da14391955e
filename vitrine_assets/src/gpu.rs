use crate::error::DisposeError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a single GPU-side allocation
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Vertex and index buffers of one primitive
    Geometry,
    /// Compiled material program and uniforms
    Material,
    /// Image bound to a material slot
    Texture,
    /// Shadow map owned by a light
    LightShadow,
}

/// Ownership token for one GPU allocation.
///
/// Not [`Clone`]. Copies of a node allocate through [`GpuTracker::upload`] and own their handles.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct GpuHandle {
    id: ResourceId,
    kind: ResourceKind,
}

impl GpuHandle {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

/// Book-keeping of which GPU resources are currently resident.
#[derive(Debug, Default)]
pub struct GpuTracker {
    next_id: AtomicU64,
    live: DashMap<ResourceId, ResourceKind>,
    released: AtomicU64,
}

impl GpuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new resource of `kind`
    pub fn upload(&self, kind: ResourceKind) -> GpuHandle {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live.insert(id, kind);
        GpuHandle { id, kind }
    }

    /// Release the resource behind `handle`.
    ///
    /// Releasing twice returns [`DisposeError::AlreadyReleased`] and leaves the tracker untouched.
    pub fn release(&self, handle: &GpuHandle) -> Result<(), DisposeError> {
        match self.live.remove(&handle.id) {
            Some(_) => {
                self.released.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Released {:?} {:?}", handle.kind, handle.id);
                Ok(())
            }
            None => Err(DisposeError::AlreadyReleased(handle.id)),
        }
    }

    pub fn is_live(&self, id: ResourceId) -> bool {
        self.live.contains_key(&id)
    }

    /// Number of resident resources
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Number of resident resources of `kind`
    pub fn live_of(&self, kind: ResourceKind) -> usize {
        self.live.iter().filter(|entry| *entry.value() == kind).count()
    }

    /// Total number of successful releases since creation
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

/// Anything holding GPU resources that can be given back to a [`GpuTracker`]
pub trait Disposable {
    /// Release every resource owned by `self`. Calling it again must be harmless.
    fn dispose(&mut self, gpu: &GpuTracker);
}

impl Disposable for GpuHandle {
    fn dispose(&mut self, gpu: &GpuTracker) {
        if let Err(e) = gpu.release(self) {
            tracing::trace!("{e}");
        }
    }
}
