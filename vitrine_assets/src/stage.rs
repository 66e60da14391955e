use crate::asset::Asset;
use crate::cache::AssetCache;
use bevy_ecs::prelude::Resource;
use std::collections::BTreeMap;

/// Identifies a mounted asset on a [`Stage`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MountId(pub(crate) u64);

/// The scene assets are mounted into for display.
///
/// Owns mounted assets; unmounting disposes them.
#[derive(Debug, Default, Resource)]
pub struct Stage {
    next_id: u64,
    mounted: BTreeMap<MountId, Asset>,
}

impl Stage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `asset` to the stage
    pub fn mount(&mut self, mut asset: Asset) -> MountId {
        let id = MountId(self.next_id);
        self.next_id += 1;
        asset.attach(id);
        tracing::debug!("Mounted asset {} of {} as {:?}", asset.id(), asset.key(), id);
        self.mounted.insert(id, asset);
        id
    }

    pub fn get(&self, id: MountId) -> Option<&Asset> {
        self.mounted.get(&id)
    }

    pub fn get_mut(&mut self, id: MountId) -> Option<&mut Asset> {
        self.mounted.get_mut(&id)
    }

    /// Detach the asset mounted as `id` and dispose it. Returns `false` if nothing was mounted.
    pub fn unmount(&mut self, id: MountId, cache: &AssetCache) -> bool {
        match self.mounted.remove(&id) {
            Some(mut asset) => {
                asset.detach();
                cache.dispose(&mut asset);
                true
            }
            None => false,
        }
    }

    /// Unmount everything, returning how many assets were disposed
    pub fn clear(&mut self, cache: &AssetCache) -> usize {
        let ids: Vec<MountId> = self.mounted.keys().copied().collect();
        ids.into_iter().filter(|id| self.unmount(*id, cache)).count()
    }

    pub fn len(&self) -> usize {
        self.mounted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MountId, &Asset)> {
        self.mounted.iter().map(|(id, asset)| (*id, asset))
    }
}
