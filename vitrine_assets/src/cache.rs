use crate::asset::{Asset, AssetId};
use crate::config::CacheConfig;
use crate::error::{AssetError, LoadError};
use crate::gpu::{Disposable, GpuTracker};
use crate::key::AssetKey;
use crate::loader::{self, DecodeRequest};
use crate::options::LoadOptions;
use crate::samples::SampleModel;
use crate::scene::Node;
use crate::source::AssetSource;
use bevy_ecs::prelude::Resource;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::watch;

/// Lifecycle changes of cache records, drained with [`AssetCache::get_deltas`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDelta {
    /// A fetch for the key started
    Loading(AssetKey),
    /// The key was registered in the cache
    Loaded(AssetKey),
    /// The load failed and left no record
    Failed(AssetKey),
    /// The record was removed from the cache
    Evicted(AssetKey),
    /// GPU resources of the cached original were released
    Released(AssetKey),
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Loads answered from a cached record
    pub hits: u64,
    /// Loads that started a fetch
    pub misses: u64,
    /// Loads that joined a fetch already in flight
    pub coalesced: u64,
    pub failures: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

/// `None` until the load task finishes
type Outcome = Option<Result<Arc<Payload>, LoadError>>;

/// Loaded scene graph of a record. Never handed out; callers get copies.
///
/// Releases its GPU resources once the record is gone and the last lease was returned.
#[derive(Debug)]
pub(crate) struct Payload {
    key: AssetKey,
    root: Node,
    leases: AtomicUsize,
    gpu: Arc<GpuTracker>,
    delta_send: crossbeam_channel::Sender<CacheDelta>,
}

impl Payload {
    fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        self.root.dispose(&self.gpu);
        tracing::debug!("Released cached original of {}", self.key);
        // receiver is gone if the cache itself was dropped
        let _ = self.delta_send.send(CacheDelta::Released(self.key.clone()));
    }
}

/// Held by every checked-out [`Asset`], keeps the cached original alive
#[derive(Debug)]
pub(crate) struct Lease {
    payload: Arc<Payload>,
}

impl Lease {
    fn new(payload: Arc<Payload>) -> Self {
        payload.leases.fetch_add(1, Ordering::AcqRel);
        Self { payload }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.payload.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Record {
    payload: Arc<Payload>,
    /// Tick of the last checkout
    last_used: AtomicU64,
}

#[derive(Debug)]
enum Slot {
    Loading(watch::Receiver<Outcome>),
    Cached(Record),
}

/// What a load found in the table for its key
enum Claim {
    Hit(Arc<Payload>),
    Join(watch::Receiver<Outcome>),
    Start(watch::Receiver<Outcome>, watch::Sender<Outcome>),
}

/// Owned by a load task. Clears the task's loading slot however the task ends, so later loads
/// never wait on a dead channel.
struct PendingSlot {
    inner: Arc<CacheInner>,
    key: AssetKey,
    receiver: watch::Receiver<Outcome>,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.inner.remove_loading(&self.key, &self.receiver);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

struct CacheInner {
    /// In-flight and cached records share one table, so a key has at most one of either
    slots: DashMap<AssetKey, Slot>,
    source: Arc<dyn AssetSource>,
    config: CacheConfig,
    gpu: Arc<GpuTracker>,
    clock: AtomicU64,
    next_asset: AtomicU64,
    counters: Counters,
    delta_send: crossbeam_channel::Sender<CacheDelta>,
    delta_recv: crossbeam_channel::Receiver<CacheDelta>,
}

impl CacheInner {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, delta: CacheDelta) {
        if let Err(e) = self.delta_send.send(delta) {
            tracing::warn!("Dropped cache delta: {e}");
        }
    }

    /// Drop the loading slot of `key` if it still belongs to `receiver`'s channel
    fn remove_loading(&self, key: &AssetKey, receiver: &watch::Receiver<Outcome>) {
        self.slots.remove_if(key, |_, slot| {
            matches!(slot, Slot::Loading(other) if other.same_channel(receiver))
        });
    }

    fn evict(&self, key: &AssetKey) -> bool {
        match self
            .slots
            .remove_if(key, |_, slot| matches!(slot, Slot::Cached(_)))
        {
            Some((key, Slot::Cached(record))) => {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Evicted {}, {} copies outstanding",
                    key,
                    record.payload.leases()
                );
                self.publish(CacheDelta::Evicted(key));
                // dropping the record releases the original unless copies are still out
                drop(record);
                true
            }
            _ => false,
        }
    }

    /// Evict least recently used, unleased records until the cache fits its capacity again.
    /// `keep` is never chosen.
    fn enforce_capacity(&self, keep: &AssetKey) {
        let Some(capacity) = self.config.capacity else {
            return;
        };
        loop {
            let cached = self
                .slots
                .iter()
                .filter(|slot| matches!(slot.value(), Slot::Cached(_)))
                .count();
            if cached <= capacity {
                return;
            }
            let victim = self
                .slots
                .iter()
                .filter_map(|slot| match slot.value() {
                    Slot::Cached(record)
                        if slot.key() != keep && record.payload.leases() == 0 =>
                    {
                        Some((record.last_used.load(Ordering::Relaxed), slot.key().clone()))
                    }
                    _ => None,
                })
                .min_by_key(|(last_used, _)| *last_used)
                .map(|(_, key)| key);
            match victim {
                Some(victim) => {
                    self.evict(&victim);
                }
                None => {
                    tracing::debug!(
                        "Cache holds {} records over a capacity of {}, all in use",
                        cached,
                        capacity
                    );
                    return;
                }
            }
        }
    }
}

/// Cache of loaded 3D assets keyed by path and load options.
///
/// Cheap to clone; clones share the same cache. Concurrent loads of one key share a single fetch
/// and every caller receives its own copy.
#[derive(Resource, Clone)]
pub struct AssetCache {
    inner: Arc<CacheInner>,
}

impl AssetCache {
    pub fn new(source: impl AssetSource, config: CacheConfig) -> Self {
        let (delta_send, delta_recv) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(CacheInner {
                slots: DashMap::new(),
                source: Arc::new(source),
                config,
                gpu: Arc::new(GpuTracker::new()),
                clock: AtomicU64::new(0),
                next_asset: AtomicU64::new(0),
                counters: Counters::default(),
                delta_send,
                delta_recv,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Residency of every GPU resource owned by cached originals and checked-out copies
    pub fn gpu(&self) -> &Arc<GpuTracker> {
        &self.inner.gpu
    }

    pub fn resolve_key(&self, path: &str, options: &LoadOptions) -> Result<AssetKey, AssetError> {
        AssetKey::resolve(path, options)
    }

    /// Load `path` and return a copy of it.
    ///
    /// A cached key is answered without I/O. A key already being loaded waits for that load.
    /// Failures leave nothing behind, so the next call tries again.
    pub async fn load(&self, path: &str, options: &LoadOptions) -> Result<Asset, AssetError> {
        let result = self.checkout_or_load(path, options).await;
        self.report(options, result)
    }

    /// Load one of the built-in [`SampleModel`]s by name
    pub async fn load_sample(&self, name: &str, options: &LoadOptions) -> Result<Asset, AssetError> {
        match name.parse::<SampleModel>() {
            Ok(model) => self.load(&model.path(), options).await,
            Err(e) => self.report(options, Err(e)),
        }
    }

    fn report(
        &self,
        options: &LoadOptions,
        result: Result<Asset, AssetError>,
    ) -> Result<Asset, AssetError> {
        match &result {
            Ok(asset) => {
                if let Some(on_load) = options.on_load.as_ref() {
                    on_load(asset);
                }
            }
            Err(e) => {
                if let Some(on_error) = options.on_error.as_ref() {
                    on_error(e);
                }
            }
        }
        result
    }

    async fn checkout_or_load(&self, path: &str, options: &LoadOptions) -> Result<Asset, AssetError> {
        let key = self.resolve_key(path, options)?;

        // shard guard must be gone before copying or awaiting
        let claim = match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut entry) => match entry.get() {
                Slot::Cached(record) => {
                    record.last_used.store(self.inner.tick(), Ordering::Relaxed);
                    Claim::Hit(record.payload.clone())
                }
                // a closed channel means the task that owned the slot is gone
                Slot::Loading(receiver) if receiver.has_changed().is_ok() => {
                    Claim::Join(receiver.clone())
                }
                Slot::Loading(_) => {
                    tracing::warn!("Replacing abandoned load of {}", key);
                    let (sender, receiver) = watch::channel(None);
                    entry.insert(Slot::Loading(receiver.clone()));
                    Claim::Start(receiver, sender)
                }
            },
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(None);
                entry.insert(Slot::Loading(receiver.clone()));
                Claim::Start(receiver, sender)
            }
        };

        let mut receiver = match claim {
            Claim::Hit(payload) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache hit {}", key);
                return Ok(self.checkout(payload));
            }
            Claim::Join(receiver) => {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Joining in-flight load of {}", key);
                receiver
            }
            Claim::Start(receiver, sender) => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.inner.publish(CacheDelta::Loading(key.clone()));
                let request = DecodeRequest {
                    path: key.path().to_string(),
                    codecs: options.codecs(),
                    overrides: options.material_overrides.clone(),
                    shadows: self.inner.config.shadows,
                };
                self.spawn_load(key.clone(), request, receiver.clone(), sender);
                receiver
            }
        };

        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(payload)) => Ok(self.checkout(payload)),
            Some(Err(e)) => Err(e.into()),
            None => {
                // load task went away without an answer, do not leave the key stuck in loading
                self.inner.remove_loading(&key, &receiver);
                Err(LoadError::Interrupted {
                    path: key.path().to_string(),
                }
                .into())
            }
        }
    }

    /// Runs the load detached from the caller, so dropping the caller does not abandon it
    fn spawn_load(
        &self,
        key: AssetKey,
        request: DecodeRequest,
        receiver: watch::Receiver<Outcome>,
        sender: watch::Sender<Outcome>,
    ) {
        let pending = PendingSlot {
            inner: self.inner.clone(),
            key,
            receiver,
        };
        tokio::spawn(async move {
            let inner = &pending.inner;
            let key = &pending.key;
            let load = loader::load(inner.source.as_ref(), &request, &inner.gpu);
            let result = AssertUnwindSafe(load)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    tracing::error!("Load task for {} panicked: {}", key, panic_message(&*panic));
                    Err(LoadError::Interrupted {
                        path: request.path.clone(),
                    })
                });
            let outcome = match result {
                Ok(root) => {
                    let payload = Arc::new(Payload {
                        key: key.clone(),
                        root,
                        leases: AtomicUsize::new(0),
                        gpu: inner.gpu.clone(),
                        delta_send: inner.delta_send.clone(),
                    });
                    // registered before anyone is told about it
                    inner.slots.insert(
                        key.clone(),
                        Slot::Cached(Record {
                            payload: payload.clone(),
                            last_used: AtomicU64::new(inner.tick()),
                        }),
                    );
                    tracing::debug!("Cached {}", key);
                    inner.publish(CacheDelta::Loaded(key.clone()));
                    inner.enforce_capacity(key);
                    Ok(payload)
                }
                Err(e) => {
                    tracing::error!("Failed to load {}: {}", key, e);
                    inner.remove_loading(key, &pending.receiver);
                    inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                    inner.publish(CacheDelta::Failed(key.clone()));
                    Err(e)
                }
            };
            sender.send_replace(Some(outcome));
        });
    }

    fn checkout(&self, payload: Arc<Payload>) -> Asset {
        let root = payload.root.duplicate(&self.inner.gpu);
        let id = AssetId(self.inner.next_asset.fetch_add(1, Ordering::Relaxed));
        let key = payload.key.clone();
        Asset::new(id, key, root, Lease::new(payload), self.inner.gpu.clone())
    }

    /// Release the GPU resources of a checked-out copy. Repeated calls do nothing.
    pub fn dispose(&self, asset: &mut Asset) {
        if asset.is_disposed() {
            tracing::trace!("Asset {} already disposed", asset.id());
            return;
        }
        asset.dispose();
        tracing::debug!("Disposed asset {} of {}", asset.id(), asset.key());
    }

    /// Remove the record for `key`. Its original is released once no copy is outstanding.
    ///
    /// Returns `false` if nothing is cached under `key`; in-flight loads are not affected.
    pub fn evict(&self, key: &AssetKey) -> bool {
        self.inner.evict(key)
    }

    /// Evict every cached record, returning how many were removed
    pub fn clear(&self) -> usize {
        let keys: Vec<AssetKey> = self
            .inner
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Cached(_)))
            .map(|slot| slot.key().clone())
            .collect();
        keys.iter().filter(|key| self.inner.evict(key)).count()
    }

    /// Whether a loaded record exists for `key`
    pub fn contains(&self, key: &AssetKey) -> bool {
        matches!(
            self.inner.slots.get(key).as_deref(),
            Some(Slot::Cached(_))
        )
    }

    pub fn is_loading(&self, key: &AssetKey) -> bool {
        matches!(
            self.inner.slots.get(key).as_deref(),
            Some(Slot::Loading(_))
        )
    }

    /// Number of cached records
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Cached(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of the record for `key` that have not been disposed yet
    pub fn outstanding(&self, key: &AssetKey) -> usize {
        match self.inner.slots.get(key).as_deref() {
            Some(Slot::Cached(record)) => record.payload.leases(),
            _ => 0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn get_deltas(&self) -> Vec<CacheDelta> {
        let mut deltas: Vec<CacheDelta> = Vec::new();
        while let Ok(delta) = self.inner.delta_recv.try_recv() {
            deltas.push(delta);
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShadowPolicy;
    use crate::gpu::ResourceKind;
    use crate::loader::DRACO_EXTENSION;
    use crate::samples::to_glb;
    use crate::scene::MaterialDesc;
    use crate::source::MemorySource;
    use futures::future::BoxFuture;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Panics inside its first fetch, serves the wrapped source afterwards
    struct PanicsOnce {
        calls: AtomicUsize,
        samples: MemorySource,
    }

    impl PanicsOnce {
        fn new() -> Arc<Self> {
            let samples = MemorySource::new();
            for model in SampleModel::ALL {
                samples.insert(model.path(), model.to_glb());
            }
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                samples,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AssetSource for PanicsOnce {
        fn fetch(&self, path: &str) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            let fetch = self.samples.fetch(path);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if first {
                    panic!("decoder state corrupted");
                }
                fetch.await
            }
            .boxed()
        }
    }

    fn setup_with(source: MemorySource, config: CacheConfig) -> (AssetCache, Arc<MemorySource>) {
        for model in SampleModel::ALL {
            source.insert(model.path(), model.to_glb());
        }
        let source = Arc::new(source);
        (AssetCache::new(source.clone(), config), source)
    }

    fn setup() -> (AssetCache, Arc<MemorySource>) {
        setup_with(MemorySource::new(), CacheConfig::default())
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let read = {
            let count = count.clone();
            move || count.load(Ordering::SeqCst)
        };
        (count, read)
    }

    #[tokio::test]
    async fn test_cube_casts_and_receives_shadows() {
        let (cache, source) = setup();
        let asset = cache
            .load_sample("cube", &LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(asset.key().path(), "/models/cube.glb");
        let drawables = asset.drawables();
        assert!(!drawables.is_empty());
        assert!(
            drawables
                .iter()
                .any(|drawable| drawable.cast_shadow && drawable.receive_shadow)
        );
        assert_eq!(source.fetch_count("/models/cube.glb"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_fetch() {
        let (cache, source) = setup_with(
            MemorySource::new().with_latency(Duration::from_millis(20)),
            CacheConfig::default(),
        );
        let options = LoadOptions::default();
        let (a, b) = tokio::join!(
            cache.load("/models/cube.glb", &options),
            cache.load("/models/cube.glb", &options)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(source.fetch_count("/models/cube.glb"), 1);
        assert_ne!(a.id(), b.id());

        let a_ids: HashSet<_> = a.resource_ids().into_iter().collect();
        assert!(b.resource_ids().iter().all(|id| !a_ids.contains(id)));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 1);
        assert_eq!(cache.outstanding(a.key()), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let (cache, source) = setup();
        let options = LoadOptions::default();
        let first = cache.load("/models/sphere.glb", &options).await.unwrap();
        let second = cache.load("/models/sphere.glb", &options).await.unwrap();
        assert_eq!(source.fetch_count("/models/sphere.glb"), 1);
        assert_eq!(first.key(), second.key());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_path_is_rejected_before_fetch() {
        let (cache, source) = setup();
        let (errors, error_count) = counter();
        let options = LoadOptions::default().on_error(move |e| {
            assert!(matches!(e, AssetError::InvalidKey { .. }));
            errors.fetch_add(1, Ordering::SeqCst);
        });
        match cache.load("", &options).await {
            Err(AssetError::InvalidKey { .. }) => {}
            other => panic!("Expected InvalidKey, got {:?}", other),
        }
        assert_eq!(source.total_fetches(), 0);
        assert_eq!(error_count(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_options_select_entries() {
        let (cache, source) = setup();
        let plain = LoadOptions::default();
        let draco = LoadOptions::default().with_geometry_codec("/draco/");
        cache.load("/models/cube.glb", &plain).await.unwrap();
        cache.load("/models/cube.glb", &draco).await.unwrap();
        assert_eq!(source.fetch_count("/models/cube.glb"), 2);
        assert_eq!(cache.len(), 2);

        let red = MaterialDesc::named("Red").with_base_color([1.0, 0.0, 0.0, 1.0]);
        let blue = MaterialDesc::named("Blue").with_base_color([0.0, 0.0, 1.0, 1.0]);
        let a = LoadOptions::default()
            .with_override("Body", red.clone())
            .with_override("Trim", blue.clone());
        let b = LoadOptions::default()
            .with_override("Trim", blue)
            .with_override("Body", red);
        cache.load("/models/test.glb", &a).await.unwrap();
        cache.load("/models/test.glb", &b).await.unwrap();
        assert_eq!(source.fetch_count("/models/test.glb"), 1);
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison() {
        let (cache, source) = setup();
        let (errors, error_count) = counter();
        let options = LoadOptions::default().on_error(move |_| {
            errors.fetch_add(1, Ordering::SeqCst);
        });
        source.fail("/models/cube.glb");
        match cache.load("/models/cube.glb", &options).await {
            Err(AssetError::Load(LoadError::Fetch { path, .. })) => {
                assert_eq!(path, "/models/cube.glb")
            }
            other => panic!("Expected a fetch error, got {:?}", other),
        }
        let key = cache
            .resolve_key("/models/cube.glb", &LoadOptions::default())
            .unwrap();
        assert!(!cache.contains(&key));
        assert!(!cache.is_loading(&key));
        assert_eq!(error_count(), 1);

        source.heal("/models/cube.glb");
        assert!(cache.load("/models/cube.glb", &options).await.is_ok());
        assert_eq!(source.fetch_count("/models/cube.glb"), 2);
        assert!(cache.contains(&key));
        assert_eq!(cache.stats().failures, 1);
        assert_eq!(error_count(), 1);
    }

    #[tokio::test]
    async fn test_coalesced_failure_reaches_every_caller() {
        let (cache, source) = setup_with(
            MemorySource::new().with_latency(Duration::from_millis(20)),
            CacheConfig::default(),
        );
        source.fail("/models/sphere.glb");
        let options = LoadOptions::default();
        let (a, b) = tokio::join!(
            cache.load("/models/sphere.glb", &options),
            cache.load("/models/sphere.glb", &options)
        );
        assert!(matches!(a, Err(AssetError::Load(LoadError::Fetch { .. }))));
        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(source.fetch_count("/models/sphere.glb"), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_on_load_sees_every_success() {
        let (cache, _source) = setup();
        let (loads, load_count) = counter();
        let options = LoadOptions::default().on_load(move |asset| {
            assert!(!asset.drawables().is_empty());
            loads.fetch_add(1, Ordering::SeqCst);
        });
        cache.load_sample("cube", &options).await.unwrap();
        cache.load_sample("cube", &options).await.unwrap();
        assert_eq!(load_count(), 2);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_local() {
        let (cache, _source) = setup();
        let options = LoadOptions::default();
        let mut a = cache.load_sample("sphere", &options).await.unwrap();
        let b = cache.load_sample("sphere", &options).await.unwrap();
        let live_before = cache.gpu().live();

        let a_ids = a.resource_ids();
        cache.dispose(&mut a);
        let released = cache.gpu().released();
        cache.dispose(&mut a);
        assert_eq!(cache.gpu().released(), released);
        assert!(a.is_disposed());
        assert!(a_ids.iter().all(|id| !cache.gpu().is_live(*id)));
        assert!(b.resource_ids().iter().all(|id| cache.gpu().is_live(*id)));
        assert_eq!(cache.gpu().live(), live_before - a_ids.len());
        assert_eq!(cache.outstanding(b.key()), 1);

        // the cached original still produces complete copies
        let c = cache.load_sample("sphere", &options).await.unwrap();
        assert_eq!(c.resource_ids().len(), a_ids.len());
        assert!(c.resource_ids().iter().all(|id| cache.gpu().is_live(*id)));
    }

    #[tokio::test]
    async fn test_mutating_a_copy_leaves_others_alone() {
        let (cache, _source) = setup();
        let options = LoadOptions::default();
        let mut a = cache.load_sample("test", &options).await.unwrap();
        a.root_mut().transform = glam::Mat4::from_translation(glam::Vec3::X * 5.0);
        a.root_mut().children.clear();

        let b = cache.load_sample("test", &options).await.unwrap();
        assert_eq!(b.root().transform, glam::Mat4::IDENTITY);
        assert_eq!(b.drawables().len(), 2);
        assert_eq!(b.lights().len(), 1);
    }

    #[tokio::test]
    async fn test_evict_waits_for_last_lease() {
        let (cache, _source) = setup();
        let mut asset = cache
            .load_sample("cube", &LoadOptions::default())
            .await
            .unwrap();
        let key = asset.key().clone();
        let copy_resources = asset.resource_ids().len();

        assert!(cache.evict(&key));
        assert!(!cache.contains(&key));
        assert!(!cache.evict(&key));
        // original and copy are both still resident
        assert_eq!(cache.gpu().live(), copy_resources * 2);

        cache.dispose(&mut asset);
        assert_eq!(cache.gpu().live(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_evict_without_copies_releases_immediately() {
        let (cache, _source) = setup();
        let asset = cache
            .load_sample("sphere", &LoadOptions::default())
            .await
            .unwrap();
        let key = asset.key().clone();
        drop(asset);
        assert_eq!(cache.outstanding(&key), 0);
        assert!(cache.gpu().live() > 0);
        assert!(cache.evict(&key));
        assert_eq!(cache.gpu().live(), 0);
    }

    #[tokio::test]
    async fn test_capacity_skips_leased_records() {
        let (cache, _source) = setup_with(MemorySource::new(), CacheConfig::default().with_capacity(1));
        let options = LoadOptions::default();
        let cube = cache.load_sample("cube", &options).await.unwrap();
        let sphere = cache.load_sample("sphere", &options).await.unwrap();
        let sphere_key = sphere.key().clone();
        // cube is leased and sphere is the newest record
        assert_eq!(cache.len(), 2);
        drop(sphere);

        let test = cache.load_sample("test", &options).await.unwrap();
        assert!(cache.contains(cube.key()));
        assert!(cache.contains(test.key()));
        assert!(!cache.contains(&sphere_key));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let (cache, _source) = setup_with(MemorySource::new(), CacheConfig::default().with_capacity(2));
        let options = LoadOptions::default();
        let cube_key = cache.resolve_key("/models/cube.glb", &options).unwrap();
        let sphere_key = cache.resolve_key("/models/sphere.glb", &options).unwrap();
        drop(cache.load_sample("cube", &options).await.unwrap());
        drop(cache.load_sample("sphere", &options).await.unwrap());
        // touch cube so sphere becomes the oldest
        drop(cache.load_sample("cube", &options).await.unwrap());
        drop(cache.load_sample("test", &options).await.unwrap());

        assert!(cache.contains(&cube_key));
        assert!(!cache.contains(&sphere_key));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_codec() {
        let (cache, source) = setup();
        let document = serde_json::json!({
            "asset": { "version": "2.0" },
            "extensionsUsed": [DRACO_EXTENSION],
            "extensionsRequired": [DRACO_EXTENSION],
            "scenes": [{ "nodes": [0] }],
            "nodes": [{ "name": "Compressed" }],
        });
        source.insert(
            "/models/compressed.glb",
            to_glb(&serde_json::to_vec(&document).unwrap()),
        );

        match cache
            .load("/models/compressed.glb", &LoadOptions::default())
            .await
        {
            Err(AssetError::Load(LoadError::MissingCodec { extension, .. })) => {
                assert_eq!(extension, DRACO_EXTENSION)
            }
            other => panic!("Expected MissingCodec, got {:?}", other),
        }
        let options = LoadOptions::default().with_geometry_codec("/vendor/draco/");
        assert!(cache.load("/models/compressed.glb", &options).await.is_ok());
    }

    #[tokio::test]
    async fn test_material_overrides() {
        let (cache, _source) = setup();
        let options = LoadOptions::default().with_override(
            "Body",
            MaterialDesc::named("Lacquer").with_base_color([0.0, 0.0, 0.0, 1.0]),
        );
        let asset = cache.load_sample("test", &options).await.unwrap();
        let names: Vec<Option<&str>> = asset
            .drawables()
            .iter()
            .map(|drawable| drawable.materials[0].name())
            .collect();
        assert_eq!(names, vec![Some("Lacquer"), Some("Trim")]);
    }

    #[tokio::test]
    async fn test_light_shadow_maps_are_released() {
        let shadows = ShadowPolicy {
            lights: true,
            ..Default::default()
        };
        let (cache, _source) = setup_with(
            MemorySource::new(),
            CacheConfig::default().with_shadows(shadows),
        );
        let mut asset = cache
            .load_sample("test", &LoadOptions::default())
            .await
            .unwrap();
        assert!(asset.lights()[0].shadow.is_some());
        assert_eq!(cache.gpu().live_of(ResourceKind::LightShadow), 2);

        cache.dispose(&mut asset);
        assert_eq!(cache.gpu().live_of(ResourceKind::LightShadow), 1);
        cache.clear();
        assert_eq!(cache.gpu().live_of(ResourceKind::LightShadow), 0);
    }

    #[tokio::test]
    async fn test_deltas() {
        let (cache, source) = setup();
        let options = LoadOptions::default();
        let key = cache.resolve_key("/models/cube.glb", &options).unwrap();
        drop(cache.load("/models/cube.glb", &options).await.unwrap());
        cache.evict(&key);

        source.fail("/models/sphere.glb");
        let failed = cache.resolve_key("/models/sphere.glb", &options).unwrap();
        assert!(cache.load("/models/sphere.glb", &options).await.is_err());

        assert_eq!(
            cache.get_deltas(),
            vec![
                CacheDelta::Loading(key.clone()),
                CacheDelta::Loaded(key.clone()),
                CacheDelta::Evicted(key.clone()),
                CacheDelta::Released(key),
                CacheDelta::Loading(failed.clone()),
                CacheDelta::Failed(failed),
            ]
        );
        assert!(cache.get_deltas().is_empty());
    }

    #[tokio::test]
    async fn test_load_outlives_dropped_caller() {
        let (cache, source) = setup_with(
            MemorySource::new().with_latency(Duration::from_millis(30)),
            CacheConfig::default(),
        );
        let options = LoadOptions::default();
        let key = cache.resolve_key("/models/cube.glb", &options).unwrap();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(1),
            cache.load("/models/cube.glb", &options),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(cache.is_loading(&key));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.contains(&key));
        cache.load("/models/cube.glb", &options).await.unwrap();
        assert_eq!(source.fetch_count("/models/cube.glb"), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_panicked_load_is_retried_after_caller_left() {
        let source = PanicsOnce::new();
        let cache = AssetCache::new(source.clone(), CacheConfig::default());
        let options = LoadOptions::default();
        let key = cache.resolve_key("/models/cube.glb", &options).unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(1),
            cache.load("/models/cube.glb", &options),
        )
        .await;
        assert!(abandoned.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!cache.is_loading(&key));
        assert_eq!(cache.stats().failures, 1);

        cache.load("/models/cube.glb", &options).await.unwrap();
        assert_eq!(source.calls(), 2);
        assert!(cache.contains(&key));
        assert_eq!(
            cache.get_deltas(),
            vec![
                CacheDelta::Loading(key.clone()),
                CacheDelta::Failed(key.clone()),
                CacheDelta::Loading(key.clone()),
                CacheDelta::Loaded(key),
            ]
        );
    }

    #[tokio::test]
    async fn test_panicked_load_reaches_waiting_callers() {
        let source = PanicsOnce::new();
        let cache = AssetCache::new(source.clone(), CacheConfig::default());
        let options = LoadOptions::default();
        let (a, b) = tokio::join!(
            cache.load("/models/sphere.glb", &options),
            cache.load("/models/sphere.glb", &options)
        );
        for result in [a, b] {
            assert_eq!(
                result.unwrap_err(),
                AssetError::Load(LoadError::Interrupted {
                    path: "/models/sphere.glb".into()
                })
            );
        }
        assert!(cache.load("/models/sphere.glb", &options).await.is_ok());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_loading_slot_is_replaced() {
        let (cache, source) = setup();
        let options = LoadOptions::default();
        let key = cache.resolve_key("/models/cube.glb", &options).unwrap();
        let (sender, receiver) = watch::channel(None);
        cache.inner.slots.insert(key.clone(), Slot::Loading(receiver));
        drop(sender);
        assert!(cache.is_loading(&key));

        cache.load("/models/cube.glb", &options).await.unwrap();
        assert_eq!(source.fetch_count("/models/cube.glb"), 1);
        assert!(cache.contains(&key));
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().coalesced, 0);
    }

    #[tokio::test]
    async fn test_malformed_document_fails_cleanly() {
        let (cache, source) = setup();
        let cyclic = serde_json::json!({
            "asset": { "version": "2.0" },
            "scenes": [{ "nodes": [0] }],
            "nodes": [{ "children": [1] }, { "children": [0] }],
        });
        let dangling = serde_json::json!({
            "asset": { "version": "2.0" },
            "scenes": [{ "nodes": [0] }],
            "nodes": [{ "mesh": 5 }],
        });
        source.insert("/cyclic.glb", to_glb(&serde_json::to_vec(&cyclic).unwrap()));
        source.insert("/dangling.glb", to_glb(&serde_json::to_vec(&dangling).unwrap()));

        let options = LoadOptions::default();
        for path in ["/cyclic.glb", "/dangling.glb"] {
            for _ in 0..2 {
                assert!(matches!(
                    cache.load(path, &options).await,
                    Err(AssetError::Load(LoadError::Parse { .. }))
                ));
            }
            let key = cache.resolve_key(path, &options).unwrap();
            assert!(!cache.is_loading(&key));
            assert!(!cache.contains(&key));
            assert_eq!(source.fetch_count(path), 2);
        }
        assert_eq!(cache.gpu().live(), 0);
    }

    #[tokio::test]
    async fn test_copies_own_their_textures() {
        let (cache, _) = setup();
        let options = LoadOptions::default();
        let mut a = cache.load("/models/sphere.glb", &options).await.unwrap();
        let b = cache.load("/models/sphere.glb", &options).await.unwrap();
        let textures = |asset: &Asset| -> Vec<_> {
            asset.drawables()[0].materials[0]
                .textures
                .values()
                .map(|texture| texture.gpu.id())
                .collect()
        };
        let (a_textures, b_textures) = (textures(&a), textures(&b));
        assert_eq!(a_textures.len(), 4);
        assert!(a_textures.iter().all(|id| !b_textures.contains(id)));
        // original plus two copies
        assert_eq!(cache.gpu().live_of(ResourceKind::Texture), 12);

        cache.dispose(&mut a);
        assert!(a_textures.iter().all(|id| !cache.gpu().is_live(*id)));
        assert!(b_textures.iter().all(|id| cache.gpu().is_live(*id)));
        assert_eq!(cache.gpu().live_of(ResourceKind::Texture), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_hits() {
        let (cache, source) = setup();
        let options = LoadOptions::default();
        drop(cache.load("/models/test.glb", &options).await.unwrap());

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let asset = cache
                        .load("/models/test.glb", &LoadOptions::default())
                        .await
                        .unwrap();
                    // the table stays usable while copies are made
                    assert!(cache.contains(asset.key()));
                    asset.id()
                })
            })
            .collect();
        let ids: HashSet<AssetId> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|id| id.unwrap())
            .collect();
        assert_eq!(ids.len(), 32);
        assert_eq!(cache.stats().hits, 32);
        assert_eq!(source.fetch_count("/models/test.glb"), 1);
    }

    #[tokio::test]
    async fn test_unknown_sample() {
        let (cache, source) = setup();
        let (errors, error_count) = counter();
        let options = LoadOptions::default().on_error(move |_| {
            errors.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(
            cache.load_sample("teapot", &options).await.unwrap_err(),
            AssetError::UnknownSample("teapot".into())
        );
        assert_eq!(error_count(), 1);
        assert_eq!(source.total_fetches(), 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let (cache, _source) = setup();
        let options = LoadOptions::default();
        drop(cache.load_sample("cube", &options).await.unwrap());
        drop(cache.load_sample("sphere", &options).await.unwrap());
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.gpu().live(), 0);
    }
}
