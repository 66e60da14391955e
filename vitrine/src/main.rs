use anyhow::{Context, Result};
use bevy_ecs::prelude::*;
use bevy_ecs::schedule::ExecutorKind;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use vitrine_assets::source::{MemorySource, RoutedSource};
use vitrine_assets::{AssetCache, CacheConfig, LoadOptions, SampleModel, Stage};

fn log_level() -> Level {
    std::env::var("VITRINE_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(Level::INFO)
}

fn cache_config() -> Result<CacheConfig> {
    let mut config = CacheConfig::default();
    if let Ok(capacity) = std::env::var("VITRINE_CACHE_CAPACITY") {
        let capacity = capacity
            .parse()
            .with_context(|| format!("Invalid VITRINE_CACHE_CAPACITY {capacity:?}"))?;
        config = config.with_capacity(capacity);
    }
    Ok(config)
}

/// Assets come from the directory given on the command line or in `VITRINE_ASSET_ROOT`,
/// otherwise from the built-in sample models
fn build_cache(config: CacheConfig) -> AssetCache {
    let root = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VITRINE_ASSET_ROOT").ok());
    match root {
        Some(root) => {
            tracing::info!("Serving assets from {}", root);
            AssetCache::new(RoutedSource::new(root), config)
        }
        None => {
            tracing::info!("No asset root given, serving built-in sample models");
            let source = MemorySource::new();
            for model in SampleModel::ALL {
                source.insert(model.path(), model.to_glb());
            }
            AssetCache::new(source, config)
        }
    }
}

fn log_deltas(cache: Res<AssetCache>) {
    for delta in cache.get_deltas() {
        tracing::info!("{:?}", delta);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut world = World::new();
    world.insert_resource(build_cache(cache_config()?));
    world.insert_resource(Stage::new());
    let mut schedule = Schedule::default();
    schedule.set_executor_kind(ExecutorKind::SingleThreaded);
    schedule.add_systems(log_deltas);

    let cache = world.resource::<AssetCache>().clone();
    let options = LoadOptions::default()
        .on_load(|asset| tracing::info!("Checked out {} as {}", asset.key(), asset.id()))
        .on_error(|e| tracing::warn!("{e}"));

    // both cube requests share one fetch
    let requests = ["cube", "cube", "sphere", "test"];
    let loaded = futures::future::join_all(
        requests
            .iter()
            .map(|name| cache.load_sample(name, &options)),
    )
    .await;
    schedule.run(&mut world);

    let mut mounted = Vec::new();
    {
        let mut stage = world.resource_mut::<Stage>();
        for (name, result) in requests.iter().zip(loaded) {
            match result {
                Ok(mut asset) => {
                    if let Some(offset) = asset.center() {
                        tracing::debug!("Centred {} by {}", name, offset);
                    }
                    mounted.push(stage.mount(asset));
                }
                Err(e) => tracing::error!("Could not load {}: {}", name, e),
            }
        }
        tracing::info!(
            "{} assets on stage, {} GPU resources resident",
            stage.len(),
            cache.gpu().live()
        );
    }

    if let Err(e) = cache.load("", &options).await {
        tracing::info!("Rejected before fetching: {e}");
    }

    for id in mounted {
        world.resource_mut::<Stage>().unmount(id, &cache);
    }
    tracing::info!("{:?}, {} records cached", cache.stats(), cache.len());

    let evicted = cache.clear();
    schedule.run(&mut world);
    tracing::info!(
        "Evicted {} records, {} GPU resources still resident",
        evicted,
        cache.gpu().live()
    );
    Ok(())
}
