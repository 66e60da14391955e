pub mod asset;
pub mod cache;
pub mod config;
pub mod error;
pub mod gpu;
pub mod key;
pub mod loader;
pub mod options;
pub mod samples;
pub mod scene;
pub mod source;
pub mod stage;

pub use asset::{Asset, AssetId};
pub use cache::{AssetCache, CacheDelta, CacheStats};
pub use config::{CacheConfig, ShadowPolicy};
pub use error::{AssetError, DisposeError, LoadError};
pub use key::AssetKey;
pub use options::LoadOptions;
pub use samples::SampleModel;
pub use stage::{MountId, Stage};

pub mod prelude {
    pub use crate::asset::{Asset, AssetId};
    pub use crate::cache::{AssetCache, CacheDelta, CacheStats};
    pub use crate::config::{CacheConfig, ShadowPolicy};
    pub use crate::error::{AssetError, DisposeError, LoadError};
    pub use crate::gpu::{Disposable, GpuHandle, GpuTracker, ResourceId, ResourceKind};
    pub use crate::key::AssetKey;
    pub use crate::options::LoadOptions;
    pub use crate::samples::SampleModel;
    pub use crate::scene::*;
    pub use crate::source::{AssetSource, FileSource, HttpSource, MemorySource, RoutedSource};
    pub use crate::stage::{MountId, Stage};
}
