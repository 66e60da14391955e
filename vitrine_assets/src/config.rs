/// Which shadow flags loaded content receives
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ShadowPolicy {
    /// Drawables cast shadows
    pub cast: bool,
    /// Drawables receive shadows
    pub receive: bool,
    /// Lights allocate a shadow map
    pub lights: bool,
}

impl Default for ShadowPolicy {
    fn default() -> Self {
        Self {
            cast: true,
            receive: true,
            lights: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of cached records. [`None`] never evicts on its own.
    ///
    /// Only records without outstanding clones are evicted, so the cache may temporarily hold
    /// more than `capacity` records.
    pub capacity: Option<usize>,
    pub shadows: ShadowPolicy,
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_shadows(mut self, shadows: ShadowPolicy) -> Self {
        self.shadows = shadows;
        self
    }
}
