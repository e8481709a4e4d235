use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Duration;

use crate::error::FetchError;
use crate::key::{KeyFilter, ResourceKey};

/// Retrieves (or, for mutations, changes) a remote resource.
///
/// Timeouts are the fetcher's own business; the synchronizer waits for as
/// long as the returned future takes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &ResourceKey) -> Result<Value, FetchError>;
}

/// Closure adapter, see [`fetch_fn`].
pub struct FnFetcher<F>(F);

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(ResourceKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, FetchError>> + Send,
{
    async fn fetch(&self, key: &ResourceKey) -> Result<Value, FetchError> {
        (self.0)(key.clone()).await
    }
}

pub fn fetch_fn<F, Fut>(f: F) -> Arc<dyn Fetcher>
where
    F: Fn(ResourceKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(FnFetcher(f))
}

/// How a key is kept in sync while somebody subscribes to it.
#[derive(Clone)]
pub struct FetchDescriptor {
    pub key: ResourceKey,
    pub fetcher: Arc<dyn Fetcher>,
    pub refetch_interval: Option<Duration>,
    pub enabled: bool,
    pub stale_after: Duration,
}

impl FetchDescriptor {
    pub fn new(key: ResourceKey, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            key,
            fetcher,
            refetch_interval: None,
            enabled: true,
            stale_after: Duration::ZERO,
        }
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Same fetcher and policy, different key.
    pub fn with_key(&self, key: ResourceKey) -> Self {
        Self { key, ..self.clone() }
    }
}

/// A one-shot write whose result is not cached.
///
/// On success the declared dependents are invalidated, or the whole cache is
/// cleared when the mutation is destructive.
#[derive(Clone)]
pub struct Mutation {
    pub label: ResourceKey,
    pub fetcher: Arc<dyn Fetcher>,
    pub invalidates: Vec<KeyFilter>,
    pub clears_all: bool,
}

impl Mutation {
    pub fn new(label: ResourceKey, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            label,
            fetcher,
            invalidates: Vec::new(),
            clears_all: false,
        }
    }

    pub fn invalidates(mut self, filter: impl Into<KeyFilter>) -> Self {
        self.invalidates.push(filter.into());
        self
    }

    pub fn clears_all(mut self) -> Self {
        self.clears_all = true;
        self
    }
}
