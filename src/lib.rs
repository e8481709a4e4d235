//! Client-side synchronization layer for the agent dashboard.
//!
//! [`cache::ResourceCache`] holds the last known state of every remote
//! resource, [`sync::Synchronizer`] keeps the watched ones fresh, and
//! [`dashboard::Dashboard`] describes the backend's resources and writes.

pub mod api;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod fetcher;
pub mod key;
pub mod leads;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod sync;

pub use cache::{CacheEntry, EntryPatch, FetchStatus, ResourceCache};
pub use error::FetchError;
pub use fetcher::{fetch_fn, FetchDescriptor, Fetcher, Mutation};
pub use key::{KeyFilter, ResourceKey};
pub use sync::{Subscription, Synchronizer, Trigger};
