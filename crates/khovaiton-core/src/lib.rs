//! khovaiton-core - Core library for Khovaiton
//!
//! Resolves fabric codes to hosted images and keeps the cross-device
//! code-to-image mapping converged. The pieces, leaf-first:
//!
//! - [`storage::RemoteImageStore`]: URL convention, existence probes, unsigned uploads
//! - [`mapping::MappingStore`]: the shared mapping document and its write endpoint
//! - [`storage::LocalPersistentCache`]: durable local mirror of recorded mappings
//! - [`cache::RuntimeCache`]: in-process TTL cache
//! - [`resolver::ImageResolver`]: precedence algorithm, batching, upload recording
//! - [`bridge::UiCacheBridge`]: optimistic patches, stale views, change events
//! - [`service::FabricImageService`]: the narrow interface collaborators call

pub mod bridge;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod mapping;
pub mod models;
pub mod resolver;
pub mod service;
pub mod state;
pub mod storage;
pub mod sync;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use models::{FabricCode, ImageRecord, ImageSource, MappingValue, UploadResult};
pub use service::FabricImageService;
pub use state::SyncState;
