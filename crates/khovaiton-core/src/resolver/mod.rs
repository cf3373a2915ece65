//! Fabric code to image URL resolution.
//!
//! Precedence, first match wins:
//!
//! 1. unexpired [`RuntimeCache`] entry
//! 2. exact mapping from the [`LocalPersistentCache`] or the mapping snapshot
//! 3. the naming-convention URL, if an existence probe confirms it
//! 4. `None`
//!
//! Writes (uploads, manual overrides) land in the runtime and persisted caches
//! before anything is awaited, then propagate to the UI bridge and, in the
//! background, to the mapping store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{ImageAction, UiCacheBridge};
use crate::cache::{CacheStats, RuntimeCache};
use crate::clock::Clock;
use crate::config::ImageSyncConfig;
use crate::http::HttpClient;
use crate::mapping::{MappingStore, PushOutcome};
use crate::models::{FabricCode, ImageRecord, ImageSource, MappingTable, MappingValue};
use crate::storage::{LocalPersistentCache, PersistentBackend, RemoteImageStore};
use crate::sync::{plan_sync, Reconcile, SyncReport, SyncStatus, SyncTracker};
use crate::util::is_http_url;
use crate::{Error, Result};

/// Batching knobs for [`ImageResolver::resolve_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub size: usize,
    pub delay: Duration,
}

impl BatchSettings {
    pub fn from_config(config: &ImageSyncConfig) -> Self {
        Self {
            size: config.batch_size.max(1),
            delay: config.batch_delay,
        }
    }
}

/// Summary of [`ImageResolver::bootstrap`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapReport {
    /// Persisted entries copied into the runtime cache.
    pub warmed: usize,
    /// Entries in the fetched mapping snapshot.
    pub mapped: usize,
}

/// Has-image totals for a set of codes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatusReport {
    pub total: usize,
    pub with_images: usize,
    pub without_images: usize,
    pub missing: Vec<FabricCode>,
}

/// Components the resolver is built from.
pub struct ResolverParts<H, B> {
    pub remote: RemoteImageStore<H>,
    pub mapping: MappingStore<H>,
    pub persisted: LocalPersistentCache<B>,
    pub runtime: RuntimeCache,
    pub bridge: Arc<UiCacheBridge>,
    pub clock: Arc<dyn Clock>,
    pub batch: BatchSettings,
    pub sync_interval: Duration,
}

struct Inner<H, B> {
    remote: RemoteImageStore<H>,
    mapping: MappingStore<H>,
    persisted: LocalPersistentCache<B>,
    runtime: RuntimeCache,
    /// Last mapping document seen from the mapping store.
    snapshot: Mutex<MappingTable>,
    bridge: Arc<UiCacheBridge>,
    tracker: SyncTracker,
    clock: Arc<dyn Clock>,
    batch: BatchSettings,
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Held across every mapping-store write and reconciliation pass so a
    /// slow bulk push cannot land after a newer single-entry add.
    write_gate: tokio::sync::Mutex<()>,
}

/// Cheap-to-clone handle; clones share all caches.
pub struct ImageResolver<H, B> {
    inner: Arc<Inner<H, B>>,
}

impl<H, B> Clone for ImageResolver<H, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: HttpClient, B: PersistentBackend> ImageResolver<H, B> {
    pub fn new(parts: ResolverParts<H, B>) -> Self {
        let tracker = SyncTracker::new(parts.sync_interval);
        Self {
            inner: Arc::new(Inner {
                remote: parts.remote,
                mapping: parts.mapping,
                persisted: parts.persisted,
                runtime: parts.runtime,
                snapshot: Mutex::new(MappingTable::new()),
                bridge: parts.bridge,
                tracker,
                clock: parts.clock,
                batch: parts.batch,
                background: Mutex::new(Vec::new()),
                write_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Wire every component from configuration around one HTTP client.
    pub fn from_config(
        config: &ImageSyncConfig,
        http: Arc<H>,
        backend: B,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let remote = RemoteImageStore::new(
            config.remote.clone(),
            Arc::clone(&http),
            config.probe_policy.clone(),
            config.probe_timeout,
        );
        let mapping = MappingStore::new(
            http,
            config.mapping_url.clone(),
            config.mapping_write_url.clone(),
        );
        Self::new(ResolverParts {
            remote,
            mapping,
            persisted: LocalPersistentCache::open(backend, Arc::clone(&clock)),
            runtime: RuntimeCache::new(config.cache_ttl, Arc::clone(&clock)),
            bridge: Arc::new(UiCacheBridge::new(Arc::clone(&clock))),
            clock,
            batch: BatchSettings::from_config(config),
            sync_interval: config.sync_interval,
        })
    }

    pub fn remote(&self) -> &RemoteImageStore<H> {
        &self.inner.remote
    }

    pub fn mapping(&self) -> &MappingStore<H> {
        &self.inner.mapping
    }

    pub fn persisted(&self) -> &LocalPersistentCache<B> {
        &self.inner.persisted
    }

    pub fn runtime(&self) -> &RuntimeCache {
        &self.inner.runtime
    }

    pub fn bridge(&self) -> &Arc<UiCacheBridge> {
        &self.inner.bridge
    }

    /// Warm the runtime cache from persisted entries and load the mapping
    /// snapshot once.
    pub async fn bootstrap(&self) -> BootstrapReport {
        let inner = &self.inner;
        let persisted = inner.persisted.entries();
        for (code, value) in &persisted {
            inner.runtime.insert_with_object_id(
                code,
                inner.remote.url_for(value),
                value.object_id().map(ToString::to_string),
            );
        }
        let snapshot = inner.mapping.fetch_all().await;
        let mapped = snapshot.len();
        *self.lock_snapshot() = snapshot;
        info!(warmed = persisted.len(), mapped, "Image resolver bootstrapped");
        BootstrapReport {
            warmed: persisted.len(),
            mapped,
        }
    }

    /// Resolve one code to a URL.
    pub async fn resolve(&self, code: &FabricCode) -> Option<String> {
        self.resolve_record(code).await.map(|record| record.url)
    }

    /// Resolve one code, reporting where the answer came from.
    ///
    /// Never fails: transport errors are logged and count as "not found".
    pub async fn resolve_record(&self, code: &FabricCode) -> Option<ImageRecord> {
        let inner = &self.inner;
        if let Some(entry) = inner.runtime.get(code.as_str()) {
            debug!(fabric_code = %code, "Runtime cache hit");
            return Some(ImageRecord {
                fabric_code: code.clone(),
                url: entry.url,
                object_id: entry.object_id,
                source: ImageSource::Runtime,
                timestamp: entry.timestamp,
            });
        }

        if let Some((value, source)) = self.known_mapping(code) {
            let url = inner.remote.url_for(&value);
            let object_id = value.object_id().map(ToString::to_string);
            let entry = inner
                .runtime
                .insert_with_object_id(code, url.clone(), object_id.clone());
            debug!(fabric_code = %code, ?source, "Resolved from mapping");
            return Some(ImageRecord {
                fabric_code: code.clone(),
                url,
                object_id,
                source,
                timestamp: entry.timestamp,
            });
        }

        let candidate = inner.remote.fabric_url(code, None);
        if !inner.remote.probe(&candidate).await.is_present() {
            return None;
        }
        let entry = inner.runtime.insert(code, candidate.clone());
        Some(ImageRecord {
            fabric_code: code.clone(),
            url: candidate,
            object_id: None,
            source: ImageSource::RemoteProbe,
            timestamp: entry.timestamp,
        })
    }

    /// Resolve many codes in throttled batches.
    ///
    /// Codes within a batch resolve concurrently; batches are separated by
    /// the configured delay. The result has exactly one entry per distinct
    /// input code.
    pub async fn resolve_batch(&self, codes: &[FabricCode]) -> HashMap<FabricCode, Option<String>> {
        let mut seen = HashSet::with_capacity(codes.len());
        let unique: Vec<&FabricCode> = codes.iter().filter(|code| seen.insert(*code)).collect();
        let batch = self.inner.batch;

        let mut results = HashMap::with_capacity(unique.len());
        for (index, chunk) in unique.chunks(batch.size).enumerate() {
            if index > 0 && !batch.delay.is_zero() {
                tokio::time::sleep(batch.delay).await;
            }
            let resolved = join_all(chunk.iter().map(|code| async move {
                ((*code).clone(), self.resolve(code).await)
            }))
            .await;
            results.extend(resolved);
        }
        debug!(
            requested = codes.len(),
            resolved = results.values().filter(|url| url.is_some()).count(),
            "Batch resolution finished"
        );
        results
    }

    /// Record an uploaded image for a code.
    ///
    /// Runtime and persisted caches are overwritten before this returns, so a
    /// following [`resolve`](Self::resolve) answers without network access.
    /// The mapping push runs in the background; its failures are logged.
    pub fn record_upload(
        &self,
        code: &FabricCode,
        url: &str,
        object_id: Option<&str>,
    ) -> ImageRecord {
        let value = object_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(
                || MappingValue::LiteralUrl(url.to_string()),
                |id| MappingValue::ObjectId(id.to_string()),
            );
        self.record_local(code, url, value, ImageAction::Uploaded)
    }

    /// Record an arbitrary image URL for a code; the URL is both the cached
    /// value and the mapping value.
    pub fn record_manual_override(&self, code: &FabricCode, literal_url: &str) -> Result<ImageRecord> {
        let literal_url = literal_url.trim();
        if !is_http_url(literal_url) {
            return Err(Error::InvalidInput(format!(
                "Manual image URL for {code} must start with http:// or https://"
            )));
        }
        Ok(self.record_local(
            code,
            literal_url,
            MappingValue::LiteralUrl(literal_url.to_string()),
            ImageAction::ManualOverride,
        ))
    }

    /// Upload bytes to the remote store and record the result.
    ///
    /// Upload failures propagate and leave every cache untouched.
    pub async fn upload(
        &self,
        code: &FabricCode,
        bytes: &[u8],
        file_name: Option<&str>,
    ) -> Result<ImageRecord> {
        let result = self.inner.remote.upload(code, bytes, file_name).await?;
        Ok(self.record_upload(code, &result.url, Some(&result.object_id)))
    }

    fn record_local(
        &self,
        code: &FabricCode,
        url: &str,
        value: MappingValue,
        action: ImageAction,
    ) -> ImageRecord {
        let inner = &self.inner;
        let object_id = value.object_id().map(ToString::to_string);
        let entry = inner
            .runtime
            .insert_with_object_id(code, url, object_id.clone());
        if let Err(error) = inner.persisted.record_local(code, value.clone()) {
            warn!(fabric_code = %code, %error, "Failed to persist image mapping; kept in memory");
        }
        inner.bridge.apply_change(code, Some(url), action);
        info!(fabric_code = %code, url, ?action, "Recorded fabric image");

        let record = ImageRecord {
            fabric_code: code.clone(),
            url: url.to_string(),
            object_id,
            source: ImageSource::Runtime,
            timestamp: entry.timestamp,
        };
        self.spawn_push(code.clone(), value);
        record
    }

    fn spawn_push(&self, code: FabricCode, value: MappingValue) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(fabric_code = %code, "No async runtime; mapping stays pending until the next sync");
            return;
        };
        let this = self.clone();
        let task = runtime.spawn(async move {
            this.push_after_write(&code, &value).await;
        });
        let mut background = self.lock_background();
        background.retain(|handle| !handle.is_finished());
        background.push(task);
    }

    async fn push_after_write(&self, code: &FabricCode, value: &MappingValue) {
        let inner = &self.inner;
        if !inner.mapping.is_enabled() && !inner.mapping.is_writable() {
            return;
        }
        {
            let _gate = inner.write_gate.lock().await;
            match inner.mapping.try_add(code, value).await {
                Ok(PushOutcome::Applied { .. }) => {
                    if let Err(error) = inner.persisted.mark_pushed([(code, value)]) {
                        warn!(fabric_code = %code, %error, "Failed to clear pending flag");
                    }
                    self.lock_snapshot().insert(code.clone(), value.clone());
                }
                Ok(PushOutcome::Skipped) => {}
                Err(error) => {
                    warn!(fabric_code = %code, %error, "Mapping push after write failed; will retry on next sync");
                }
            }
        }
        if let Err(error) = self.sync_with_cloud().await {
            warn!(%error, "Post-write mapping sync failed");
        }
    }

    /// Wait for background pushes spawned by writes.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock_background());
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(error) = handle.await {
                    warn!(%error, "Background mapping task failed");
                }
            }
        }
    }

    /// Empty the runtime and persisted caches. The mapping store and remote
    /// objects are untouched.
    pub fn clear_cache(&self) {
        let inner = &self.inner;
        inner.runtime.clear();
        if let Err(error) = inner.persisted.clear() {
            warn!(%error, "Failed to remove persisted image cache");
        }
        inner.bridge.notify_cache_cleared();
        info!("Cleared runtime and persisted image caches");
    }

    /// Drop the runtime entry for a code and resolve it again.
    pub async fn refresh(&self, code: &FabricCode) -> Option<String> {
        self.inner.runtime.remove(code.as_str());
        self.resolve(code).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.runtime.stats()
    }

    /// Resolve codes and count how many have images.
    pub async fn image_status_report(&self, codes: &[FabricCode]) -> ImageStatusReport {
        let resolved = self.resolve_batch(codes).await;
        let mut missing: Vec<FabricCode> = resolved
            .iter()
            .filter(|(_, url)| url.is_none())
            .map(|(code, _)| code.clone())
            .collect();
        missing.sort();
        ImageStatusReport {
            total: resolved.len(),
            with_images: resolved.len() - missing.len(),
            without_images: missing.len(),
            missing,
        }
    }

    /// One reconciliation pass between the persisted cache and the mapping
    /// store. Entries missing or locally newer are pushed; remote entries
    /// missing or older locally are merged into the persisted and runtime
    /// caches.
    pub async fn sync_with_cloud(&self) -> Result<SyncReport> {
        let inner = &self.inner;
        if !inner.mapping.is_enabled() {
            inner.tracker.offline();
            return Ok(SyncReport::default());
        }
        let _gate = inner.write_gate.lock().await;
        inner.tracker.begin();
        match self.reconcile_once().await {
            Ok(report) => {
                inner.tracker.succeed(inner.clock.now_millis(), report);
                Ok(report)
            }
            Err(error) => {
                inner.tracker.fail(error.to_string());
                Err(error)
            }
        }
    }

    async fn reconcile_once(&self) -> Result<SyncReport> {
        let inner = &self.inner;
        let remote = inner.mapping.try_fetch_all().await?;
        let local = inner.persisted.entries();
        let plan = plan_sync(&local, &remote, &inner.persisted.pending());

        let mut snapshot = remote;
        let mut local_to_cloud = 0;
        if !plan.push.is_empty() {
            if let PushOutcome::Applied { updated } = inner.mapping.try_push(&plan.push).await? {
                local_to_cloud = updated;
                inner.persisted.mark_pushed(&plan.push)?;
                snapshot.extend(plan.push.clone());
            }
        }
        if !plan.confirmed.is_empty() {
            inner.persisted.mark_pushed(&plan.confirmed)?;
        }

        // Local writes recorded while the requests above were in flight win.
        let merged = inner.persisted.merge_remote(&plan.merge, &local)?;
        for (code, value) in &merged {
            let url = inner.remote.url_for(value);
            let object_id = value.object_id().map(ToString::to_string);
            inner
                .runtime
                .insert_with_object_id(code, url.clone(), object_id);
            inner
                .bridge
                .apply_change(code, Some(&url), ImageAction::Merged);
        }
        *self.lock_snapshot() = snapshot;

        let report = SyncReport {
            local_to_cloud,
            cloud_to_local: merged.len(),
        };
        info!(
            local_to_cloud = report.local_to_cloud,
            cloud_to_local = report.cloud_to_local,
            "Mapping sync finished"
        );
        Ok(report)
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.tracker.snapshot(self.inner.clock.now_millis())
    }

    fn known_mapping(&self, code: &FabricCode) -> Option<(MappingValue, ImageSource)> {
        if let Some(value) = self.inner.persisted.get(code.as_str()) {
            return Some((value, ImageSource::Persisted));
        }
        self.lock_snapshot()
            .get(code)
            .cloned()
            .map(|value| (value, ImageSource::Mapping))
    }

    fn lock_snapshot(&self) -> MutexGuard<'_, MappingTable> {
        self.inner
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_background(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: HttpClient, B: PersistentBackend> Reconcile for ImageResolver<H, B> {
    async fn reconcile(&self) -> Result<SyncReport> {
        self.sync_with_cloud().await
    }
}

#[cfg(test)]
mod tests;
