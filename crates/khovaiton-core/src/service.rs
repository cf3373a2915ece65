//! Facade used by the CLI, the API and any UI shell.
//!
//! Accepts raw strings at the edge, validates them into [`FabricCode`]s and
//! forwards to the [`ImageResolver`]. Auto-sync lifetime is tied to the
//! service: dropping the last clone stops the scheduled task.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::bridge::{ImageChange, UiCacheBridge, Unsubscribe};
use crate::cache::CacheStats;
use crate::clock::{Clock, SystemClock};
use crate::config::ImageSyncConfig;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::models::{FabricCode, ImageRecord};
use crate::resolver::{BootstrapReport, ImageResolver, ImageStatusReport};
use crate::storage::PersistentBackend;
use crate::sync::{AutoSync, SyncReport, SyncStatus};
use crate::Result;

/// Thread-safe, cheap-to-clone image service.
pub struct FabricImageService<H, B> {
    resolver: ImageResolver<H, B>,
    auto_sync: Arc<AutoSync<ImageResolver<H, B>>>,
}

impl<H, B> Clone for FabricImageService<H, B> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            auto_sync: Arc::clone(&self.auto_sync),
        }
    }
}

impl<B: PersistentBackend> FabricImageService<ReqwestHttpClient, B> {
    /// Production wiring: reqwest transport and the wall clock.
    pub fn from_config(config: &ImageSyncConfig, backend: B) -> Result<Self> {
        let http = Arc::new(ReqwestHttpClient::new()?);
        Ok(Self::new(config, http, backend, Arc::new(SystemClock)))
    }
}

impl<H: HttpClient, B: PersistentBackend> FabricImageService<H, B> {
    pub fn new(config: &ImageSyncConfig, http: Arc<H>, backend: B, clock: Arc<dyn Clock>) -> Self {
        let resolver = ImageResolver::from_config(config, http, backend, clock);
        Self::from_resolver(resolver, config)
    }

    pub fn from_resolver(resolver: ImageResolver<H, B>, config: &ImageSyncConfig) -> Self {
        let auto_sync = AutoSync::new(resolver.clone(), config.sync_interval);
        Self {
            resolver,
            auto_sync: Arc::new(auto_sync),
        }
    }

    pub fn resolver(&self) -> &ImageResolver<H, B> {
        &self.resolver
    }

    pub fn bridge(&self) -> &Arc<UiCacheBridge> {
        self.resolver.bridge()
    }

    pub async fn bootstrap(&self) -> BootstrapReport {
        self.resolver.bootstrap().await
    }

    /// Resolve one code. Only an invalid code is an error; "no image" is
    /// `Ok(None)`.
    pub async fn get_image_url(&self, code: &str) -> Result<Option<String>> {
        let code = FabricCode::new(code)?;
        Ok(self.resolver.resolve(&code).await)
    }

    /// Resolve many codes. Every input string gets an entry; codes that fail
    /// validation map to `None`.
    pub async fn get_image_urls_batch<S: AsRef<str>>(
        &self,
        codes: &[S],
    ) -> HashMap<String, Option<String>> {
        let mut results = HashMap::with_capacity(codes.len());
        let mut valid = Vec::with_capacity(codes.len());
        for raw in codes {
            match FabricCode::new(raw.as_ref()) {
                Ok(code) => valid.push(code),
                Err(error) => {
                    debug!(code = raw.as_ref(), %error, "Skipping invalid fabric code");
                    results.insert(raw.as_ref().to_string(), None);
                }
            }
        }
        let resolved = self.resolver.resolve_batch(&valid).await;
        results.extend(
            resolved
                .into_iter()
                .map(|(code, url)| (code.into_inner(), url)),
        );
        results
    }

    /// Upload image bytes and record the resulting object for the code.
    pub async fn record_upload(
        &self,
        code: &str,
        bytes: &[u8],
        file_name: Option<&str>,
    ) -> Result<ImageRecord> {
        let code = FabricCode::new(code)?;
        self.resolver.upload(&code, bytes, file_name).await
    }

    /// Record an image that was uploaded elsewhere.
    pub fn record_uploaded_url(
        &self,
        code: &str,
        url: &str,
        object_id: Option<&str>,
    ) -> Result<ImageRecord> {
        let code = FabricCode::new(code)?;
        Ok(self.resolver.record_upload(&code, url, object_id))
    }

    pub fn record_manual_override(&self, code: &str, url: &str) -> Result<ImageRecord> {
        let code = FabricCode::new(code)?;
        self.resolver.record_manual_override(&code, url)
    }

    pub async fn refresh(&self, code: &str) -> Result<Option<String>> {
        let code = FabricCode::new(code)?;
        Ok(self.resolver.refresh(&code).await)
    }

    pub async fn image_status_report<S: AsRef<str>>(&self, codes: &[S]) -> Result<ImageStatusReport> {
        let codes = codes
            .iter()
            .map(|code| FabricCode::new(code.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.resolver.image_status_report(&codes).await)
    }

    pub fn on_images_changed(
        &self,
        listener: impl Fn(&ImageChange) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.resolver.bridge().on_images_changed(listener)
    }

    pub fn clear_cache(&self) {
        self.resolver.clear_cache();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.resolver.cache_stats()
    }

    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.resolver.sync_with_cloud().await
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.resolver.sync_status()
    }

    pub fn start_auto_sync(&self) -> bool {
        self.auto_sync.start()
    }

    pub fn stop_auto_sync(&self) -> bool {
        self.auto_sync.stop()
    }

    pub fn is_auto_syncing(&self) -> bool {
        self.auto_sync.is_running()
    }

    /// Wait for background mapping pushes started by writes.
    pub async fn settle(&self) {
        self.resolver.settle().await;
    }
}
