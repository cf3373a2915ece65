//! Propagates image changes into UI-facing collections.
//!
//! Every change is applied as patch-then-notify: matching items in every
//! stored collection get the new image immediately, dependent views are
//! marked stale, and a change event goes to registered listeners and
//! broadcast subscribers.
//!
//! Patches carry a monotonic version. A background refresh takes a
//! [`RefreshToken`] before it starts fetching; when it completes, every patch
//! newer than its token is re-applied on top of the fetched items, so a
//! refresh that started before an upload cannot clobber it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::models::FabricCode;

/// Query key of the main fabric list.
pub const FABRICS_QUERY: &str = "fabrics";

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageAction {
    Uploaded,
    ManualOverride,
    /// Cloud mapping merged locally during sync.
    Merged,
    CacheCleared,
}

/// Event emitted after each change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageChange {
    /// `None` for changes that affect every code.
    pub fabric_code: Option<FabricCode>,
    pub action: ImageAction,
    pub url: Option<String>,
    pub timestamp: i64,
    pub version: u64,
}

/// UI-facing row carrying an image field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricItem {
    pub code: FabricCode,
    pub image: Option<String>,
}

impl FabricItem {
    pub const fn new(code: FabricCode, image: Option<String>) -> Self {
        Self { code, image }
    }
}

/// Aggregate views derived from collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum StaleView {
    FabricList,
    FabricStats,
    FabricImages,
}

impl StaleView {
    pub const ALL: [Self; 3] = [Self::FabricList, Self::FabricStats, Self::FabricImages];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStats {
    pub with_images: usize,
    pub without_images: usize,
    pub total: usize,
}

/// Version observed when a background refresh started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefreshToken(u64);

#[derive(Debug, Clone)]
struct Patch {
    url: Option<String>,
    version: u64,
}

#[derive(Debug, Default)]
struct BridgeState {
    version: u64,
    collections: BTreeMap<String, Vec<FabricItem>>,
    patches: HashMap<FabricCode, Patch>,
    stale: BTreeSet<StaleView>,
    in_flight: BTreeMap<u64, usize>,
}

impl BridgeState {
    fn overlay(&self, items: &mut [FabricItem], newer_than: Option<u64>) -> usize {
        let mut applied = 0;
        for item in items {
            let Some(patch) = self.patches.get(&item.code) else {
                continue;
            };
            if newer_than.is_some_and(|token| patch.version <= token) {
                continue;
            }
            if item.image != patch.url {
                item.image.clone_from(&patch.url);
                applied += 1;
            }
        }
        applied
    }

    fn finish_refresh(&mut self, token: u64) {
        if let Some(count) = self.in_flight.get_mut(&token) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&token);
            }
        }
        let threshold = self
            .in_flight
            .keys()
            .next()
            .map_or(token, |oldest| (*oldest).min(token));
        self.patches.retain(|_, patch| patch.version > threshold);
    }
}

type Listener = Arc<dyn Fn(&ImageChange) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
}

/// Handle returned by [`UiCacheBridge::on_images_changed`].
///
/// Dropping it keeps the listener registered; call [`Unsubscribe::unsubscribe`].
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Unsubscribe {
    id: u64,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl Unsubscribe {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .remove(&self.id)
            .is_some();
        removed
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe").field("id", &self.id).finish()
    }
}

pub struct UiCacheBridge {
    state: Mutex<BridgeState>,
    listeners: Arc<Mutex<ListenerRegistry>>,
    updates_tx: broadcast::Sender<ImageChange>,
    clock: Arc<dyn Clock>,
}

impl UiCacheBridge {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(BridgeState::default()),
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
            updates_tx,
            clock,
        }
    }

    /// Store a collection under a query key. Live patches are overlaid.
    pub fn set_collection(&self, key: impl Into<String>, mut items: Vec<FabricItem>) {
        let mut state = self.lock_state();
        state.overlay(&mut items, None);
        state.collections.insert(key.into(), items);
    }

    pub fn collection(&self, key: &str) -> Option<Vec<FabricItem>> {
        self.lock_state().collections.get(key).cloned()
    }

    pub fn remove_collection(&self, key: &str) -> bool {
        self.lock_state().collections.remove(key).is_some()
    }

    /// Patch every collection holding `code`, mark dependent views stale,
    /// then notify.
    pub fn apply_change(
        &self,
        code: &FabricCode,
        url: Option<&str>,
        action: ImageAction,
    ) -> ImageChange {
        let version = {
            let mut state = self.lock_state();
            state.version += 1;
            let version = state.version;
            let url = url.map(ToString::to_string);
            let mut patched = 0;
            for items in state.collections.values_mut() {
                for item in items.iter_mut().filter(|item| item.code == *code) {
                    item.image.clone_from(&url);
                    patched += 1;
                }
            }
            state.patches.insert(code.clone(), Patch { url, version });
            state.stale.extend(StaleView::ALL);
            debug!(fabric_code = %code, ?action, version, patched, "Patched UI collections");
            version
        };

        let change = ImageChange {
            fabric_code: Some(code.clone()),
            action,
            url: url.map(ToString::to_string),
            timestamp: self.clock.now_millis(),
            version,
        };
        self.emit(&change);
        change
    }

    /// Full invalidation after caches were cleared.
    pub fn notify_cache_cleared(&self) -> ImageChange {
        let version = {
            let mut state = self.lock_state();
            state.version += 1;
            state.stale.extend(StaleView::ALL);
            state.version
        };
        let change = ImageChange {
            fabric_code: None,
            action: ImageAction::CacheCleared,
            url: None,
            timestamp: self.clock.now_millis(),
            version,
        };
        self.emit(&change);
        change
    }

    /// Call before fetching a collection in the background.
    pub fn begin_refresh(&self) -> RefreshToken {
        let mut state = self.lock_state();
        let token = state.version;
        *state.in_flight.entry(token).or_insert(0) += 1;
        RefreshToken(token)
    }

    /// Store refreshed items, re-applying every patch newer than `token`.
    /// Returns how many items were corrected.
    pub fn complete_refresh(
        &self,
        key: impl Into<String>,
        mut items: Vec<FabricItem>,
        token: RefreshToken,
    ) -> usize {
        let key = key.into();
        let mut state = self.lock_state();
        let reapplied = state.overlay(&mut items, Some(token.0));
        if reapplied > 0 {
            debug!(key = %key, reapplied, "Re-applied newer image patches over refresh");
        }
        state.collections.insert(key, items);
        state.finish_refresh(token.0);
        reapplied
    }

    /// Abandon a refresh without storing anything.
    pub fn cancel_refresh(&self, token: RefreshToken) {
        self.lock_state().finish_refresh(token.0);
    }

    /// Drain the set of views that need recomputation.
    pub fn take_stale(&self) -> Vec<StaleView> {
        let mut state = self.lock_state();
        std::mem::take(&mut state.stale).into_iter().collect()
    }

    pub fn is_stale(&self, view: StaleView) -> bool {
        self.lock_state().stale.contains(&view)
    }

    /// Recompute has-image counts for a collection; clears the stats view's
    /// stale flag.
    pub fn image_stats(&self, key: &str) -> Option<ImageStats> {
        let mut state = self.lock_state();
        let items = state.collections.get(key)?;
        let with_images = items
            .iter()
            .filter(|item| item.image.as_deref().is_some_and(|url| !url.is_empty()))
            .count();
        let stats = ImageStats {
            with_images,
            without_images: items.len() - with_images,
            total: items.len(),
        };
        state.stale.remove(&StaleView::FabricStats);
        Some(stats)
    }

    pub fn version(&self) -> u64 {
        self.lock_state().version
    }

    /// Async consumers can follow changes through a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ImageChange> {
        self.updates_tx.subscribe()
    }

    pub fn on_images_changed(
        &self,
        listener: impl Fn(&ImageChange) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let mut registry = self.lock_listeners();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.insert(id, Arc::new(listener));
        Unsubscribe {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().listeners.len()
    }

    fn emit(&self, change: &ImageChange) {
        let listeners: Vec<Listener> = self.lock_listeners().listeners.values().cloned().collect();
        for listener in listeners {
            listener(change);
        }
        if let Err(error) = self.updates_tx.send(change.clone()) {
            trace!(%error, "no subscribers for image change");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, ListenerRegistry> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for UiCacheBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiCacheBridge")
            .field("version", &self.version())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}
