use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};
use pretty_assertions::assert_eq;

use super::*;
use crate::bridge::{FabricItem, FABRICS_QUERY};
use crate::clock::ManualClock;
use crate::config::ProbePolicy;
use crate::http::{HttpResponse, TransportError};
use crate::state::SyncState;
use crate::storage::{MemoryBackend, STORAGE_KEY};
use crate::testing::{
    fabric_url, manual_clock, object_url, test_config, test_config_with_mapping, FakeHttp,
};

type TestResolver = ImageResolver<FakeHttp, Arc<MemoryBackend>>;

struct Harness {
    http: Arc<FakeHttp>,
    clock: Arc<ManualClock>,
    backend: Arc<MemoryBackend>,
    resolver: TestResolver,
}

fn harness(config: &ImageSyncConfig) -> Harness {
    harness_with_backend(config, Arc::new(MemoryBackend::new()))
}

fn harness_with_backend(config: &ImageSyncConfig, backend: Arc<MemoryBackend>) -> Harness {
    let http = FakeHttp::new();
    let clock = manual_clock();
    let resolver = ImageResolver::from_config(
        config,
        Arc::clone(&http),
        Arc::clone(&backend),
        clock.clone(),
    );
    Harness {
        http,
        clock,
        backend,
        resolver,
    }
}

fn code(value: &str) -> FabricCode {
    FabricCode::new(value).unwrap()
}

fn png_bytes() -> Vec<u8> {
    let image = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_fn(6, 4, |_x, _y| Rgba([9, 9, 9, 255]));
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image)
        .write_to(&mut cursor, ImageFormat::Png)
        .unwrap();
    cursor.into_inner()
}

#[tokio::test]
async fn runtime_cache_wins_over_differing_mapping() {
    let h = harness(&test_config_with_mapping());
    h.http.set_remote_mapping("A", "img-remote");
    h.resolver.bootstrap().await;
    h.resolver.runtime().insert(&code("A"), "https://cdn.example.com/cached.jpg");

    let record = h.resolver.resolve_record(&code("A")).await.unwrap();

    assert_eq!(record.url, "https://cdn.example.com/cached.jpg");
    assert_eq!(record.source, ImageSource::Runtime);
    assert_eq!(h.http.head_count(), 0);
}

#[tokio::test]
async fn mapping_snapshot_resolves_without_probe() {
    let h = harness(&test_config_with_mapping());
    h.http.set_remote_mapping("A", "fabric_images/a1");
    h.http.set_remote_mapping("B", "https://cdn.example.com/b.jpg");
    let report = h.resolver.bootstrap().await;
    assert_eq!(report.mapped, 2);

    let a = h.resolver.resolve_record(&code("A")).await.unwrap();
    assert_eq!(a.url, object_url("fabric_images/a1"));
    assert_eq!(a.object_id.as_deref(), Some("fabric_images/a1"));
    assert_eq!(a.source, ImageSource::Mapping);

    let b = h.resolver.resolve_record(&code("B")).await.unwrap();
    assert_eq!(b.url, "https://cdn.example.com/b.jpg");
    assert_eq!(b.object_id, None);
    assert_eq!(h.http.head_count(), 0);
}

#[tokio::test]
async fn expired_runtime_entry_is_revalidated() {
    let h = harness(&test_config());
    h.resolver.runtime().insert(&code("A"), "https://cdn.example.com/stale.jpg");
    h.http.add_existing(&fabric_url("A"));

    h.clock.advance(Duration::from_secs(5 * 60));
    let record = h.resolver.resolve_record(&code("A")).await.unwrap();

    assert_eq!(record.url, fabric_url("A"));
    assert_eq!(record.source, ImageSource::RemoteProbe);
    assert_eq!(h.http.head_count(), 1);
}

#[tokio::test]
async fn upload_then_resolve_needs_no_network() {
    let h = harness(&test_config());
    let url = object_url("img123");

    h.resolver.record_upload(&code("AB-100"), &url, Some("img123"));

    let record = h.resolver.resolve_record(&code("AB-100")).await.unwrap();
    assert_eq!(record.url, url);
    assert_eq!(record.source, ImageSource::Runtime);
    assert_eq!(record.object_id.as_deref(), Some("img123"));
    assert_eq!(h.http.request_count(), 0);
}

#[tokio::test]
async fn persisted_record_survives_runtime_clear() {
    let h = harness(&test_config());
    let url = object_url("img123");
    h.resolver.record_upload(&code("AB-100"), &url, Some("img123"));
    assert_eq!(h.resolver.resolve(&code("AB-100")).await.as_deref(), Some(url.as_str()));

    h.resolver.runtime().clear();
    let record = h.resolver.resolve_record(&code("AB-100")).await.unwrap();

    assert_eq!(record.url, url);
    assert_eq!(record.source, ImageSource::Persisted);
    assert_eq!(record.object_id.as_deref(), Some("img123"));
    assert_eq!(h.http.head_count(), 0);
    assert!(h.backend.load(STORAGE_KEY).unwrap().is_some());
}

#[tokio::test]
async fn unknown_code_returns_none_after_one_probe() {
    let h = harness(&test_config());

    assert_eq!(h.resolver.resolve(&code("ZZZZZ")).await, None);
    assert_eq!(h.http.head_count(), 1);
    assert_eq!(h.http.requests()[0].url, fabric_url("ZZZZZ"));
}

#[tokio::test]
async fn probe_hit_is_cached() {
    let h = harness(&test_config());
    h.http.add_existing(&fabric_url("A"));

    assert_eq!(h.resolver.resolve(&code("A")).await, Some(fabric_url("A")));
    assert_eq!(h.resolver.resolve(&code("A")).await, Some(fabric_url("A")));
    assert_eq!(h.http.head_count(), 1);
}

#[tokio::test]
async fn batch_returns_one_entry_per_code_despite_failures() {
    let mut config = test_config();
    config.probe_policy = ProbePolicy::strict();
    let h = harness(&config);
    h.http.add_existing(&fabric_url("A"));
    h.http.add_existing(&fabric_url("C"));
    h.http.fail_head(
        &fabric_url("B"),
        TransportError::Connect("connection reset".to_string()),
    );

    let codes = vec![code("A"), code("B"), code("C"), code("A"), code("D")];
    let results = h.resolver.resolve_batch(&codes).await;

    assert_eq!(results.len(), 4);
    assert_eq!(results[&code("A")], Some(fabric_url("A")));
    assert_eq!(results[&code("B")], None);
    assert_eq!(results[&code("C")], Some(fabric_url("C")));
    assert_eq!(results[&code("D")], None);
    assert_eq!(h.http.head_count(), 4);
}

#[tokio::test]
async fn allowlisted_transport_failure_is_assumed_present() {
    let h = harness(&test_config());
    h.http.fail_head(
        &fabric_url("CORS"),
        TransportError::Other("preflight rejected".to_string()),
    );

    assert_eq!(
        h.resolver.resolve(&code("CORS")).await,
        Some(fabric_url("CORS"))
    );
}

#[tokio::test(start_paused = true)]
async fn batch_probes_concurrently_and_throttles_between_batches() {
    let mut config = test_config();
    config.batch_delay = Duration::from_millis(100);
    let h = harness(&config);
    h.http.set_head_delay(Duration::from_secs(1));
    let codes: Vec<FabricCode> = (0..25).map(|index| code(&format!("F-{index}"))).collect();
    for fabric in &codes {
        h.http.add_existing(&fabric_url(fabric.as_str()));
    }

    let started = tokio::time::Instant::now();
    let results = h.resolver.resolve_batch(&codes).await;
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 25);
    assert!(results.values().all(Option::is_some));
    // Three batches of one second each plus two delays; sequential probing would take 25s.
    assert!(elapsed >= Duration::from_millis(3_200), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn manual_override_records_literal_url() {
    let h = harness(&test_config());

    let record = h
        .resolver
        .record_manual_override(&code("A"), " https://cdn.example.com/a.jpg ")
        .unwrap();
    assert_eq!(record.url, "https://cdn.example.com/a.jpg");
    assert_eq!(record.object_id, None);
    assert_eq!(
        h.resolver.persisted().get("A"),
        Some(MappingValue::LiteralUrl("https://cdn.example.com/a.jpg".to_string()))
    );

    let err = h
        .resolver
        .record_manual_override(&code("A"), "cdn.example.com/a.jpg")
        .unwrap_err();
    match err {
        Error::InvalidInput(message) => assert!(message.contains("http")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn record_upload_pushes_mapping_in_background() {
    let h = harness(&test_config_with_mapping());

    h.resolver
        .record_upload(&code("AB-100"), &object_url("img123"), Some("img123"));
    h.resolver.settle().await;

    assert_eq!(
        h.http.remote_mappings().get("AB-100").map(String::as_str),
        Some("img123")
    );
    assert!(h.resolver.persisted().pending().is_empty());
    assert_eq!(h.resolver.sync_status().state, SyncState::Synced);
}

#[tokio::test]
async fn failed_push_is_absorbed_and_retried_by_next_sync() {
    let h = harness(&test_config_with_mapping());
    h.http.set_mapping_writes_fail(true);

    let record = h
        .resolver
        .record_upload(&code("AB-100"), &object_url("img123"), Some("img123"));
    h.resolver.settle().await;

    assert_eq!(record.url, object_url("img123"));
    assert_eq!(h.resolver.persisted().pending().len(), 1);
    assert_eq!(h.resolver.sync_status().state, SyncState::Error);

    h.http.set_mapping_writes_fail(false);
    let report = h.resolver.sync_with_cloud().await.unwrap();
    assert_eq!(report.local_to_cloud, 1);
    assert!(h.resolver.persisted().pending().is_empty());
}

#[tokio::test]
async fn sync_converges_local_entries_to_mapping_store() {
    let h = harness(&test_config_with_mapping());
    h.resolver
        .persisted()
        .record_local(&code("X"), MappingValue::from("img-x"))
        .unwrap();

    let report = h.resolver.sync_with_cloud().await.unwrap();
    assert_eq!(
        report,
        SyncReport {
            local_to_cloud: 1,
            cloud_to_local: 0
        }
    );

    let fetched = h.resolver.mapping().fetch_all().await;
    assert_eq!(fetched.get("X"), Some(&MappingValue::from("img-x")));
}

#[tokio::test]
async fn sync_merges_remote_entries_and_notifies() {
    let h = harness(&test_config_with_mapping());
    h.http.set_remote_mapping("R1", "img-r1");
    let mut updates = h.resolver.bridge().subscribe();

    let report = h.resolver.sync_with_cloud().await.unwrap();
    assert_eq!(report.cloud_to_local, 1);
    assert_eq!(
        h.resolver.persisted().get("R1"),
        Some(MappingValue::from("img-r1"))
    );

    let change = updates.recv().await.unwrap();
    assert_eq!(change.fabric_code, Some(code("R1")));
    assert_eq!(change.action, ImageAction::Merged);

    assert_eq!(
        h.resolver.resolve(&code("R1")).await,
        Some(object_url("img-r1"))
    );
    assert_eq!(h.http.head_count(), 0);
}

#[tokio::test]
async fn remote_wins_for_entries_not_written_locally_since_last_push() {
    let h = harness(&test_config_with_mapping());
    h.resolver
        .persisted()
        .merge_remote(
            &MappingTable::from([(code("A"), MappingValue::from("img-old"))]),
            &MappingTable::new(),
        )
        .unwrap();
    h.http.set_remote_mapping("A", "img-new");

    let report = h.resolver.sync_with_cloud().await.unwrap();

    assert_eq!(report.cloud_to_local, 1);
    assert_eq!(report.local_to_cloud, 0);
    assert_eq!(
        h.resolver.persisted().get("A"),
        Some(MappingValue::from("img-new"))
    );
}

#[tokio::test(start_paused = true)]
async fn upload_during_slow_sync_push_is_not_overwritten() {
    let h = harness(&test_config_with_mapping());
    let x = code("X");
    h.resolver
        .persisted()
        .record_local(&x, MappingValue::from("v1"))
        .unwrap();
    h.http.set_update_delay(Duration::from_millis(100));

    let syncing = tokio::spawn({
        let resolver = h.resolver.clone();
        async move { resolver.sync_with_cloud().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.resolver.record_upload(&x, &object_url("v2"), Some("v2"));

    syncing.await.unwrap().unwrap();
    h.resolver.settle().await;
    h.resolver.sync_with_cloud().await.unwrap();

    assert_eq!(
        h.http.remote_mappings().get("X").map(String::as_str),
        Some("v2")
    );
    assert_eq!(h.resolver.persisted().get("X"), Some(MappingValue::from("v2")));
    assert!(h.resolver.persisted().pending().is_empty());
    assert_eq!(h.resolver.resolve(&x).await, Some(object_url("v2")));
}

#[tokio::test(start_paused = true)]
async fn local_write_during_sync_is_not_merged_over() {
    let h = harness(&test_config_with_mapping());
    let r = code("R");
    h.resolver
        .persisted()
        .merge_remote(
            &MappingTable::from([(r.clone(), MappingValue::from("img-old"))]),
            &MappingTable::new(),
        )
        .unwrap();
    h.resolver
        .persisted()
        .record_local(&code("Y"), MappingValue::from("img-y"))
        .unwrap();
    h.http.set_remote_mapping("R", "img-remote");
    h.http.set_update_delay(Duration::from_millis(100));

    let syncing = tokio::spawn({
        let resolver = h.resolver.clone();
        async move { resolver.sync_with_cloud().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let manual = "https://cdn.example.com/manual.jpg";
    h.resolver.record_manual_override(&r, manual).unwrap();

    let report = syncing.await.unwrap().unwrap();
    assert_eq!(report.cloud_to_local, 0);
    assert_eq!(h.resolver.persisted().get("R"), Some(MappingValue::from(manual)));
    assert_eq!(h.resolver.resolve(&r).await.as_deref(), Some(manual));

    h.resolver.settle().await;
    assert_eq!(
        h.http.remote_mappings().get("R").map(String::as_str),
        Some(manual)
    );
    assert!(h.resolver.persisted().pending().is_empty());
}

#[tokio::test]
async fn sync_failure_is_reported_in_status() {
    let h = harness(&test_config_with_mapping());
    h.http.set_mapping_reads_fail(true);

    assert!(h.resolver.sync_with_cloud().await.is_err());
    let status = h.resolver.sync_status();
    assert_eq!(status.state, SyncState::Error);
    assert_eq!(status.failures, 1);
    assert!(status.last_error.unwrap().contains("mapping service down"));
}

#[tokio::test]
async fn sync_without_mapping_store_is_offline_noop() {
    let h = harness(&test_config());
    let report = h.resolver.sync_with_cloud().await.unwrap();
    assert_eq!(report, SyncReport::default());
    assert_eq!(h.resolver.sync_status().state, SyncState::Offline);
    assert_eq!(h.http.request_count(), 0);
}

#[tokio::test]
async fn clear_cache_keeps_mapping_store() {
    let h = harness(&test_config_with_mapping());
    h.resolver
        .record_upload(&code("AB-100"), &object_url("img123"), Some("img123"));
    h.resolver.settle().await;

    h.resolver.clear_cache();

    assert!(h.resolver.runtime().is_empty());
    assert!(h.resolver.persisted().is_empty());
    assert_eq!(h.backend.load(STORAGE_KEY).unwrap(), None);
    assert_eq!(h.http.remote_mappings().len(), 1);

    let record = h.resolver.resolve_record(&code("AB-100")).await.unwrap();
    assert_eq!(record.source, ImageSource::Mapping);
}

#[tokio::test]
async fn upload_failure_leaves_caches_untouched() {
    let h = harness(&test_config());
    h.http
        .set_upload_response(HttpResponse::new(502, r#"{"error":{"message":"bad gateway"}}"#));

    let err = h
        .resolver
        .upload(&code("AB-100"), &png_bytes(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Upload(_)));
    assert!(h.resolver.runtime().is_empty());
    assert!(h.resolver.persisted().is_empty());
}

#[tokio::test]
async fn upload_records_result_and_patches_ui() {
    let h = harness(&test_config());
    h.http.set_upload_response(HttpResponse::new(
        200,
        serde_json::json!({
            "public_id": "img123",
            "secure_url": object_url("img123"),
            "format": "png",
            "width": 6,
            "height": 4,
            "bytes": 90,
            "created_at": "2025-07-01T00:00:00Z"
        })
        .to_string(),
    ));
    let bridge = h.resolver.bridge();
    bridge.set_collection(FABRICS_QUERY, vec![FabricItem::new(code("AB-100"), None)]);
    let token = bridge.begin_refresh();

    let record = h
        .resolver
        .upload(&code("AB-100"), &png_bytes(), None)
        .await
        .unwrap();
    assert_eq!(record.object_id.as_deref(), Some("img123"));
    assert_eq!(
        bridge.collection(FABRICS_QUERY).unwrap()[0].image,
        Some(object_url("img123"))
    );

    // A refresh that started before the upload must not clobber the patch.
    bridge.complete_refresh(
        FABRICS_QUERY,
        vec![FabricItem::new(code("AB-100"), None)],
        token,
    );
    assert_eq!(
        bridge.collection(FABRICS_QUERY).unwrap()[0].image,
        Some(object_url("img123"))
    );
}

#[tokio::test]
async fn bootstrap_warms_runtime_cache_from_persisted_blob() {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .save(
            STORAGE_KEY,
            r#"{"fabricToObjectId":{"AB-100":"img123"},"timestamp":1}"#,
        )
        .unwrap();
    let h = harness_with_backend(&test_config(), backend);

    let report = h.resolver.bootstrap().await;

    assert_eq!(report.warmed, 1);
    assert_eq!(report.mapped, 0);
    assert_eq!(
        h.resolver.resolve_record(&code("AB-100")).await.unwrap().source,
        ImageSource::Runtime
    );
}

#[tokio::test]
async fn refresh_drops_runtime_entry_and_reprobes() {
    let h = harness(&test_config());
    h.resolver.runtime().insert(&code("A"), "https://cdn.example.com/old.jpg");

    assert_eq!(h.resolver.refresh(&code("A")).await, None);
    assert_eq!(h.http.head_count(), 1);
}

#[tokio::test]
async fn image_status_report_counts_codes() {
    let h = harness(&test_config());
    h.http.add_existing(&fabric_url("A"));
    h.resolver
        .record_manual_override(&code("B"), "https://cdn.example.com/b.jpg")
        .unwrap();

    let report = h
        .resolver
        .image_status_report(&[code("A"), code("B"), code("C")])
        .await;

    assert_eq!(report.total, 3);
    assert_eq!(report.with_images, 2);
    assert_eq!(report.without_images, 1);
    assert_eq!(report.missing, vec![code("C")]);
}

#[tokio::test]
async fn cache_stats_report_runtime_entries() {
    let h = harness(&test_config());
    h.resolver
        .record_manual_override(&code("B"), "https://cdn.example.com/b.jpg")
        .unwrap();
    h.clock.advance(Duration::from_secs(3));

    let stats = h.resolver.cache_stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.entries[0].age_ms, 3_000);
}
