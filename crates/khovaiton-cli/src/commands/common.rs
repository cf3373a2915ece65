use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use khovaiton_core::cache::CacheStats;
use khovaiton_core::config::ImageSyncConfig;
use khovaiton_core::http::ReqwestHttpClient;
use khovaiton_core::storage::FileBackend;
use khovaiton_core::sync::SyncStatus;
use khovaiton_core::FabricImageService;

use crate::error::CliError;

pub type Service = FabricImageService<ReqwestHttpClient, FileBackend>;

pub fn load_config(interval_override: Option<u64>) -> Result<ImageSyncConfig, CliError> {
    let mut config = ImageSyncConfig::from_env()?;
    if let Some(secs) = interval_override.filter(|secs| *secs > 0) {
        config.sync_interval = Duration::from_secs(secs);
    }
    Ok(config)
}

pub async fn open_service(
    config: &ImageSyncConfig,
    data_dir: Option<&Path>,
) -> Result<Service, CliError> {
    let backend = match data_dir {
        Some(dir) => FileBackend::new(dir),
        None => FileBackend::default_location()?,
    };
    tracing::debug!(dir = %backend.dir().display(), "Using local image cache");
    let service = FabricImageService::from_config(config, backend)?;
    service.bootstrap().await;
    Ok(service)
}

/// Merge positional codes with codes read from a file, one per line.
///
/// Blank lines and `#` comments are skipped; first occurrence wins.
pub fn collect_codes(codes: &[String], file: Option<&Path>) -> Result<Vec<String>, CliError> {
    let from_file = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => String::new(),
    };
    let candidates = codes
        .iter()
        .map(String::as_str)
        .chain(from_file.lines())
        .map(str::trim)
        .filter(|code| !code.is_empty() && !code.starts_with('#'));

    let mut seen = HashSet::new();
    let collected: Vec<String> = candidates
        .filter(|code| seen.insert(*code))
        .map(ToString::to_string)
        .collect();
    if collected.is_empty() {
        return Err(CliError::NoCodes);
    }
    Ok(collected)
}

pub fn format_resolution_lines(
    order: &[String],
    results: &HashMap<String, Option<String>>,
) -> Vec<String> {
    order
        .iter()
        .map(|code| match results.get(code).and_then(Option::as_deref) {
            Some(url) => format!("{code}\t{url}"),
            None => format!("{code}\t(no image)"),
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_age(age_ms: i64) -> String {
    let secs = age_ms.max(0) / 1000;
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

pub fn format_status_lines(status: &SyncStatus, stats: &CacheStats) -> Vec<String> {
    let mut lines = vec![format!(
        "Sync: {} (runs {}, failures {})",
        status.state,
        status.runs,
        status.failures
    )];
    lines.push(match status.last_sync_at {
        Some(at) => format!("Last sync: {}", format_sync_timestamp(at)),
        None => "Last sync: never".to_string(),
    });
    if let Some(report) = status.last_report {
        lines.push(format!(
            "Last pass: {} pushed, {} merged",
            report.local_to_cloud, report.cloud_to_local
        ));
    }
    if let Some(error) = &status.last_error {
        lines.push(format!("Last error: {error}"));
    }
    lines.push(format!(
        "Runtime cache: {} entries (ttl {}s)",
        stats.size,
        stats.ttl_ms / 1000
    ));
    for entry in &stats.entries {
        lines.push(format!(
            "  {}\t{}\t{}",
            entry.fabric_code,
            format_age(entry.age_ms),
            entry.url
        ));
    }
    lines
}

/// Reject files whose extension is not an accepted upload type.
pub fn upload_content_type(path: &Path) -> Result<&'static str, CliError> {
    let accepted = ["image/jpeg", "image/png", "image/webp"];
    let guessed = mime_guess::from_path(path).first_raw();
    guessed
        .and_then(|mime| accepted.iter().find(|candidate| **candidate == mime))
        .copied()
        .ok_or_else(|| CliError::UnsupportedFile(path.display().to_string()))
}
