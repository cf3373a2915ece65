//! Client for the shared cross-device mapping document.
//!
//! Reads accept either the bare `{code: value}` document or the service
//! envelope `{success, mappings, count, timestamp}`. Writes go to an optional
//! endpoint; without one the store is read-only and pushes are successful
//! no-ops.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::models::{FabricCode, MappingTable, MappingValue};
use crate::util::compact_text;
use crate::{Error, Result};

const MAPPING_HTTP_TIMEOUT: Duration = Duration::from_secs(4);

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The write endpoint accepted the entries.
    Applied { updated: usize },
    /// No write endpoint is configured; nothing was sent.
    Skipped,
}

#[derive(Debug)]
pub struct MappingStore<H> {
    http: Arc<H>,
    read_url: Option<String>,
    write_url: Option<String>,
}

impl<H: HttpClient> MappingStore<H> {
    pub const fn new(http: Arc<H>, read_url: Option<String>, write_url: Option<String>) -> Self {
        Self {
            http,
            read_url,
            write_url,
        }
    }

    /// Whether a mapping document is configured at all.
    pub const fn is_enabled(&self) -> bool {
        self.read_url.is_some()
    }

    pub const fn is_writable(&self) -> bool {
        self.write_url.is_some()
    }

    /// Fetch the full mapping, surfacing failures.
    pub async fn try_fetch_all(&self) -> Result<MappingTable> {
        let Some(url) = self.read_url.as_deref() else {
            return Ok(MappingTable::new());
        };
        let response = self
            .http
            .send(HttpRequest::get(url).with_timeout(MAPPING_HTTP_TIMEOUT))
            .await?;
        if !response.is_success() {
            return Err(mapping_error("fetch", url, &response));
        }
        let table = parse_mapping_document(&response.text())?;
        debug!(entries = table.len(), "Fetched fabric mapping document");
        Ok(table)
    }

    /// Fetch the full mapping; an unavailable store yields an empty map.
    pub async fn fetch_all(&self) -> MappingTable {
        match self.try_fetch_all().await {
            Ok(table) => table,
            Err(error) => {
                warn!(%error, "Mapping store unavailable; falling back to probes");
                MappingTable::new()
            }
        }
    }

    /// Write entries, surfacing failures.
    pub async fn try_push(&self, entries: &MappingTable) -> Result<PushOutcome> {
        let Some(url) = self.write_url.as_deref() else {
            debug!(entries = entries.len(), "Mapping store is read-only; push skipped");
            return Ok(PushOutcome::Skipped);
        };
        if entries.is_empty() {
            return Ok(PushOutcome::Applied { updated: 0 });
        }
        let body = json!({
            "action": "update",
            "mappings": entries,
        });
        let response = self
            .http
            .send(HttpRequest::post_json(url, body).with_timeout(MAPPING_HTTP_TIMEOUT))
            .await?;
        let updated = parse_write_response("push", url, &response)?
            .updated_count
            .unwrap_or(entries.len());
        info!(sent = entries.len(), updated, "Pushed fabric mappings");
        Ok(PushOutcome::Applied { updated })
    }

    /// Best-effort push. Read-only deployments report success.
    pub async fn push(&self, entries: &MappingTable) -> bool {
        match self.try_push(entries).await {
            Ok(_) => true,
            Err(error) => {
                warn!(%error, entries = entries.len(), "Failed to push fabric mappings");
                false
            }
        }
    }

    /// Write one entry, surfacing failures.
    pub async fn try_add(&self, code: &FabricCode, value: &MappingValue) -> Result<PushOutcome> {
        let Some(url) = self.write_url.as_deref() else {
            return Ok(PushOutcome::Skipped);
        };
        let body = json!({
            "action": "add",
            "fabricCode": code,
            "publicId": value,
        });
        let response = self
            .http
            .send(HttpRequest::post_json(url, body).with_timeout(MAPPING_HTTP_TIMEOUT))
            .await?;
        let payload = parse_write_response("add", url, &response)?;
        debug!(fabric_code = %code, is_new = ?payload.is_new, "Added fabric mapping");
        Ok(PushOutcome::Applied { updated: 1 })
    }

    /// Best-effort single-entry write used right after an upload.
    pub async fn add(&self, code: &FabricCode, value: &MappingValue) -> bool {
        match self.try_add(code, value).await {
            Ok(_) => true,
            Err(error) => {
                warn!(fabric_code = %code, %error, "Failed to add fabric mapping");
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MappingDocument {
    Envelope {
        success: bool,
        #[serde(default)]
        mappings: Option<BTreeMap<String, String>>,
        #[serde(default)]
        error: Option<String>,
    },
    Bare(BTreeMap<String, String>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    updated_count: Option<usize>,
    #[serde(default)]
    is_new: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse a mapping document in either accepted shape. Blank codes or values
/// are skipped.
pub fn parse_mapping_document(body: &str) -> Result<MappingTable> {
    let document: MappingDocument = serde_json::from_str(body)?;
    let raw = match document {
        MappingDocument::Envelope {
            success: false,
            error,
            ..
        } => {
            return Err(Error::Storage(format!(
                "Mapping service reported failure: {}",
                error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        MappingDocument::Envelope { mappings, .. } => mappings.unwrap_or_default(),
        MappingDocument::Bare(mappings) => mappings,
    };

    let mut table = MappingTable::new();
    for (code, value) in raw {
        if value.trim().is_empty() {
            warn!(fabric_code = %code, "Skipping mapping entry with empty value");
            continue;
        }
        match FabricCode::new(code) {
            Ok(code) => {
                table.insert(code, MappingValue::from(value));
            }
            Err(error) => warn!(%error, "Skipping mapping entry"),
        }
    }
    Ok(table)
}

fn parse_write_response(operation: &str, url: &str, response: &HttpResponse) -> Result<WriteResponse> {
    if !response.is_success() {
        return Err(mapping_error(operation, url, response));
    }
    let payload = response.json::<WriteResponse>().unwrap_or_default();
    if payload.success == Some(false) {
        return Err(Error::Storage(format!(
            "Mapping {operation} rejected by {url}: {}",
            payload.error.as_deref().unwrap_or("unknown error")
        )));
    }
    Ok(payload)
}

fn mapping_error(operation: &str, url: &str, response: &HttpResponse) -> Error {
    let body = response.text();
    let detail = serde_json::from_str::<WriteResponse>(&body)
        .ok()
        .and_then(|payload| payload.error)
        .unwrap_or_else(|| compact_text(&body));
    Error::Storage(format!(
        "Mapping {operation} failed for {url} with HTTP {}: {detail}",
        response.status
    ))
}
