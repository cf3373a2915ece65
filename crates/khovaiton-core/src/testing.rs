//! In-memory fakes shared by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Value};

use crate::clock::ManualClock;
use crate::config::{ImageSyncConfig, RemoteStoreConfig};
use crate::http::{FormValue, HttpBody, HttpClient, HttpRequest, HttpResponse, TransportError};

pub const MAPPING_URL: &str = "https://mappings.test/api/fabric-mappings";
pub const UPLOAD_URL: &str = "https://api.cloudinary.com/v1_1/demo/image/upload";
pub const START_MILLIS: i64 = 1_750_000_000_000;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub json: Option<Value>,
    pub form_fields: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    existing: HashSet<String>,
    head_failures: HashMap<String, TransportError>,
    head_delay: Option<Duration>,
    update_delay: Option<Duration>,
    requests: Vec<RecordedRequest>,
    mappings: BTreeMap<String, String>,
    mapping_reads_fail: bool,
    mapping_writes_fail: bool,
    upload_response: Option<HttpResponse>,
}

/// Fake remote: delivery HEAD probes, the mapping service and the upload endpoint.
#[derive(Debug, Default)]
pub struct FakeHttp {
    state: Mutex<FakeState>,
}

impl FakeHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_existing(&self, url: &str) {
        self.lock().existing.insert(url.to_string());
    }

    pub fn fail_head(&self, url: &str, error: TransportError) {
        self.lock().head_failures.insert(url.to_string(), error);
    }

    pub fn set_head_delay(&self, delay: Duration) {
        self.lock().head_delay = Some(delay);
    }

    /// Delay bulk `update` writes before they reach the fake table.
    pub fn set_update_delay(&self, delay: Duration) {
        self.lock().update_delay = Some(delay);
    }

    pub fn set_remote_mapping(&self, code: &str, value: &str) {
        self.lock()
            .mappings
            .insert(code.to_string(), value.to_string());
    }

    pub fn remote_mappings(&self) -> BTreeMap<String, String> {
        self.lock().mappings.clone()
    }

    pub fn set_mapping_reads_fail(&self, fail: bool) {
        self.lock().mapping_reads_fail = fail;
    }

    pub fn set_mapping_writes_fail(&self, fail: bool) {
        self.lock().mapping_writes_fail = fail;
    }

    pub fn set_upload_response(&self, response: HttpResponse) {
        self.lock().upload_response = Some(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn head_count(&self) -> usize {
        self.count(&Method::HEAD)
    }

    pub fn count(&self, method: &Method) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|request| request.method == *method)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn handle_head(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let state = self.lock();
        if let Some(error) = state.head_failures.get(url) {
            return Err(error.clone());
        }
        let status = if state.existing.contains(url) { 200 } else { 404 };
        Ok(HttpResponse::new(status, Vec::new()))
    }

    fn handle_mapping_get(&self) -> Result<HttpResponse, TransportError> {
        let state = self.lock();
        if state.mapping_reads_fail {
            return Err(TransportError::Connect("mapping service down".to_string()));
        }
        let body = json!({
            "success": true,
            "mappings": state.mappings,
            "count": state.mappings.len(),
            "timestamp": "2025-07-01T00:00:00.000Z",
        });
        Ok(HttpResponse::new(200, body.to_string()))
    }

    fn handle_mapping_post(&self, body: Option<&Value>) -> Result<HttpResponse, TransportError> {
        let mut state = self.lock();
        if state.mapping_writes_fail {
            return Ok(HttpResponse::new(
                500,
                json!({"success": false, "error": "disk full"}).to_string(),
            ));
        }
        let Some(body) = body else {
            return Ok(HttpResponse::new(400, "{}"));
        };
        match body["action"].as_str() {
            Some("update") => {
                let mut updated = 0;
                if let Some(entries) = body["mappings"].as_object() {
                    for (code, value) in entries {
                        let value = value.as_str().unwrap_or_default().to_string();
                        if state.mappings.get(code) != Some(&value) {
                            state.mappings.insert(code.clone(), value);
                            updated += 1;
                        }
                    }
                }
                let body = json!({"success": true, "updatedCount": updated});
                Ok(HttpResponse::new(200, body.to_string()))
            }
            Some("add") => {
                let code = body["fabricCode"].as_str().unwrap_or_default().to_string();
                let value = body["publicId"].as_str().unwrap_or_default().to_string();
                let is_new = state.mappings.insert(code, value).is_none();
                let body = json!({"success": true, "isNew": is_new});
                Ok(HttpResponse::new(200, body.to_string()))
            }
            _ => Ok(HttpResponse::new(400, r#"{"success":false,"error":"Invalid action"}"#)),
        }
    }

    fn handle_upload(&self) -> HttpResponse {
        self.lock()
            .upload_response
            .clone()
            .unwrap_or_else(|| HttpResponse::new(500, r#"{"error":{"message":"no fake"}}"#))
    }
}

impl HttpClient for FakeHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let json = match &request.body {
            HttpBody::Json(value) => Some(value.clone()),
            _ => None,
        };
        let form_fields = match &request.body {
            HttpBody::Multipart(parts) => parts
                .iter()
                .map(|part| match &part.value {
                    FormValue::Text(value) => format!("{}={value}", part.name),
                    FormValue::File { file_name, .. } => format!("{}@{file_name}", part.name),
                })
                .collect(),
            _ => Vec::new(),
        };
        let (delay, update_delay) = {
            let mut state = self.lock();
            state.requests.push(RecordedRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                json: json.clone(),
                form_fields,
            });
            (state.head_delay, state.update_delay)
        };

        if request.method == Method::HEAD {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            return self.handle_head(&request.url);
        }
        if request.url == MAPPING_URL && request.method == Method::GET {
            return self.handle_mapping_get();
        }
        if request.url == MAPPING_URL && request.method == Method::POST {
            let is_update = json
                .as_ref()
                .is_some_and(|body| body["action"] == "update");
            if let Some(delay) = update_delay.filter(|_| is_update) {
                tokio::time::sleep(delay).await;
            }
            return self.handle_mapping_post(json.as_ref());
        }
        if request.url == UPLOAD_URL && request.method == Method::POST {
            return Ok(self.handle_upload());
        }
        Ok(HttpResponse::new(404, Vec::new()))
    }
}

pub fn test_config() -> ImageSyncConfig {
    let mut config = ImageSyncConfig::new(RemoteStoreConfig::new("demo", "fabric_images"));
    config.batch_delay = Duration::from_millis(5);
    config
}

pub fn test_config_with_mapping() -> ImageSyncConfig {
    let mut config = test_config();
    config.mapping_url = Some(MAPPING_URL.to_string());
    config.mapping_write_url = Some(MAPPING_URL.to_string());
    config
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START_MILLIS))
}

/// Delivery URL the naming convention derives for a code under `test_config`.
pub fn fabric_url(code: &str) -> String {
    format!(
        "https://res.cloudinary.com/demo/image/upload/fabrics/{}",
        urlencoding::encode(code)
    )
}

pub fn object_url(object_id: &str) -> String {
    format!("https://res.cloudinary.com/demo/image/upload/{object_id}")
}
