//! Remote image store: delivery URL convention, existence probes and unsigned uploads.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::upload_check::{check_upload, UploadLimits};
use crate::config::{ProbePolicy, RemoteStoreConfig};
use crate::http::{FormPart, HttpClient, HttpRequest, TransportError};
use crate::models::{FabricCode, MappingValue, UploadResult};
use crate::util::compact_text;
use crate::{Error, Result};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivery format transformation. `Auto` lets the store negotiate and is
/// omitted from URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryFormat {
    #[default]
    Auto,
    Webp,
    Jpg,
    Png,
}

impl DeliveryFormat {
    const fn token(self) -> Option<&'static str> {
        match self {
            Self::Auto => None,
            Self::Webp => Some("webp"),
            Self::Jpg => Some("jpg"),
            Self::Png => Some("png"),
        }
    }
}

/// On-the-fly transformation rendered into the delivery URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageTransform {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: DeliveryFormat,
    /// `None` means automatic quality.
    pub quality: Option<u8>,
}

impl ImageTransform {
    /// Comma-separated segment in `w_,h_,f_,q_` order, or `None` when empty.
    pub fn segment(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(width) = self.width {
            parts.push(format!("w_{width}"));
        }
        if let Some(height) = self.height {
            parts.push(format!("h_{height}"));
        }
        if let Some(format) = self.format.token() {
            parts.push(format!("f_{format}"));
        }
        if let Some(quality) = self.quality {
            parts.push(format!("q_{quality}"));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(","))
        }
    }
}

/// Result of one existence probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The URL answered 2xx.
    Exists,
    /// Definitive miss: non-2xx status or timeout.
    Missing,
    /// Transport failure on an allowlisted host; treated as present.
    AssumedPresent(TransportError),
    /// Transport failure on any other host; treated as missing.
    Unreachable(TransportError),
}

impl ProbeOutcome {
    pub const fn is_present(&self) -> bool {
        matches!(self, Self::Exists | Self::AssumedPresent(_))
    }
}

/// Hosted image store addressed by cloud id and folder convention.
#[derive(Debug)]
pub struct RemoteImageStore<H> {
    config: RemoteStoreConfig,
    http: Arc<H>,
    probe_policy: ProbePolicy,
    probe_timeout: Duration,
    upload_limits: UploadLimits,
}

impl<H: HttpClient> RemoteImageStore<H> {
    pub fn new(
        config: RemoteStoreConfig,
        http: Arc<H>,
        probe_policy: ProbePolicy,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            config,
            http,
            probe_policy,
            probe_timeout,
            upload_limits: UploadLimits::default(),
        }
    }

    #[must_use]
    pub const fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
        self.upload_limits = limits;
        self
    }

    pub const fn config(&self) -> &RemoteStoreConfig {
        &self.config
    }

    /// Whether uploads can be attempted at all.
    pub fn is_configured(&self) -> bool {
        !self.config.cloud_name.is_empty() && !self.config.upload_preset.is_empty()
    }

    /// Candidate URL for a fabric code under the folder naming convention.
    pub fn fabric_url(&self, code: &FabricCode, transform: Option<&ImageTransform>) -> String {
        let path = format!(
            "{}/{}",
            encode_path(&self.config.fabric_folder),
            urlencoding::encode(code.as_str())
        );
        self.delivery_url(&path, transform)
    }

    /// Delivery URL of an exact remote object.
    pub fn object_url(&self, object_id: &str, transform: Option<&ImageTransform>) -> String {
        self.delivery_url(&encode_path(object_id), transform)
    }

    /// URL for a mapping value: object ids follow the delivery convention,
    /// literal URLs are used verbatim.
    pub fn url_for(&self, value: &MappingValue) -> String {
        match value {
            MappingValue::ObjectId(object_id) => self.object_url(object_id, None),
            MappingValue::LiteralUrl(url) => url.clone(),
        }
    }

    fn delivery_url(&self, path: &str, transform: Option<&ImageTransform>) -> String {
        let base = self.config.delivery_base();
        match transform.and_then(ImageTransform::segment) {
            Some(segment) => format!("{base}/{segment}/{path}"),
            None => format!("{base}/{path}"),
        }
    }

    /// Issue one bounded HEAD probe.
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        let request = HttpRequest::head(url).with_timeout(self.probe_timeout);
        let result = tokio::time::timeout(self.probe_timeout, self.http.send(request)).await;
        let outcome = match result {
            Err(_) => ProbeOutcome::Missing,
            Ok(Ok(response)) if response.is_success() => ProbeOutcome::Exists,
            Ok(Ok(response)) => {
                debug!(url, status = response.status, "Probe found no image");
                ProbeOutcome::Missing
            }
            Ok(Err(error)) if error.is_timeout() => ProbeOutcome::Missing,
            Ok(Err(error)) if self.probe_policy.assumes_present(url) => {
                debug!(url, %error, "Probe could not be evaluated; host is allowlisted");
                ProbeOutcome::AssumedPresent(error)
            }
            Ok(Err(error)) => {
                warn!(url, %error, "Probe failed; treating image as missing");
                ProbeOutcome::Unreachable(error)
            }
        };
        debug!(url, ?outcome, "Probe finished");
        outcome
    }

    /// Upload image bytes for a fabric code with the unsigned preset.
    ///
    /// Only `file` and `upload_preset` are sent; anything else is a
    /// signed-upload parameter and the endpoint rejects it.
    pub async fn upload(
        &self,
        code: &FabricCode,
        bytes: &[u8],
        file_name: Option<&str>,
    ) -> Result<UploadResult> {
        if !self.is_configured() {
            return Err(Error::NotConfigured(
                "Remote image store needs a cloud name and upload preset".to_string(),
            ));
        }
        let checked = check_upload(bytes, self.upload_limits)?;
        let file_name = file_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map_or_else(
                || format!("{}.{}", sanitize_token(code.as_str()), checked.format.extension()),
                ToString::to_string,
            );

        let parts = vec![
            FormPart::file("file", bytes.to_vec(), file_name, checked.format.content_type()),
            FormPart::text("upload_preset", self.config.upload_preset.clone()),
        ];
        let request = HttpRequest::post_multipart(&self.config.upload_endpoint, parts)
            .with_timeout(UPLOAD_TIMEOUT);
        let response = self
            .http
            .send(request)
            .await
            .map_err(|error| upload_error(code, error))?;
        if !response.is_success() {
            return Err(upload_error(
                code,
                format!(
                    "HTTP {}: {}",
                    response.status,
                    parse_upload_error(&response.text())
                ),
            ));
        }

        let payload: UploadResponse = response
            .json()
            .map_err(|error| upload_error(code, format!("invalid response: {error}")))?;
        let url = payload
            .secure_url
            .or(payload.url)
            .unwrap_or_else(|| self.object_url(&payload.public_id, None));
        info!(
            fabric_code = %code,
            object_id = %payload.public_id,
            width = payload.width,
            height = payload.height,
            "Uploaded fabric image"
        );

        Ok(UploadResult {
            object_id: payload.public_id,
            url,
            format: payload
                .format
                .unwrap_or_else(|| checked.format.extension().to_string()),
            width: payload.width.unwrap_or(checked.width),
            height: payload.height.unwrap_or(checked.height),
            bytes: payload.bytes.unwrap_or(bytes.len() as u64),
            created_at: payload.created_at.unwrap_or_default(),
        })
    }

    /// Deletion needs a signed request, which an unsigned preset cannot make.
    pub fn delete(&self, object_id: &str) -> Result<()> {
        Err(Error::NotConfigured(format!(
            "Deleting {object_id} requires signed uploads; unsigned presets cannot delete"
        )))
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    public_id: String,
    secure_url: Option<String>,
    url: Option<String>,
    format: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    bytes: Option<u64>,
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadErrorBody {
    error: Option<UploadErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct UploadErrorDetail {
    message: Option<String>,
}

fn parse_upload_error(body: &str) -> String {
    serde_json::from_str::<UploadErrorBody>(body)
        .ok()
        .and_then(|payload| payload.error)
        .and_then(|detail| detail.message)
        .unwrap_or_else(|| compact_text(body))
}

fn upload_error(code: &FabricCode, error: impl std::fmt::Display) -> Error {
    Error::Upload(format!("upload for {code} failed: {error}"))
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn sanitize_token(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = false;

    for ch in input.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        "fabric".to_string()
    } else {
        out
    }
}
