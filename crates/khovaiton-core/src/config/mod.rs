//! Environment-driven configuration for the image subsystem.

use std::env;
use std::fmt;
use std::time::Duration;

use crate::util::{is_http_url, normalize_base_url, normalize_text_option, url_host};
use crate::{Error, Result};

pub const ENV_CLOUD_NAME: &str = "KHOVAITON_CLOUD_NAME";
pub const ENV_UPLOAD_PRESET: &str = "KHOVAITON_UPLOAD_PRESET";
pub const ENV_DELIVERY_HOST: &str = "KHOVAITON_DELIVERY_HOST";
pub const ENV_UPLOAD_ENDPOINT: &str = "KHOVAITON_UPLOAD_ENDPOINT";
pub const ENV_FABRIC_FOLDER: &str = "KHOVAITON_FABRIC_FOLDER";
pub const ENV_MAPPING_URL: &str = "KHOVAITON_MAPPING_URL";
pub const ENV_MAPPING_WRITE_URL: &str = "KHOVAITON_MAPPING_WRITE_URL";
pub const ENV_CACHE_TTL_SECS: &str = "KHOVAITON_CACHE_TTL_SECS";
pub const ENV_PROBE_TIMEOUT_MS: &str = "KHOVAITON_PROBE_TIMEOUT_MS";
pub const ENV_BATCH_SIZE: &str = "KHOVAITON_BATCH_SIZE";
pub const ENV_BATCH_DELAY_MS: &str = "KHOVAITON_BATCH_DELAY_MS";
pub const ENV_SYNC_INTERVAL_SECS: &str = "KHOVAITON_SYNC_INTERVAL_SECS";
pub const ENV_ASSUME_PRESENT_HOSTS: &str = "KHOVAITON_ASSUME_PRESENT_HOSTS";

pub const DEFAULT_UPLOAD_PRESET: &str = "fabric_images";
pub const DEFAULT_DELIVERY_HOST: &str = "res.cloudinary.com";
pub const DEFAULT_FABRIC_FOLDER: &str = "fabrics";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2_500);
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);

const PROBE_TIMEOUT_RANGE_MS: (u64, u64) = (500, 10_000);
const BATCH_SIZE_RANGE: (usize, usize) = (1, 100);

/// Remote image store coordinates.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteStoreConfig {
    /// Cloud id segment of every delivery URL.
    pub cloud_name: String,
    /// Unsigned upload preset. Treated as a secret.
    pub upload_preset: String,
    pub delivery_host: String,
    pub upload_endpoint: String,
    /// Folder used by the fabric-code naming convention.
    pub fabric_folder: String,
}

impl RemoteStoreConfig {
    pub fn new(cloud_name: impl Into<String>, upload_preset: impl Into<String>) -> Self {
        let cloud_name = cloud_name.into();
        let upload_endpoint = default_upload_endpoint(&cloud_name);
        Self {
            cloud_name,
            upload_preset: upload_preset.into(),
            delivery_host: DEFAULT_DELIVERY_HOST.to_string(),
            upload_endpoint,
            fabric_folder: DEFAULT_FABRIC_FOLDER.to_string(),
        }
    }

    /// Base of every delivery URL, without a trailing slash.
    pub fn delivery_base(&self) -> String {
        format!(
            "https://{}/{}/image/upload",
            self.delivery_host, self.cloud_name
        )
    }
}

impl fmt::Debug for RemoteStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStoreConfig")
            .field("cloud_name", &self.cloud_name)
            .field("upload_preset", &"[REDACTED]")
            .field("delivery_host", &self.delivery_host)
            .field("upload_endpoint", &self.upload_endpoint)
            .field("fabric_folder", &self.fabric_folder)
            .finish()
    }
}

/// Which hosts may be assumed present when a probe cannot be evaluated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbePolicy {
    assume_present_hosts: Vec<String>,
}

impl ProbePolicy {
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let assume_present_hosts = hosts
            .into_iter()
            .map(|host| host.into().trim().to_ascii_lowercase())
            .filter(|host| !host.is_empty())
            .collect();
        Self {
            assume_present_hosts,
        }
    }

    /// Require a successful confirmation for every host.
    pub const fn strict() -> Self {
        Self {
            assume_present_hosts: Vec::new(),
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.assume_present_hosts
    }

    pub fn assumes_present(&self, url: &str) -> bool {
        url_host(url).is_some_and(|host| self.assume_present_hosts.contains(&host))
    }
}

/// Full configuration of the resolution and sync subsystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSyncConfig {
    pub remote: RemoteStoreConfig,
    /// Mapping document URL; `None` disables the mapping store.
    pub mapping_url: Option<String>,
    /// Mapping write endpoint; `None` makes pushes a no-op.
    pub mapping_write_url: Option<String>,
    pub cache_ttl: Duration,
    pub probe_timeout: Duration,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub sync_interval: Duration,
    pub probe_policy: ProbePolicy,
}

impl ImageSyncConfig {
    /// Defaults around an explicit remote store.
    pub fn new(remote: RemoteStoreConfig) -> Self {
        let probe_policy = ProbePolicy::new([remote.delivery_host.clone()]);
        Self {
            remote,
            mapping_url: None,
            mapping_write_url: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            probe_policy,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let cloud_name = normalize_text_option(lookup(ENV_CLOUD_NAME));
        let Some(cloud_name) = cloud_name else {
            return Err(Error::Config(format!(
                "Remote image store configuration is incomplete. Missing: {ENV_CLOUD_NAME}"
            )));
        };
        let upload_preset = normalize_text_option(lookup(ENV_UPLOAD_PRESET))
            .unwrap_or_else(|| DEFAULT_UPLOAD_PRESET.to_string());

        let mut remote = RemoteStoreConfig::new(cloud_name, upload_preset);
        if let Some(host) = normalize_text_option(lookup(ENV_DELIVERY_HOST)) {
            remote.delivery_host = normalize_host(&host, ENV_DELIVERY_HOST)?;
        }
        if let Some(endpoint) = optional_url(lookup(ENV_UPLOAD_ENDPOINT), ENV_UPLOAD_ENDPOINT)? {
            remote.upload_endpoint = endpoint;
        }
        if let Some(folder) = normalize_text_option(lookup(ENV_FABRIC_FOLDER)) {
            remote.fabric_folder = folder.trim_matches('/').to_string();
        }

        let mut config = Self::new(remote);
        config.mapping_url = optional_url(lookup(ENV_MAPPING_URL), ENV_MAPPING_URL)?;
        config.mapping_write_url =
            optional_url(lookup(ENV_MAPPING_WRITE_URL), ENV_MAPPING_WRITE_URL)?;

        if let Some(secs) = parse_number::<u64>(lookup(ENV_CACHE_TTL_SECS), ENV_CACHE_TTL_SECS)? {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(millis) =
            parse_number::<u64>(lookup(ENV_PROBE_TIMEOUT_MS), ENV_PROBE_TIMEOUT_MS)?
        {
            let (min, max) = PROBE_TIMEOUT_RANGE_MS;
            if !(min..=max).contains(&millis) {
                return Err(Error::Config(format!(
                    "{ENV_PROBE_TIMEOUT_MS} must be between {min} and {max}"
                )));
            }
            config.probe_timeout = Duration::from_millis(millis);
        }
        if let Some(size) = parse_number::<usize>(lookup(ENV_BATCH_SIZE), ENV_BATCH_SIZE)? {
            let (min, max) = BATCH_SIZE_RANGE;
            if !(min..=max).contains(&size) {
                return Err(Error::Config(format!(
                    "{ENV_BATCH_SIZE} must be between {min} and {max}"
                )));
            }
            config.batch_size = size;
        }
        if let Some(millis) = parse_number::<u64>(lookup(ENV_BATCH_DELAY_MS), ENV_BATCH_DELAY_MS)?
        {
            config.batch_delay = Duration::from_millis(millis);
        }
        if let Some(secs) =
            parse_number::<u64>(lookup(ENV_SYNC_INTERVAL_SECS), ENV_SYNC_INTERVAL_SECS)?
        {
            if secs == 0 {
                return Err(Error::Config(format!(
                    "{ENV_SYNC_INTERVAL_SECS} must be greater than zero"
                )));
            }
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(hosts) = lookup(ENV_ASSUME_PRESENT_HOSTS) {
            config.probe_policy = ProbePolicy::new(hosts.split(','));
        }

        Ok(config)
    }
}

pub fn default_upload_endpoint(cloud_name: &str) -> String {
    format!("https://api.cloudinary.com/v1_1/{cloud_name}/image/upload")
}

fn optional_url(value: Option<String>, name: &str) -> Result<Option<String>> {
    let Some(value) = normalize_text_option(value) else {
        return Ok(None);
    };
    if !is_http_url(&value) {
        return Err(Error::Config(format!(
            "{name} must start with http:// or https://"
        )));
    }
    Ok(Some(normalize_base_url(&value)))
}

fn normalize_host(value: &str, name: &str) -> Result<String> {
    let host = value.trim().trim_end_matches('/').to_ascii_lowercase();
    if host.contains('/') || host.contains(' ') {
        return Err(Error::Config(format!(
            "{name} must be a bare host name, got '{value}'"
        )));
    }
    Ok(host)
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, name: &str) -> Result<Option<T>> {
    let Some(value) = normalize_text_option(value) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got '{value}'")))
}
