//! Image storage: the remote store, upload pre-checks and the local persisted cache.

mod persisted;
mod remote;
mod upload_check;

pub use persisted::{
    FileBackend, LocalPersistentCache, MemoryBackend, PersistedRecord, PersistentBackend,
    STORAGE_KEY,
};
pub use remote::{DeliveryFormat, ImageTransform, ProbeOutcome, RemoteImageStore};
pub use upload_check::{check_upload, CheckedUpload, UploadFormat, UploadLimits};
