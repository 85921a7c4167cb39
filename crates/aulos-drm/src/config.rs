use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{DrmError, DrmResult};

/// Resolves a CDM license challenge into a license blob, typically by
/// calling the application's license server.
#[async_trait]
pub trait LicenseRequester: Send + Sync {
    async fn request_license(&self, challenge: Bytes) -> DrmResult<Bytes>;
}

/// One persisted session record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredSessionRecord {
    pub fingerprint: String,
    pub session_id: String,
    pub key_system: String,
}

/// Host-provided persistence for license sessions.
pub trait LicenseStorage: Send + Sync {
    fn load(&self) -> Vec<StoredSessionRecord>;
    fn save(&self, records: Vec<StoredSessionRecord>);
}

/// One key-system candidate, tried in order on the first encrypted event.
#[derive(Clone)]
pub struct KeySystemConfig {
    /// Key system identifier, e.g. `com.widevine.alpha`.
    pub key_system: String,
    pub license: Arc<dyn LicenseRequester>,
    pub server_certificate: Option<Bytes>,
    pub persistent_license: bool,
    pub storage: Option<Arc<dyn LicenseStorage>>,
}

impl fmt::Debug for KeySystemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySystemConfig")
            .field("key_system", &self.key_system)
            .field("server_certificate", &self.server_certificate.is_some())
            .field("persistent_license", &self.persistent_license)
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

/// Platform decryption-module seam.
///
/// The host implements this over its CDM and presentation element; the
/// driver only sequences calls and never touches the element directly.
#[async_trait]
pub trait Cdm: Send + Sync + 'static {
    /// Whether the environment accepts `key_system` with the requested
    /// persistence mode.
    async fn supports(&self, key_system: &str, persistent: bool) -> bool;

    async fn create_media_keys(&self, key_system: &str) -> DrmResult<()>;

    /// Attach the created media keys to the presentation element.
    async fn attach_media_keys(&self) -> DrmResult<()>;

    async fn set_server_certificate(&self, certificate: &[u8]) -> DrmResult<()>;

    /// Open a session for `init_data`; returns the session id and the
    /// license challenge to forward to the license server.
    async fn open_session(
        &self,
        init_data_type: &str,
        init_data: &[u8],
        persistent: bool,
    ) -> DrmResult<(String, Bytes)>;

    /// Restore a persisted session. `Ok(false)` means the record is stale.
    async fn load_session(&self, session_id: &str) -> DrmResult<bool>;

    async fn update_session(&self, session_id: &str, license: &[u8]) -> DrmResult<()>;

    async fn close_session(&self, session_id: &str) -> DrmResult<()>;

    /// Detach media keys from the element.
    async fn clear_media_keys(&self) -> DrmResult<()>;
}

/// Fail fast when persistence is requested without a storage pair.
pub(crate) fn validate_configs(configs: &[KeySystemConfig]) -> DrmResult<()> {
    for config in configs {
        if config.persistent_license && config.storage.is_none() {
            return Err(DrmError::StorageRequired);
        }
    }
    Ok(())
}
