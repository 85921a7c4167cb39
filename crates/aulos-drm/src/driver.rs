use std::collections::HashMap;
use std::sync::Arc;

use aulos_net::{retry_with_backoff, RetryPolicy};
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::validate_configs;
use crate::store::SessionStore;
use crate::{
    init_data_fingerprint, Cdm, DrmError, DrmResult, KeySystemConfig, StoredSessionRecord,
};

/// Lifecycle of the protection driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Querying,
    Configured,
    Sessioned,
    Disposed,
}

/// What an encrypted event resolved to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A session for this init data already exists.
    AlreadyKnown,
    /// A fresh session was opened and licensed.
    Opened { session_id: String },
    /// A persisted session was restored without a license round-trip.
    Restored { session_id: String },
}

/// Structural identity of a key-system configuration list.
///
/// Capability order is significant: two lists with the same entries in a
/// different order are different configurations.
type ConfigSignature = Vec<(String, bool, Option<Bytes>)>;

fn signature_of(configs: &[KeySystemConfig]) -> ConfigSignature {
    configs
        .iter()
        .map(|c| {
            (
                c.key_system.clone(),
                c.persistent_license,
                c.server_certificate.clone(),
            )
        })
        .collect()
}

/// Content-protection driver; see the crate docs for the state machine.
pub struct ProtectionDriver {
    cdm: Arc<dyn Cdm>,
    license_retry: RetryPolicy,
    state_tx: watch::Sender<DriverState>,
    chosen: Option<KeySystemConfig>,
    established: Option<ConfigSignature>,
    certificate_provisioned: bool,
    /// fingerprint -> session id
    sessions: HashMap<String, String>,
    store: Option<SessionStore>,
}

impl ProtectionDriver {
    #[must_use]
    pub fn new(cdm: Arc<dyn Cdm>, license_retry: RetryPolicy) -> Self {
        let (state_tx, _) = watch::channel(DriverState::Uninitialized);
        Self {
            cdm,
            license_retry,
            state_tx,
            chosen: None,
            established: None,
            certificate_provisioned: false,
            sessions: HashMap::new(),
            store: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> DriverState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions, e.g. to gate the first segment append on
    /// `Configured`.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<DriverState> {
        self.state_tx.subscribe()
    }

    /// Validate candidate configurations without touching the CDM.
    ///
    /// Called by the orchestrator at startup so configuration mistakes
    /// (persistent licenses without storage) fail before any sink exists.
    pub fn validate(configs: &[KeySystemConfig]) -> DrmResult<()> {
        validate_configs(configs)
    }

    /// Drive one `encrypted` event through the state machine.
    pub async fn handle_encrypted(
        &mut self,
        configs: &[KeySystemConfig],
        init_data_type: &str,
        init_data: &[u8],
    ) -> DrmResult<SessionOutcome> {
        if self.state() == DriverState::Disposed {
            return Err(DrmError::Disposed);
        }
        validate_configs(configs)?;

        let signature = signature_of(configs);
        if let Some(established) = &self.established {
            if *established != signature {
                return Err(DrmError::InvalidKeySystem(
                    "key-system candidates changed after configuration".into(),
                ));
            }
        }

        let fingerprint = init_data_fingerprint(init_data_type, init_data);
        if self.sessions.contains_key(&fingerprint) {
            debug!(%fingerprint, "encrypted event for known init data, ignoring");
            return Ok(SessionOutcome::AlreadyKnown);
        }

        if self.chosen.is_none() {
            self.configure(configs, signature).await?;
        }
        let chosen = self.chosen.clone().ok_or(DrmError::IncompatibleKeySystems)?;

        self.provision_certificate(&chosen).await?;

        if chosen.persistent_license {
            if let Some(outcome) = self.try_restore(&chosen, &fingerprint).await? {
                return Ok(outcome);
            }
        }

        self.open_and_license(&chosen, init_data_type, init_data, fingerprint)
            .await
    }

    /// Close every session and detach media keys.
    ///
    /// `unset_media_keys` can be skipped on platforms where unsetting keys
    /// on a live element misbehaves.
    pub async fn dispose(&mut self, unset_media_keys: bool) {
        if self.state() == DriverState::Disposed {
            return;
        }
        for (fingerprint, session_id) in self.sessions.drain() {
            if let Err(error) = self.cdm.close_session(&session_id).await {
                warn!(%fingerprint, %session_id, %error, "failed to close key session");
            }
        }
        if unset_media_keys {
            if let Err(error) = self.cdm.clear_media_keys().await {
                warn!(%error, "failed to clear media keys");
            }
        }
        self.chosen = None;
        self.established = None;
        self.certificate_provisioned = false;
        let _ = self.state_tx.send(DriverState::Disposed);
    }

    async fn configure(
        &mut self,
        configs: &[KeySystemConfig],
        signature: ConfigSignature,
    ) -> DrmResult<()> {
        let _ = self.state_tx.send(DriverState::Querying);

        let mut accepted = None;
        for config in configs {
            if self
                .cdm
                .supports(&config.key_system, config.persistent_license)
                .await
            {
                accepted = Some(config.clone());
                break;
            }
            debug!(key_system = %config.key_system, "key system rejected by environment");
        }
        let config = accepted.ok_or(DrmError::IncompatibleKeySystems)?;

        self.cdm.create_media_keys(&config.key_system).await?;
        self.cdm.attach_media_keys().await?;

        debug!(key_system = %config.key_system, "protection configured");
        self.store = Some(SessionStore::new(config.storage.clone()));
        self.chosen = Some(config);
        self.established = Some(signature);
        let _ = self.state_tx.send(DriverState::Configured);
        Ok(())
    }

    /// Server-certificate provisioning is idempotent per configuration.
    async fn provision_certificate(&mut self, chosen: &KeySystemConfig) -> DrmResult<()> {
        if self.certificate_provisioned {
            return Ok(());
        }
        if let Some(certificate) = &chosen.server_certificate {
            self.cdm
                .set_server_certificate(certificate)
                .await
                .map_err(|e| DrmError::ServerCertificate(e.to_string()))?;
            self.certificate_provisioned = true;
        }
        Ok(())
    }

    async fn try_restore(
        &mut self,
        chosen: &KeySystemConfig,
        fingerprint: &str,
    ) -> DrmResult<Option<SessionOutcome>> {
        let Some(store) = &mut self.store else {
            return Ok(None);
        };
        let Some(record) = store.find(fingerprint).cloned() else {
            return Ok(None);
        };
        if record.key_system != chosen.key_system {
            store.evict(fingerprint);
            return Ok(None);
        }
        match self.cdm.load_session(&record.session_id).await {
            Ok(true) => {
                debug!(%fingerprint, session_id = %record.session_id, "restored persisted session");
                self.sessions
                    .insert(fingerprint.to_string(), record.session_id.clone());
                let _ = self.state_tx.send(DriverState::Sessioned);
                Ok(Some(SessionOutcome::Restored {
                    session_id: record.session_id,
                }))
            }
            Ok(false) => {
                warn!(%fingerprint, "persisted session is stale, reopening");
                store.evict(fingerprint);
                Ok(None)
            }
            Err(error) => {
                warn!(%fingerprint, %error, "failed to load persisted session, reopening");
                store.evict(fingerprint);
                Ok(None)
            }
        }
    }

    async fn open_and_license(
        &mut self,
        chosen: &KeySystemConfig,
        init_data_type: &str,
        init_data: &[u8],
        fingerprint: String,
    ) -> DrmResult<SessionOutcome> {
        let (session_id, challenge) = self
            .cdm
            .open_session(init_data_type, init_data, chosen.persistent_license)
            .await?;

        // Transient license-server failures retry inside the driver; only
        // errors the requester marks fatal (or budget exhaustion) escape.
        let requester = Arc::clone(&chosen.license);
        let license = retry_with_backoff(
            &self.license_retry,
            || {
                let challenge = challenge.clone();
                let requester = Arc::clone(&requester);
                async move { requester.request_license(challenge).await }
            },
            |error| !error.is_fatal(),
        )
        .await?;

        self.cdm.update_session(&session_id, &license).await?;

        if chosen.persistent_license {
            if let Some(store) = &mut self.store {
                store.persist(StoredSessionRecord {
                    fingerprint: fingerprint.clone(),
                    session_id: session_id.clone(),
                    key_system: chosen.key_system.clone(),
                });
            }
        }

        debug!(%fingerprint, %session_id, "key session opened");
        self.sessions.insert(fingerprint, session_id.clone());
        let _ = self.state_tx.send(DriverState::Sessioned);
        Ok(SessionOutcome::Opened { session_id })
    }
}
