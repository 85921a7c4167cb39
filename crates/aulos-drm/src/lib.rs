#![forbid(unsafe_code)]

//! Content-protection driver.
//!
//! Owns the key-session lifecycle: on the first `encrypted` event it picks
//! the first key system the environment accepts, creates and attaches media
//! keys, optionally provisions a server certificate, then opens one session
//! per distinct init-data fingerprint. Subsequent events with a known
//! fingerprint are no-ops; a changed key-system configuration mid-playback
//! is a fatal error.
//!
//! Most platforms allow a single CDM per presentation element, so exactly
//! one driver should be active per element; the orchestrator asserts this.

mod config;
mod driver;
mod error;
mod fingerprint;
mod store;

pub use config::{Cdm, KeySystemConfig, LicenseRequester, LicenseStorage, StoredSessionRecord};
pub use driver::{DriverState, ProtectionDriver, SessionOutcome};
pub use error::{DrmError, DrmResult};
pub use fingerprint::init_data_fingerprint;
