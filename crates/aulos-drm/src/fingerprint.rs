use sha2::{Digest, Sha256};

/// Stable fingerprint of an encrypted event's init data.
///
/// The init-data type participates so identical bytes arriving under a
/// different container scheme open distinct sessions.
#[must_use]
pub fn init_data_fingerprint(init_data_type: &str, init_data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(init_data_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(init_data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
