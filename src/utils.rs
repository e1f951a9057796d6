use crate::DeployTarget;
use crate::error::DeployError;

// For signature verification
use hmac::{Hmac, Mac};
use sha2::Sha256;
type HmacSha256 = Hmac<Sha256>;

/// Verifies a GitHub-style webhook signature header against `payload`.
///
/// The header is expected to be `"sha256="` followed by the lowercase hex
/// HMAC-SHA256 digest of the payload keyed by `secret`. The comparison
/// scans every byte even after a mismatch so that response time does not
/// leak the position of the first differing byte; only a length mismatch
/// returns early.
///
/// An empty secret never verifies anything: an unconfigured server must
/// reject deliveries, not accept them all.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_header: &str) -> bool {
    if secret.is_empty() {
        return false;
    }

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    constant_time_eq(expected.as_bytes(), signature_header.as_bytes())
}

/// Constant-time byte comparison. Length disclosure is acceptable here;
/// the digest length is public anyway.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Finds the deploy target for a repository name.
///
/// Tries an exact match first, then falls back to the first
/// case-insensitive match. The lookup is read-only; the fallback never
/// writes an alias back into the table.
pub fn resolve_target<'a>(
    targets: &'a [DeployTarget],
    repo_name: &str,
) -> Result<&'a DeployTarget, DeployError> {
    targets
        .iter()
        .find(|t| t.repository == repo_name)
        .or_else(|| {
            targets
                .iter()
                .find(|t| t.repository.eq_ignore_ascii_case(repo_name))
        })
        .ok_or_else(|| DeployError::UnknownRepository(repo_name.to_string()))
}
