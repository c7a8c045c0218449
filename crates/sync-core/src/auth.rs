//! Shared-secret credential and the gate that checks it.
//!
//! The credential is configured identically on client and server. It is sent
//! as `Authorization: Bearer <secret>` and never written to logs: `Debug` is
//! redacted and there is no `Display` impl.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Shared transfer secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn digest(&self) -> [u8; 32] {
        digest(&self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

fn digest(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Accepts or rejects a presented credential.
///
/// Only the SHA-256 digest of the expected secret is kept. Comparison folds
/// over every byte of both digests, so the work done does not depend on where
/// the first mismatch is.
#[derive(Clone)]
pub struct AuthGate {
    expected: [u8; 32],
}

impl AuthGate {
    pub fn new(credential: &Credential) -> Self {
        Self {
            expected: credential.digest(),
        }
    }

    /// Check a raw secret.
    pub fn authenticate(&self, presented: Option<&str>) -> bool {
        let Some(presented) = presented else {
            return false;
        };
        let presented = digest(presented);
        self.expected
            .iter()
            .zip(presented.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Check an `Authorization` header value (`Bearer <secret>`).
    pub fn authenticate_header(&self, header: Option<&str>) -> bool {
        let token = header.and_then(|h| h.strip_prefix("Bearer ")).map(str::trim);
        self.authenticate(token)
    }
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticate_accepts_matching_secret() {
        let gate = AuthGate::new(&Credential::new("s3cret"));
        assert!(gate.authenticate(Some("s3cret")));
    }

    #[test]
    fn test_authenticate_rejects_wrong_or_missing_secret() {
        let gate = AuthGate::new(&Credential::new("s3cret"));
        assert!(!gate.authenticate(Some("s3cre")));
        assert!(!gate.authenticate(Some("s3cret ")));
        assert!(!gate.authenticate(Some("")));
        assert!(!gate.authenticate(None));
    }

    #[test]
    fn test_authenticate_header() {
        let credential = Credential::new("token-123");
        let gate = AuthGate::new(&credential);

        assert!(gate.authenticate_header(Some(&credential.bearer())));
        assert!(!gate.authenticate_header(Some("Basic dG9rZW4tMTIz")));
        assert!(!gate.authenticate_header(Some("token-123")));
        assert!(!gate.authenticate_header(None));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("do-not-print");
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("do-not-print"));

        let gate = AuthGate::new(&credential);
        assert!(!format!("{:?}", gate).contains("do-not-print"));
    }

    #[test]
    fn test_credential_deserializes_from_string() {
        let credential: Credential = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(credential, Credential::new("abc"));
    }
}
