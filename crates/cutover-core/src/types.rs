//! Shared types used across cutover crates.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of a pipeline run.
pub type RunId = String;

/// Name of a deployment group (one per environment).
pub type GroupName = String;

/// Kind of a pipeline action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    SourceCheckout,
    Build,
    Approval,
    EcsDeploy,
    BlueGreenDeploy,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::SourceCheckout => "source-checkout",
            ActionKind::Build => "build",
            ActionKind::Approval => "approval",
            ActionKind::EcsDeploy => "ecs-deploy",
            ActionKind::BlueGreenDeploy => "blue-green-deploy",
        }
    }

    /// Whether this kind hands a revision to a deployment group.
    pub fn is_deploy(&self) -> bool {
        matches!(self, ActionKind::EcsDeploy | ActionKind::BlueGreenDeploy)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Opaque reference to an artifact payload: where it lives and what it hashes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Storage location understood by the blob store that wrote it.
    pub location: String,
    /// `sha256:<hex>` content digest.
    pub digest: String,
    /// Payload size in bytes.
    pub size: u64,
}

impl PayloadRef {
    /// Build a content-addressed reference under `prefix`.
    pub fn for_bytes(prefix: &str, bytes: &[u8]) -> Self {
        let digest = content_digest(bytes);
        let hex = digest.trim_start_matches("sha256:");
        Self {
            location: format!("{}/{}", prefix.trim_end_matches('/'), hex),
            digest,
            size: bytes.len() as u64,
        }
    }

    /// Check `bytes` against the recorded digest.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        self.size == bytes.len() as u64 && self.digest == content_digest(bytes)
    }
}

/// Compute the `sha256:<hex>` digest of a payload.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_prefixed() {
        let d = content_digest(b"hello");
        assert_eq!(
            d,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn payload_ref_location_uses_digest() {
        let p = PayloadRef::for_bytes("mem://artifacts/", b"hello");
        assert!(p.location.starts_with("mem://artifacts/2cf24dba"));
        assert_eq!(p.size, 5);
        assert!(p.verify(b"hello"));
        assert!(!p.verify(b"hellO"));
    }

    #[test]
    fn action_kind_serde_is_kebab_case() {
        let json = serde_json::to_string(&ActionKind::BlueGreenDeploy).unwrap();
        assert_eq!(json, "\"blue-green-deploy\"");
        assert!(ActionKind::EcsDeploy.is_deploy());
        assert!(!ActionKind::Approval.is_deploy());
    }
}
