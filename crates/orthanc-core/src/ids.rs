use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::level::ResourceLevel;

/// A dense, process-lifetime-unique row identifier assigned by the database
/// wrapper on insert. Never reused, even after the row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InternalId(pub i64);

impl InternalId {
    pub fn new(id: i64) -> Self {
        InternalId(id)
    }
}

impl std::fmt::Display for InternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 40-hex-digit identifier grouped `8-8-8-8-8`, stable across processes.
/// Computed as SHA-1 over the concatenation of the level-defining DICOM UIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicId(pub String);

impl PublicId {
    /// Compute the public id for `level` from its defining UIDs, in the order
    /// PatientID, StudyInstanceUID, SeriesInstanceUID, SOPInstanceUID —
    /// truncated to however many the level needs.
    pub fn compute(level: ResourceLevel, uids: &[&str]) -> Self {
        let needed = match level {
            ResourceLevel::Patient => 1,
            ResourceLevel::Study => 2,
            ResourceLevel::Series => 3,
            ResourceLevel::Instance => 4,
        };
        assert!(
            uids.len() >= needed,
            "computing a {} public id needs {} UIDs, got {}",
            level,
            needed,
            uids.len()
        );

        let mut hasher = Sha1::new();
        for uid in &uids[..needed] {
            hasher.update(uid.as_bytes());
            hasher.update(b"|");
        }
        let digest = hasher.finalize();
        PublicId(group_hex(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PublicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Format a 20-byte SHA-1 digest as 40 lowercase hex chars grouped `8-8-8-8-8`.
fn group_hex(digest: &[u8]) -> String {
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let groups = [&hex[0..8], &hex[8..16], &hex[16..24], &hex[24..32], &hex[32..40]];
    groups.join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_id_is_40_hex_digits_grouped() {
        let id = PublicId::compute(ResourceLevel::Patient, &["PAT001"]);
        assert_eq!(id.0.len(), 40 + 4); // 40 hex chars + 4 dashes
        let groups: Vec<&str> = id.0.split('-').collect();
        assert_eq!(groups.len(), 5);
        for g in groups {
            assert_eq!(g.len(), 8);
            assert!(g.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn public_id_is_deterministic() {
        let a = PublicId::compute(ResourceLevel::Study, &["PAT001", "STU001"]);
        let b = PublicId::compute(ResourceLevel::Study, &["PAT001", "STU001"]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_uids_yield_different_ids() {
        let a = PublicId::compute(ResourceLevel::Patient, &["PAT001"]);
        let b = PublicId::compute(ResourceLevel::Patient, &["PAT002"]);
        assert_ne!(a, b);
    }

    #[test]
    fn instance_id_depends_on_full_ancestry() {
        // Same SOPInstanceUID under a different series must hash differently.
        let a = PublicId::compute(ResourceLevel::Instance, &["P", "S", "SE1", "I1"]);
        let b = PublicId::compute(ResourceLevel::Instance, &["P", "S", "SE2", "I1"]);
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic]
    fn compute_panics_when_too_few_uids_given() {
        PublicId::compute(ResourceLevel::Series, &["P", "S"]);
    }
}
