use serde::{Deserialize, Serialize};

/// Well-known metadata attached to a resource alongside its DICOM tags.
/// `Custom` covers caller-defined keys above the reserved range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum MetadataKind {
    Instance,
    LastUpdate,
    ModifiedFrom,
    AnonymizedFrom,
    MainDicomTagsSignature,
    RemoteAet,
    ReceptionDate,
    TransferSyntax,
    SopClassUid,
    IndexInSeries,
    Origin,
    Custom(u16),
}

impl std::fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataKind::Instance => write!(f, "Instance"),
            MetadataKind::LastUpdate => write!(f, "LastUpdate"),
            MetadataKind::ModifiedFrom => write!(f, "ModifiedFrom"),
            MetadataKind::AnonymizedFrom => write!(f, "AnonymizedFrom"),
            MetadataKind::MainDicomTagsSignature => write!(f, "MainDicomTagsSignature"),
            MetadataKind::RemoteAet => write!(f, "RemoteAet"),
            MetadataKind::ReceptionDate => write!(f, "ReceptionDate"),
            MetadataKind::TransferSyntax => write!(f, "TransferSyntax"),
            MetadataKind::SopClassUid => write!(f, "SopClassUid"),
            MetadataKind::IndexInSeries => write!(f, "IndexInSeries"),
            MetadataKind::Origin => write!(f, "Origin"),
            MetadataKind::Custom(id) => write!(f, "Custom({})", id),
        }
    }
}

impl std::str::FromStr for MetadataKind {
    type Err = ();

    /// Parses `Display`'s own output, including the `Custom(<id>)` shape, so
    /// the database wrapper can round-trip the TEXT column it stores this as.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Instance" => MetadataKind::Instance,
            "LastUpdate" => MetadataKind::LastUpdate,
            "ModifiedFrom" => MetadataKind::ModifiedFrom,
            "AnonymizedFrom" => MetadataKind::AnonymizedFrom,
            "MainDicomTagsSignature" => MetadataKind::MainDicomTagsSignature,
            "RemoteAet" => MetadataKind::RemoteAet,
            "ReceptionDate" => MetadataKind::ReceptionDate,
            "TransferSyntax" => MetadataKind::TransferSyntax,
            "SopClassUid" => MetadataKind::SopClassUid,
            "IndexInSeries" => MetadataKind::IndexInSeries,
            "Origin" => MetadataKind::Origin,
            other => {
                let id = other
                    .strip_prefix("Custom(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|id| id.parse::<u16>().ok())
                    .ok_or(())?;
                MetadataKind::Custom(id)
            }
        })
    }
}

/// Entries appended to the change log as resources are created, stabilize, or
/// are deleted. `StablePatient`/`StableStudy`/`StableSeries` fire once the
/// resource's inactivity timer elapses with no further children arriving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ChangeKind {
    NewInstance,
    NewSeries,
    NewStudy,
    NewPatient,
    StablePatient,
    StableStudy,
    StableSeries,
    UpdatedAttachment,
    UpdatedMetadata,
    Deleted,
    /// A series instance arrived claiming a study it does not currently
    /// belong to. The series keeps its first-seen parent; this entry exists
    /// so the inconsistency is visible in the log rather than silently lost.
    InconsistentParent,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NewInstance" => ChangeKind::NewInstance,
            "NewSeries" => ChangeKind::NewSeries,
            "NewStudy" => ChangeKind::NewStudy,
            "NewPatient" => ChangeKind::NewPatient,
            "StablePatient" => ChangeKind::StablePatient,
            "StableStudy" => ChangeKind::StableStudy,
            "StableSeries" => ChangeKind::StableSeries,
            "UpdatedAttachment" => ChangeKind::UpdatedAttachment,
            "UpdatedMetadata" => ChangeKind::UpdatedMetadata,
            "Deleted" => ChangeKind::Deleted,
            "InconsistentParent" => ChangeKind::InconsistentParent,
            _ => return Err(()),
        })
    }
}

/// How an attachment is stored on disk relative to the bytes Orthanc received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CompressionType {
    None,
    ZlibWithSizePrefix,
}

/// A single constraint within a C-FIND/find-matcher query against one tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentifierConstraint {
    Equal(String),
    GreaterOrEqual(String),
    SmallerOrEqual(String),
    Wildcard(String),
}

impl IdentifierConstraint {
    /// Translate a DICOM wildcard pattern (`*` any run, `?` single char) into
    /// a SQL `LIKE` pattern, escaping any literal `%`/`_`/`\` first.
    pub fn wildcard_to_like(pattern: &str) -> String {
        let mut out = String::with_capacity(pattern.len());
        for c in pattern.chars() {
            match c {
                '%' => out.push_str("\\%"),
                '_' => out.push_str("\\_"),
                '\\' => out.push_str("\\\\"),
                '*' => out.push('%'),
                '?' => out.push('_'),
                other => out.push(other),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_kind_displays_custom_with_its_id() {
        assert_eq!(MetadataKind::Custom(1024).to_string(), "Custom(1024)");
    }

    #[test]
    fn wildcard_translates_star_and_question_mark() {
        assert_eq!(IdentifierConstraint::wildcard_to_like("A*B?"), "A%B_");
    }

    #[test]
    fn wildcard_escapes_literal_sql_metacharacters() {
        assert_eq!(IdentifierConstraint::wildcard_to_like("100%_done"), "100\\%\\_done");
    }

    #[test]
    fn change_kind_round_trips_through_json() {
        let json = serde_json::to_string(&ChangeKind::StableStudy).unwrap();
        assert_eq!(json, "\"StableStudy\"");
        let back: ChangeKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ChangeKind::StableStudy);
    }

    #[test]
    fn metadata_kind_round_trips_through_display_and_from_str() {
        use std::str::FromStr;
        assert_eq!(MetadataKind::from_str("RemoteAet"), Ok(MetadataKind::RemoteAet));
        assert_eq!(MetadataKind::from_str("Custom(7)"), Ok(MetadataKind::Custom(7)));
        assert_eq!(MetadataKind::from_str(&MetadataKind::Custom(99).to_string()), Ok(MetadataKind::Custom(99)));
    }

    #[test]
    fn change_kind_round_trips_through_display_and_from_str() {
        use std::str::FromStr;
        assert_eq!(ChangeKind::from_str("InconsistentParent"), Ok(ChangeKind::InconsistentParent));
        assert_eq!(ChangeKind::from_str("bogus"), Err(()));
    }
}
