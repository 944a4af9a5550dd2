use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A DICOM tag, group and element, e.g. `(0010,0010)` for PatientName.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DicomTag(pub u16, pub u16);

impl DicomTag {
    pub fn group(&self) -> u16 {
        self.0
    }

    pub fn element(&self) -> u16 {
        self.1
    }

    /// Parse the conventional `GGGG,EEEE` hex form, case-insensitive.
    pub fn parse(s: &str) -> Option<DicomTag> {
        let (g, e) = s.split_once(',')?;
        let group = u16::from_str_radix(g.trim(), 16).ok()?;
        let element = u16::from_str_radix(e.trim(), 16).ok()?;
        Some(DicomTag(group, element))
    }
}

impl std::fmt::Display for DicomTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x},{:04x}", self.0, self.1)
    }
}

/// The closed set of value representations this store round-trips. Unknown
/// VRs read off the wire are rejected rather than silently widened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueRepresentation {
    AE,
    AS,
    AT,
    CS,
    DA,
    DS,
    DT,
    FL,
    FD,
    IS,
    LO,
    LT,
    OB,
    OD,
    OF,
    OW,
    PN,
    SH,
    SL,
    SQ,
    SS,
    ST,
    TM,
    UI,
    UL,
    UN,
    US,
    UT,
}

impl std::fmt::Display for ValueRepresentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single tag's value, shaped for the external JSON contract: string values
/// round-trip as `Content` strings, binary values as a base64-encoded
/// `Content` string, absent values as `Null` with no `Content` at all.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Null,
    String(String),
    Binary(Vec<u8>),
}

impl TagValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TagValue::Null)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "Type", content = "Content")]
enum TagValueWire {
    Null,
    String(String),
    Binary(String),
}

impl Serialize for TagValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            TagValue::Null => TagValueWire::Null,
            TagValue::String(s) => TagValueWire::String(s.clone()),
            TagValue::Binary(bytes) => {
                TagValueWire::Binary(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TagValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = TagValueWire::deserialize(deserializer)?;
        Ok(match wire {
            TagValueWire::Null => TagValue::Null,
            TagValueWire::String(s) => TagValue::String(s),
            TagValueWire::Binary(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(serde::de::Error::custom)?;
                TagValue::Binary(bytes)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_parses_conventional_hex_form() {
        assert_eq!(DicomTag::parse("0010,0010"), Some(DicomTag(0x0010, 0x0010)));
        assert_eq!(DicomTag::parse("not-a-tag"), None);
    }

    #[test]
    fn tag_display_round_trips_through_parse() {
        let tag = DicomTag(0x0008, 0x0018);
        assert_eq!(DicomTag::parse(&tag.to_string()), Some(tag));
    }

    #[test]
    fn tag_value_serializes_to_type_content_shape() {
        let v = TagValue::String("ORTHANC".into());
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["Type"], "String");
        assert_eq!(json["Content"], "ORTHANC");
    }

    #[test]
    fn null_tag_value_has_no_content_field_mismatch() {
        let v = TagValue::Null;
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["Type"], "Null");
        let back: TagValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, TagValue::Null);
    }

    #[test]
    fn binary_tag_value_serializes_content_as_base64() {
        let v = TagValue::Binary(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["Type"], "Binary");
        assert_eq!(json["Content"], "3q2+7w==");
        let back: TagValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }
}
