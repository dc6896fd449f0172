//! Datasets carried by DIMSE messages.
//!
//! The engine only looks at a handful of attributes. Everything else about a dataset is the
//! business of the [Dataset] implementation, by default [InMemDicomObject] from dicom-rs.

use std::fmt;
use std::str::FromStr;

use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;

use crate::error::DatasetError;

/// The dataset collaborator: decodes, encodes and answers a few attribute lookups.
pub trait Dataset: Sized + Clone + Send + Sync + 'static {
    fn new_empty() -> Self;

    fn decode(bytes: &[u8], transfer_syntax: &str) -> Result<Self, DatasetError>;

    fn encode(&self, transfer_syntax: &str) -> Result<Vec<u8>, DatasetError>;

    /// String value of an attribute, trimmed of padding.
    fn get_str(&self, tag: Tag) -> Option<String>;

    fn put_str(&mut self, tag: Tag, vr: VR, value: &str);

    /// Items of a Referenced/Failed SOP Sequence.
    fn references(&self, sequence: Tag) -> Vec<SopReference>;

    fn put_references(&mut self, sequence: Tag, references: &[SopReference]);

    fn sop_class_uid(&self) -> Result<String, DatasetError> {
        self.get_str(tags::SOP_CLASS_UID)
            .ok_or(DatasetError::MissingTag("SOPClassUID"))
    }

    fn sop_instance_uid(&self) -> Result<String, DatasetError> {
        self.get_str(tags::SOP_INSTANCE_UID)
            .ok_or(DatasetError::MissingTag("SOPInstanceUID"))
    }
}

/// A reference to a SOP instance, as found in Referenced SOP Sequence and Failed SOP Sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SopReference {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// (0008,1197) Failure Reason, set for instances which could not be committed.
    pub failure_reason: Option<u16>,
}

impl SopReference {
    pub fn new(sop_class_uid: impl Into<String>, sop_instance_uid: impl Into<String>) -> Self {
        Self {
            sop_class_uid: sop_class_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
            failure_reason: None,
        }
    }

    pub fn failed(mut self, reason: u16) -> Self {
        self.failure_reason = Some(reason);
        self
    }
}

/// Failure reasons of Storage Commitment, PS3.4 Table J.3-2.
pub mod failure_reason {
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const NO_SUCH_OBJECT_INSTANCE: u16 = 0x0112;
    pub const RESOURCE_LIMITATION: u16 = 0x0213;
    pub const REFERENCED_SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const CLASS_INSTANCE_CONFLICT: u16 = 0x0119;
    pub const DUPLICATE_TRANSACTION_UID: u16 = 0x0131;
}

fn transfer_syntax(
    uid: &str,
) -> Result<&'static dicom::transfer_syntax::TransferSyntax, DatasetError> {
    TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| DatasetError::UnsupportedTransferSyntax(uid.to_string()))
}

fn trimmed(s: &str) -> String {
    s.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

impl Dataset for InMemDicomObject {
    fn new_empty() -> Self {
        InMemDicomObject::new_empty()
    }

    fn decode(bytes: &[u8], transfer_syntax_uid: &str) -> Result<Self, DatasetError> {
        let ts = transfer_syntax(transfer_syntax_uid)?;
        InMemDicomObject::read_dataset_with_ts(bytes, ts)
            .map_err(|e| DatasetError::Decode(e.to_string()))
    }

    fn encode(&self, transfer_syntax_uid: &str) -> Result<Vec<u8>, DatasetError> {
        let ts = transfer_syntax(transfer_syntax_uid)?;
        let mut out = Vec::with_capacity(128);
        self.write_dataset_with_ts(&mut out, ts)
            .map_err(|e| DatasetError::Encode(e.to_string()))?;
        Ok(out)
    }

    fn get_str(&self, tag: Tag) -> Option<String> {
        self.get(tag)
            .and_then(|e| e.to_str().ok())
            .map(|s| trimmed(&s))
    }

    fn put_str(&mut self, tag: Tag, vr: VR, value: &str) {
        self.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }

    fn references(&self, sequence: Tag) -> Vec<SopReference> {
        let items = match self.get(sequence).map(|e| e.value()) {
            Some(Value::Sequence(seq)) => seq.items(),
            _ => return Vec::new(),
        };
        items
            .iter()
            .filter_map(|item| {
                Some(SopReference {
                    sop_class_uid: item.get_str(tags::REFERENCED_SOP_CLASS_UID)?,
                    sop_instance_uid: item.get_str(tags::REFERENCED_SOP_INSTANCE_UID)?,
                    failure_reason: item
                        .get(tags::FAILURE_REASON)
                        .and_then(|e| e.to_int::<u16>().ok()),
                })
            })
            .collect()
    }

    fn put_references(&mut self, sequence: Tag, references: &[SopReference]) {
        let items: Vec<InMemDicomObject> = references
            .iter()
            .map(|r| {
                let mut item = InMemDicomObject::new_empty();
                item.put_str(tags::REFERENCED_SOP_CLASS_UID, VR::UI, &r.sop_class_uid);
                item.put_str(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, &r.sop_instance_uid);
                if let Some(reason) = r.failure_reason {
                    item.put(DataElement::new(
                        tags::FAILURE_REASON,
                        VR::US,
                        PrimitiveValue::from(reason),
                    ));
                }
                item
            })
            .collect();
        self.put(DataElement::new(
            sequence,
            VR::SQ,
            DataSetSequence::from(items),
        ));
    }
}

/// (0008,0052) Query/Retrieve Level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryLevel {
    Patient,
    Study,
    Series,
    Image,
}

impl QueryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryLevel::Patient => "PATIENT",
            QueryLevel::Study => "STUDY",
            QueryLevel::Series => "SERIES",
            QueryLevel::Image => "IMAGE",
        }
    }

    /// The unique key attribute of this level.
    pub fn unique_key(&self) -> Tag {
        match self {
            QueryLevel::Patient => tags::PATIENT_ID,
            QueryLevel::Study => tags::STUDY_INSTANCE_UID,
            QueryLevel::Series => tags::SERIES_INSTANCE_UID,
            QueryLevel::Image => tags::SOP_INSTANCE_UID,
        }
    }

    /// Read the level of a query identifier.
    pub fn of<D: Dataset>(identifier: &D) -> Result<Self, DatasetError> {
        identifier
            .get_str(tags::QUERY_RETRIEVE_LEVEL)
            .ok_or(DatasetError::MissingTag("QueryRetrieveLevel"))?
            .parse()
    }
}

impl fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryLevel {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            other => Err(DatasetError::Decode(format!(
                "unknown Query/Retrieve Level \"{other}\""
            ))),
        }
    }
}

/// Whether `candidate` matches every key of a query identifier.
///
/// Supports universal matching (empty key), single value matching, wildcard matching with
/// `*` and `?`, and UID list matching. Sequence keys and the Query/Retrieve Level are ignored.
pub fn matches_keys(candidate: &InMemDicomObject, keys: &InMemDicomObject) -> bool {
    keys.iter().all(|key| {
        let tag = key.header().tag;
        if key.header().vr == VR::SQ
            || tag == tags::QUERY_RETRIEVE_LEVEL
            || tag == tags::SPECIFIC_CHARACTER_SET
        {
            return true;
        }
        let wanted = match key.to_str() {
            Ok(s) => trimmed(&s),
            Err(_) => return true,
        };
        if wanted.is_empty() {
            return true;
        }
        let Some(value) = candidate.get_str(tag) else {
            return false;
        };
        if key.header().vr == VR::UI {
            return wanted.split('\\').any(|uid| trimmed(uid) == value);
        }
        wildcard_match(&wanted, &value)
    })
}

/// Build the response identifier of a C-FIND match: every requested key, valued from the match.
pub fn project(candidate: &InMemDicomObject, keys: &InMemDicomObject) -> InMemDicomObject {
    let mut out = InMemDicomObject::new_empty();
    for key in keys.iter() {
        let tag = key.header().tag;
        match candidate.get(tag) {
            Some(found) => out.put(found.clone()),
            None => out.put(key.clone()),
        };
    }
    out
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, v));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            v = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uids;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn patient(id: &str, name: &str, study: &str) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put_str(tags::PATIENT_ID, VR::LO, id);
        obj.put_str(tags::PATIENT_NAME, VR::PN, name);
        obj.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study);
        obj
    }

    #[rstest]
    #[case("DOE^JOHN", "DOE^JOHN", true)]
    #[case("DOE*", "DOE^JOHN", true)]
    #[case("*JOHN", "DOE^JOHN", true)]
    #[case("D?E^*N", "DOE^JOHN", true)]
    #[case("DOE", "DOE^JOHN", false)]
    #[case("*", "", true)]
    #[case("SMITH*", "DOE^JOHN", false)]
    fn test_wildcard_match(#[case] pattern: &str, #[case] value: &str, #[case] expected: bool) {
        assert_eq!(wildcard_match(pattern, value), expected)
    }

    #[test]
    fn test_matches_keys() {
        let candidate = patient("1234", "DOE^JOHN", "1.2.3");
        let mut keys = InMemDicomObject::new_empty();
        keys.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, "STUDY");
        keys.put_str(tags::PATIENT_NAME, VR::PN, "DOE*");
        keys.put_str(tags::STUDY_INSTANCE_UID, VR::UI, "9.9\\1.2.3");
        keys.put_str(tags::STUDY_DATE, VR::DA, "");
        assert!(matches_keys(&candidate, &keys));
        keys.put_str(tags::PATIENT_ID, VR::LO, "5678");
        assert!(!matches_keys(&candidate, &keys));
    }

    #[test]
    fn test_project_keeps_requested_keys_only() {
        let candidate = patient("1234", "DOE^JOHN", "1.2.3");
        let mut keys = InMemDicomObject::new_empty();
        keys.put_str(tags::PATIENT_ID, VR::LO, "");
        keys.put_str(tags::STUDY_DATE, VR::DA, "");
        let projected = project(&candidate, &keys);
        assert_eq!(projected.get_str(tags::PATIENT_ID).as_deref(), Some("1234"));
        assert_eq!(projected.get_str(tags::STUDY_DATE).as_deref(), Some(""));
        assert_eq!(projected.get_str(tags::PATIENT_NAME), None);
    }

    #[test]
    fn test_references_survive_encoding() {
        let refs = vec![
            SopReference::new(uids::CT_IMAGE_STORAGE, "1.2.3.1"),
            SopReference::new(uids::CT_IMAGE_STORAGE, "1.2.3.2")
                .failed(failure_reason::NO_SUCH_OBJECT_INSTANCE),
        ];
        let mut obj = InMemDicomObject::new_empty();
        obj.put_str(tags::TRANSACTION_UID, VR::UI, "2.25.1");
        obj.put_references(tags::REFERENCED_SOP_SEQUENCE, &refs);
        let bytes = obj.encode(uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        let decoded = InMemDicomObject::decode(&bytes, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert_eq!(decoded.references(tags::REFERENCED_SOP_SEQUENCE), refs);
        assert_eq!(decoded.get_str(tags::TRANSACTION_UID).as_deref(), Some("2.25.1"));
    }

    #[test]
    fn test_unknown_transfer_syntax() {
        assert!(matches!(
            InMemDicomObject::decode(&[], "1.2.3.4.5.6"),
            Err(DatasetError::UnsupportedTransferSyntax(_))
        ))
    }

    #[rstest]
    #[case("STUDY", QueryLevel::Study)]
    #[case("IMAGE ", QueryLevel::Image)]
    fn test_query_level(#[case] given: &str, #[case] expected: QueryLevel) {
        assert_eq!(given.parse::<QueryLevel>().unwrap(), expected)
    }
}
