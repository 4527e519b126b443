//! Workitem documents: an ordered set of DICOM attributes.
//!
//! Documents are stored verbatim in the blob store. The JSON shape follows
//! the DICOM JSON model closely enough for round-tripping the attributes the
//! engine cares about: `{"00741000": {"vr": "CS", "Value": ["SCHEDULED"]}}`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

/// A DICOM attribute tag, `(group,element)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(u32);

impl Tag {
    pub const AFFECTED_SOP_INSTANCE_UID: Tag = Tag::new(0x0000, 0x1000);
    pub const REQUESTED_SOP_INSTANCE_UID: Tag = Tag::new(0x0000, 0x1001);
    pub const SOP_CLASS_UID: Tag = Tag::new(0x0008, 0x0016);
    pub const SOP_INSTANCE_UID: Tag = Tag::new(0x0008, 0x0018);
    pub const TRANSACTION_UID: Tag = Tag::new(0x0008, 0x1195);
    pub const PATIENT_NAME: Tag = Tag::new(0x0010, 0x0010);
    pub const PATIENT_ID: Tag = Tag::new(0x0010, 0x0020);
    pub const SCHEDULED_PROCEDURE_STEP_START_DATE_TIME: Tag = Tag::new(0x0040, 0x4005);
    pub const PROCEDURE_STEP_CANCELLATION_DATE_TIME: Tag = Tag::new(0x0040, 0x4052);
    pub const PROCEDURE_STEP_STATE: Tag = Tag::new(0x0074, 0x1000);
    pub const SCHEDULED_PROCEDURE_STEP_PRIORITY: Tag = Tag::new(0x0074, 0x1200);
    pub const WORKLIST_LABEL: Tag = Tag::new(0x0074, 0x1202);
    pub const PROCEDURE_STEP_LABEL: Tag = Tag::new(0x0074, 0x1204);
    pub const REASON_FOR_CANCELLATION: Tag = Tag::new(0x0074, 0x1238);

    pub const fn new(group: u16, element: u16) -> Self {
        Self(((group as u32) << 16) | element as u32)
    }

    pub const fn group(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn element(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// The 8 hex digit form used as a JSON key and as the index tag path.
    pub fn to_path(self) -> String {
        format!("{:08X}", self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:04X},{:04X})", self.group(), self.element())
    }
}

impl FromStr for Tag {
    type Err = Error;

    /// Accepts `00741000` or `(0074,1000)`.
    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '(' | ')' | ','))
            .collect();
        if digits.len() != 8 {
            return Err(Error::validation(format!("malformed tag: {s}")));
        }
        u32::from_str_radix(&digits, 16)
            .map(Tag)
            .map_err(|_| Error::validation(format!("malformed tag: {s}")))
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_path())
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Value representation
// ---------------------------------------------------------------------------

/// DICOM value representation of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vr {
    AE,
    AS,
    CS,
    DA,
    DT,
    LO,
    LT,
    PN,
    SH,
    SQ,
    ST,
    TM,
    UI,
    US,
    UT,
}

impl fmt::Display for Vr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FromStr for Vr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_uppercase()))
            .map_err(|_| Error::validation(format!("unknown value representation: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Element + Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub vr: Vr,
    #[serde(rename = "Value", default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<serde_json::Value>,
}

impl Element {
    pub fn string(vr: Vr, value: impl Into<String>) -> Self {
        Self {
            vr,
            values: vec![serde_json::Value::String(value.into())],
        }
    }

    /// First value rendered as text. Person names use their alphabetic form.
    pub fn first_text(&self) -> Option<&str> {
        match self.values.first()? {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(map) if self.vr == Vr::PN => {
                map.get("Alphabetic").and_then(|v| v.as_str())
            }
            _ => None,
        }
    }
}

/// The full workitem document held by the blob store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkitemDocument {
    elements: BTreeMap<Tag, Element>,
}

impl WorkitemDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: Tag) -> Option<&Element> {
        self.elements.get(&tag)
    }

    pub fn get_string(&self, tag: Tag) -> Option<&str> {
        self.elements.get(&tag).and_then(Element::first_text)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.elements.contains_key(&tag)
    }

    pub fn insert(&mut self, tag: Tag, element: Element) -> Option<Element> {
        self.elements.insert(tag, element)
    }

    pub fn set_string(&mut self, tag: Tag, vr: Vr, value: impl Into<String>) {
        self.elements.insert(tag, Element::string(vr, value));
    }

    pub fn remove(&mut self, tag: Tag) -> Option<Element> {
        self.elements.remove(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &Element)> {
        self.elements.iter().map(|(tag, element)| (*tag, element))
    }

    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.elements.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The workitem UID, carried as AffectedSOPInstanceUID.
    pub fn workitem_uid(&self) -> Option<&str> {
        self.get_string(Tag::AFFECTED_SOP_INSTANCE_UID)
            .filter(|uid| !uid.trim().is_empty())
    }

    pub fn transaction_uid(&self) -> Option<&str> {
        self.get_string(Tag::TRANSACTION_UID)
            .filter(|uid| !uid.trim().is_empty())
    }
}

impl FromIterator<(Tag, Element)> for WorkitemDocument {
    fn from_iter<I: IntoIterator<Item = (Tag, Element)>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

/// Is `uid` a syntactically valid DICOM UID?
///
/// Components of digits separated by dots, no leading zeros, at most 64
/// characters.
pub fn is_valid_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    uid.split('.').all(|component| {
        !component.is_empty()
            && component.bytes().all(|b| b.is_ascii_digit())
            && (component == "0" || !component.starts_with('0'))
    })
}
