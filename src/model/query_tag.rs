//! Indexable query tags.

use serde::{Deserialize, Serialize};

use crate::model::document::{Tag, Vr, WorkitemDocument};

/// How a query tag came to be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTagKind {
    /// Always indexed; part of the base UPS query model.
    Core,
    /// Added by an operator.
    Extended,
}

/// A tag the metadata index stores values for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryTag {
    pub tag: Tag,
    pub vr: Vr,
    pub kind: QueryTagKind,
}

impl QueryTag {
    pub const fn core(tag: Tag, vr: Vr) -> Self {
        Self {
            tag,
            vr,
            kind: QueryTagKind::Core,
        }
    }

    /// The core UPS query tags.
    pub fn defaults() -> Vec<QueryTag> {
        vec![
            QueryTag::core(Tag::PATIENT_NAME, Vr::PN),
            QueryTag::core(Tag::PATIENT_ID, Vr::LO),
            QueryTag::core(Tag::SCHEDULED_PROCEDURE_STEP_START_DATE_TIME, Vr::DT),
            QueryTag::core(Tag::PROCEDURE_STEP_STATE, Vr::CS),
            QueryTag::core(Tag::SCHEDULED_PROCEDURE_STEP_PRIORITY, Vr::CS),
            QueryTag::core(Tag::WORKLIST_LABEL, Vr::LO),
            QueryTag::core(Tag::PROCEDURE_STEP_LABEL, Vr::LO),
        ]
    }
}

/// Values of `tags` present in `document`, ordered by tag.
pub fn extract_tag_values(document: &WorkitemDocument, tags: &[QueryTag]) -> Vec<(Tag, String)> {
    let mut values: Vec<(Tag, String)> = tags
        .iter()
        .filter_map(|query_tag| {
            document
                .get_string(query_tag.tag)
                .map(|value| (query_tag.tag, value.to_string()))
        })
        .collect();
    values.sort_by_key(|(tag, _)| *tag);
    values.dedup_by_key(|(tag, _)| *tag);
    values
}
