//! Core data model.
//!
//! A workitem is a unit of deferred clinical work. Its identity and
//! lifecycle state live in the metadata index; the full document lives in
//! the blob store.

pub mod document;
pub mod query_tag;
pub mod schema;
pub mod workitem;

pub use document::{Element, Tag, Vr, WorkitemDocument, is_valid_uid};
pub use query_tag::{QueryTag, QueryTagKind, extract_tag_values};
pub use schema::SchemaVersion;
pub use workitem::{
    Precondition, StateTransition, WorkitemIdentifier, WorkitemMetadataEntry, WorkitemState,
};
