//! Document encoding.
//!
//! Requests carry a JSON array of documents; the blob stores hold one
//! JSON document per workitem.

use crate::error::{Error, Result};
use crate::model::WorkitemDocument;

pub const APPLICATION_JSON: &str = "application/json";

/// Decode a request body into workitem documents.
///
/// Only `application/json` is accepted; media-type parameters such as
/// `charset` are ignored.
pub fn deserialize_documents(body: &[u8], content_type: &str) -> Result<Vec<WorkitemDocument>> {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case(APPLICATION_JSON) {
        return Err(Error::UnsupportedMediaType(content_type.to_string()));
    }
    serde_json::from_slice(body).map_err(|e| Error::validation(format!("malformed workitem JSON: {e}")))
}

pub fn to_vec(document: &WorkitemDocument) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(document)?)
}

pub fn from_slice(bytes: &[u8]) -> Result<WorkitemDocument> {
    Ok(serde_json::from_slice(bytes)?)
}
