//! Metadata store schema versions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A revision of the metadata index's on-disk layout.
///
/// A newtype rather than an enum: the database may report a version newer
/// than this binary knows about during a rolling upgrade.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SchemaVersion(pub u32);

impl SchemaVersion {
    pub const V1: SchemaVersion = SchemaVersion(1);
    pub const V2: SchemaVersion = SchemaVersion(2);
    pub const V3: SchemaVersion = SchemaVersion(3);
    pub const V4: SchemaVersion = SchemaVersion(4);
    pub const V5: SchemaVersion = SchemaVersion(5);
    pub const V6: SchemaVersion = SchemaVersion(6);
    pub const V7: SchemaVersion = SchemaVersion(7);
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}
