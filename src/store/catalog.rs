//! Query-tag catalog loaded from a TOML file.
//!
//! ```toml
//! [[tag]]
//! tag = "00100020"
//! vr = "LO"
//!
//! [[tag]]
//! tag = "(0074,1202)"
//! vr = "LO"
//! kind = "extended"
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{QueryTag, QueryTagKind, Tag, Vr};
use crate::store::QueryTagSource;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tag: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    tag: String,
    vr: String,
    #[serde(default = "default_kind")]
    kind: QueryTagKind,
}

fn default_kind() -> QueryTagKind {
    QueryTagKind::Extended
}

/// Parse a TOML catalog into query tags.
pub fn parse_catalog(content: &str) -> Result<Vec<QueryTag>> {
    let file: CatalogFile =
        toml::from_str(content).map_err(|e| Error::Config(format!("bad tag catalog: {e}")))?;
    file.tag
        .into_iter()
        .map(|entry| {
            Ok(QueryTag {
                tag: entry.tag.parse::<Tag>()?,
                vr: entry.vr.parse::<Vr>()?,
                kind: entry.kind,
            })
        })
        .collect()
}

/// Reads the catalog file on every fetch; caching is the
/// [`QueryTagService`](crate::query_tags::QueryTagService)'s job.
#[derive(Debug, Clone)]
pub struct TomlQueryTagSource {
    path: PathBuf,
}

impl TomlQueryTagSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QueryTagSource for TomlQueryTagSource {
    async fn get_query_tags(&self) -> Result<Vec<QueryTag>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Config(format!("cannot read tag catalog {}: {e}", self.path.display()))
        })?;
        parse_catalog(&content)
    }
}
