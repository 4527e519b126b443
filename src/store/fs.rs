//! Filesystem blob store.
//!
//! Documents live at `<root>/<partition>/<uid>/<key>.json`. Writes go to a
//! temporary sibling first and are renamed into place, so readers never see
//! a half-written document.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::codec;
use crate::error::{Error, Result};
use crate::model::{WorkitemDocument, WorkitemIdentifier};
use crate::store::BlobStore;

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, identifier: &WorkitemIdentifier) -> Result<PathBuf> {
        let uid = identifier.workitem_uid();
        // UIDs are digits and dots; anything else must not reach the path.
        if uid.is_empty()
            || uid.starts_with('.')
            || !uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(Error::validation(format!(
                "workitem UID not usable as a blob path: {uid}"
            )));
        }
        Ok(self
            .root
            .join(identifier.partition_key().to_string())
            .join(uid)
            .join(format!("{}.json", identifier.workitem_key())))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        identifier: &WorkitemIdentifier,
        document: &WorkitemDocument,
    ) -> Result<()> {
        let path = self.path_for(identifier)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = codec::to_vec(document)?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        let written = match tokio::fs::write(&tmp, &bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        // A partial temp file must not outlive a failed write or rename.
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, identifier: &WorkitemIdentifier) -> Result<WorkitemDocument> {
        let path = self.path_for(identifier)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => codec::from_slice(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("workitem document {identifier}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, identifier: &WorkitemIdentifier) -> Result<()> {
        let path = self.path_for(identifier)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
