//! Cached access to the indexable query tags.
//!
//! The tag set is fetched once and reused for every index write until
//! [`QueryTagService::reload`] is called. The cache belongs to the service
//! instance; whoever builds the orchestrator owns it.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::model::QueryTag;
use crate::store::QueryTagSource;

pub struct QueryTagService {
    source: Arc<dyn QueryTagSource>,
    cache: RwLock<Option<Arc<[QueryTag]>>>,
}

impl QueryTagService {
    pub fn new(source: Arc<dyn QueryTagSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
        }
    }

    /// The cached tag set, fetching it on first use.
    pub async fn get_tags(&self) -> Result<Arc<[QueryTag]>> {
        if let Some(tags) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(tags));
        }

        // Holding the write lock across the fetch keeps concurrent first
        // callers from all hitting the source.
        let mut cache = self.cache.write().await;
        if let Some(tags) = cache.as_ref() {
            return Ok(Arc::clone(tags));
        }
        let tags: Arc<[QueryTag]> = self.source.get_query_tags().await?.into();
        debug!(count = tags.len(), "loaded query tags");
        *cache = Some(Arc::clone(&tags));
        Ok(tags)
    }

    /// Refetch the tag set, replacing the cache. On failure the previous
    /// cache is kept.
    pub async fn reload(&self) -> Result<Arc<[QueryTag]>> {
        let tags: Arc<[QueryTag]> = self.source.get_query_tags().await?.into();
        debug!(count = tags.len(), "reloaded query tags");
        *self.cache.write().await = Some(Arc::clone(&tags));
        Ok(tags)
    }

    /// Drop the cached set; the next `get_tags` refetches.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
