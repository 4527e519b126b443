//! Schema-versioned access to the metadata index.
//!
//! Each schema version declares an [`IndexOperationSet`]: the operations
//! whose on-disk representation changed at that version. Operations a
//! version leaves unset are inherited from the nearest lower version that
//! sets them. Resolution picks the greatest declared version not newer than
//! the deployed schema, so a binary running ahead of the schema falls back
//! to older behavior and a binary running behind it keeps using the newest
//! version it knows.
//!
//! `C` is the backend context handed to every operation (a `PgPool` for the
//! Postgres store).

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{
    Precondition, QueryTag, SchemaVersion, StateTransition, Tag, WorkitemDocument,
    WorkitemIdentifier, WorkitemMetadataEntry,
};
use crate::store::{IndexStore, QueryTagSource, SchemaVersionProbe};
use crate::telemetry::metrics;

pub type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub type AddEntryOp<C> =
    for<'a> fn(&'a C, i32, &'a WorkitemDocument, &'a [QueryTag]) -> OpFuture<'a, i64>;
pub type GetEntryOp<C> = for<'a> fn(&'a C, i32, &'a str) -> OpFuture<'a, WorkitemMetadataEntry>;
pub type DeleteEntryOp<C> = for<'a> fn(&'a C, i32, &'a str) -> OpFuture<'a, ()>;
pub type UpdateStateOp<C> =
    for<'a> fn(&'a C, &'a WorkitemIdentifier, &'a StateTransition) -> OpFuture<'a, ()>;
pub type UpdateTagsOp<C> = for<'a> fn(
    &'a C,
    &'a WorkitemIdentifier,
    &'a Precondition,
    &'a [(Tag, String)],
) -> OpFuture<'a, i64>;
pub type GetQueryTagsOp<C> = for<'a> fn(&'a C) -> OpFuture<'a, Vec<QueryTag>>;

// ---------------------------------------------------------------------------
// Operation sets
// ---------------------------------------------------------------------------

/// The operations of the index store, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexOperation {
    AddEntry,
    GetEntry,
    DeleteEntry,
    UpdateState,
    UpdateTags,
    GetQueryTags,
}

impl IndexOperation {
    pub const ALL: [IndexOperation; 6] = [
        IndexOperation::AddEntry,
        IndexOperation::GetEntry,
        IndexOperation::DeleteEntry,
        IndexOperation::UpdateState,
        IndexOperation::UpdateTags,
        IndexOperation::GetQueryTags,
    ];
}

impl fmt::Display for IndexOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexOperation::AddEntry => "add_entry",
            IndexOperation::GetEntry => "get_entry",
            IndexOperation::DeleteEntry => "delete_entry",
            IndexOperation::UpdateState => "update_state",
            IndexOperation::UpdateTags => "update_tags",
            IndexOperation::GetQueryTags => "get_query_tags",
        };
        write!(f, "{s}")
    }
}

/// Operations one schema version overrides. `None` means inherit.
pub struct IndexOperationSet<C> {
    pub add_entry: Option<AddEntryOp<C>>,
    pub get_entry: Option<GetEntryOp<C>>,
    pub delete_entry: Option<DeleteEntryOp<C>>,
    pub update_state: Option<UpdateStateOp<C>>,
    pub update_tags: Option<UpdateTagsOp<C>>,
    pub get_query_tags: Option<GetQueryTagsOp<C>>,
}

impl<C> IndexOperationSet<C> {
    /// A version that changes nothing.
    pub fn inherit_all() -> Self {
        Self {
            add_entry: None,
            get_entry: None,
            delete_entry: None,
            update_state: None,
            update_tags: None,
            get_query_tags: None,
        }
    }

    pub fn provides(&self, operation: IndexOperation) -> bool {
        match operation {
            IndexOperation::AddEntry => self.add_entry.is_some(),
            IndexOperation::GetEntry => self.get_entry.is_some(),
            IndexOperation::DeleteEntry => self.delete_entry.is_some(),
            IndexOperation::UpdateState => self.update_state.is_some(),
            IndexOperation::UpdateTags => self.update_tags.is_some(),
            IndexOperation::GetQueryTags => self.get_query_tags.is_some(),
        }
    }
}

impl<C> Default for IndexOperationSet<C> {
    fn default() -> Self {
        Self::inherit_all()
    }
}

impl<C> Clone for IndexOperationSet<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for IndexOperationSet<C> {}

// ---------------------------------------------------------------------------
// Table + resolution
// ---------------------------------------------------------------------------

/// Ordered table of declared schema versions.
pub struct OperationTable<C> {
    sets: BTreeMap<SchemaVersion, IndexOperationSet<C>>,
}

impl<C> Default for OperationTable<C> {
    fn default() -> Self {
        Self {
            sets: BTreeMap::new(),
        }
    }
}

impl<C> OperationTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(mut self, version: SchemaVersion, set: IndexOperationSet<C>) -> Self {
        self.sets.insert(version, set);
        self
    }

    pub fn versions(&self) -> impl Iterator<Item = SchemaVersion> + '_ {
        self.sets.keys().copied()
    }

    /// Resolve the operation set for a deployed schema version.
    ///
    /// Fails if no declared version is ≤ `reported`, or if some operation
    /// has no implementation anywhere in the chain below the selected
    /// version.
    pub fn resolve(&self, reported: SchemaVersion) -> Result<ResolvedIndexOperations<C>> {
        let (&version, _) = self.sets.range(..=reported).next_back().ok_or_else(|| {
            Error::UnsupportedSchemaVersion(format!(
                "deployed schema {reported} is older than every supported version ({})",
                self.versions()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        // Newest first, so the first set providing an operation wins.
        let chain: Vec<(SchemaVersion, &IndexOperationSet<C>)> = self
            .sets
            .range(..=version)
            .rev()
            .map(|(v, set)| (*v, set))
            .collect();

        Ok(ResolvedIndexOperations {
            version,
            add_entry: pick(&chain, IndexOperation::AddEntry, |s| s.add_entry)?,
            get_entry: pick(&chain, IndexOperation::GetEntry, |s| s.get_entry)?,
            delete_entry: pick(&chain, IndexOperation::DeleteEntry, |s| s.delete_entry)?,
            update_state: pick(&chain, IndexOperation::UpdateState, |s| s.update_state)?,
            update_tags: pick(&chain, IndexOperation::UpdateTags, |s| s.update_tags)?,
            get_query_tags: pick(&chain, IndexOperation::GetQueryTags, |s| s.get_query_tags)?,
        })
    }
}

fn pick<C, T: Copy>(
    chain: &[(SchemaVersion, &IndexOperationSet<C>)],
    operation: IndexOperation,
    get: impl Fn(&IndexOperationSet<C>) -> Option<T>,
) -> Result<Resolved<T>> {
    chain
        .iter()
        .find_map(|(version, set)| get(set).map(|op| Resolved { op, source: *version }))
        .ok_or_else(|| {
            Error::UnsupportedSchemaVersion(format!(
                "no schema version up to {} implements {operation}",
                chain.first().map(|(v, _)| *v).unwrap_or_default()
            ))
        })
}

#[derive(Clone, Copy)]
struct Resolved<T: Copy> {
    op: T,
    source: SchemaVersion,
}

/// A complete operation set for one deployed schema version.
pub struct ResolvedIndexOperations<C> {
    version: SchemaVersion,
    add_entry: Resolved<AddEntryOp<C>>,
    get_entry: Resolved<GetEntryOp<C>>,
    delete_entry: Resolved<DeleteEntryOp<C>>,
    update_state: Resolved<UpdateStateOp<C>>,
    update_tags: Resolved<UpdateTagsOp<C>>,
    get_query_tags: Resolved<GetQueryTagsOp<C>>,
}

impl<C> Clone for ResolvedIndexOperations<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for ResolvedIndexOperations<C> {}

impl<C> ResolvedIndexOperations<C> {
    /// The declared version selected for the deployed schema.
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// The version whose implementation of `operation` was selected.
    pub fn source_of(&self, operation: IndexOperation) -> SchemaVersion {
        match operation {
            IndexOperation::AddEntry => self.add_entry.source,
            IndexOperation::GetEntry => self.get_entry.source,
            IndexOperation::DeleteEntry => self.delete_entry.source,
            IndexOperation::UpdateState => self.update_state.source,
            IndexOperation::UpdateTags => self.update_tags.source,
            IndexOperation::GetQueryTags => self.get_query_tags.source,
        }
    }
}

impl<C> fmt::Debug for ResolvedIndexOperations<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ResolvedIndexOperations");
        s.field("version", &self.version);
        for operation in IndexOperation::ALL {
            s.field(&operation.to_string(), &self.source_of(operation));
        }
        s.finish()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Index store that dispatches every call through the resolved table.
pub struct VersionedIndexStore<C> {
    ctx: C,
    table: OperationTable<C>,
    resolved: RwLock<ResolvedIndexOperations<C>>,
}

impl<C: Send + Sync + 'static> VersionedIndexStore<C> {
    /// Resolve against the version the probe reports. Meant for startup;
    /// failure here is fatal.
    pub async fn connect(
        ctx: C,
        table: OperationTable<C>,
        probe: &dyn SchemaVersionProbe,
    ) -> Result<Self> {
        let reported = probe.current_version().await?;
        Self::for_version(ctx, table, reported)
    }

    pub fn for_version(ctx: C, table: OperationTable<C>, reported: SchemaVersion) -> Result<Self> {
        let resolved = table.resolve(reported)?;
        record_resolution(reported, &resolved);
        Ok(Self {
            ctx,
            table,
            resolved: RwLock::new(resolved),
        })
    }

    /// Re-resolve after the deployed schema changed (e.g. an upgrade
    /// finished while this instance was running). On failure the current
    /// operations stay in place.
    pub async fn refresh(&self, probe: &dyn SchemaVersionProbe) -> Result<SchemaVersion> {
        let reported = probe.current_version().await?;
        let resolved = self.table.resolve(reported)?;
        record_resolution(reported, &resolved);
        *self
            .resolved
            .write()
            .unwrap_or_else(PoisonError::into_inner) = resolved;
        Ok(resolved.version())
    }

    pub fn version(&self) -> SchemaVersion {
        self.operations().version()
    }

    pub fn operations(&self) -> ResolvedIndexOperations<C> {
        *self.resolved.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }
}

fn record_resolution<C>(reported: SchemaVersion, resolved: &ResolvedIndexOperations<C>) {
    info!(
        reported = %reported,
        selected = %resolved.version(),
        "resolved metadata store schema version"
    );
    metrics::schema_resolutions().add(
        1,
        &[KeyValue::new("version", resolved.version().to_string())],
    );
}

#[async_trait]
impl<C: Send + Sync + 'static> IndexStore for VersionedIndexStore<C> {
    async fn add_entry(
        &self,
        partition_key: i32,
        document: &WorkitemDocument,
        tags: &[QueryTag],
    ) -> Result<i64> {
        let op = self.operations().add_entry.op;
        op(&self.ctx, partition_key, document, tags).await
    }

    async fn get_entry(
        &self,
        partition_key: i32,
        workitem_uid: &str,
    ) -> Result<WorkitemMetadataEntry> {
        let op = self.operations().get_entry.op;
        op(&self.ctx, partition_key, workitem_uid).await
    }

    async fn delete_entry(&self, partition_key: i32, workitem_uid: &str) -> Result<()> {
        let op = self.operations().delete_entry.op;
        op(&self.ctx, partition_key, workitem_uid).await
    }

    async fn update_state(
        &self,
        identifier: &WorkitemIdentifier,
        transition: &StateTransition,
    ) -> Result<()> {
        transition.validate()?;
        let op = self.operations().update_state.op;
        op(&self.ctx, identifier, transition).await
    }

    async fn update_tags(
        &self,
        identifier: &WorkitemIdentifier,
        precondition: &Precondition,
        values: &[(Tag, String)],
    ) -> Result<i64> {
        let op = self.operations().update_tags.op;
        op(&self.ctx, identifier, precondition, values).await
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> QueryTagSource for VersionedIndexStore<C> {
    async fn get_query_tags(&self) -> Result<Vec<QueryTag>> {
        let op = self.operations().get_query_tags.op;
        op(&self.ctx).await
    }
}

// ---------------------------------------------------------------------------
// Signature compatibility
// ---------------------------------------------------------------------------

/// A parameter of a versioned store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: &'static str,
    pub data_type: &'static str,
    pub has_default: bool,
}

impl Parameter {
    pub const fn required(name: &'static str, data_type: &'static str) -> Self {
        Self {
            name,
            data_type,
            has_default: false,
        }
    }

    pub const fn defaulted(name: &'static str, data_type: &'static str) -> Self {
        Self {
            name,
            data_type,
            has_default: true,
        }
    }
}

/// The callable shape of one store operation at one schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSignature {
    pub name: &'static str,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompatibilityViolation {
    MissingOperation {
        operation: &'static str,
    },
    MissingParameter {
        operation: &'static str,
        parameter: &'static str,
    },
    TypeChanged {
        operation: &'static str,
        parameter: &'static str,
        old: &'static str,
        new: &'static str,
    },
    NewParameterWithoutDefault {
        operation: &'static str,
        parameter: &'static str,
    },
}

/// Can callers written against `old` keep calling `new`?
///
/// Every old operation must still exist, every old parameter must survive
/// with the same type, and parameters only `new` has must be defaulted.
pub fn check_compatibility(
    old: &[OperationSignature],
    new: &[OperationSignature],
) -> Vec<CompatibilityViolation> {
    let mut violations = Vec::new();

    for old_op in old {
        let Some(new_op) = new.iter().find(|op| op.name == old_op.name) else {
            violations.push(CompatibilityViolation::MissingOperation {
                operation: old_op.name,
            });
            continue;
        };

        let mut remaining: Vec<&Parameter> = new_op.parameters.iter().collect();
        for old_param in &old_op.parameters {
            match remaining.iter().position(|p| p.name == old_param.name) {
                Some(i) => {
                    let new_param = remaining.remove(i);
                    if new_param.data_type != old_param.data_type {
                        violations.push(CompatibilityViolation::TypeChanged {
                            operation: old_op.name,
                            parameter: old_param.name,
                            old: old_param.data_type,
                            new: new_param.data_type,
                        });
                    }
                }
                None => violations.push(CompatibilityViolation::MissingParameter {
                    operation: old_op.name,
                    parameter: old_param.name,
                }),
            }
        }

        violations.extend(
            remaining
                .into_iter()
                .filter(|p| !p.has_default)
                .map(|p| CompatibilityViolation::NewParameterWithoutDefault {
                    operation: old_op.name,
                    parameter: p.name,
                }),
        );
    }

    violations
}
