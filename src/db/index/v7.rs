//! Row watermark: state and tag writes advance `workitem.watermark`, and
//! both check it. It is the optimistic-concurrency token that lets a state
//! change detect a tag write made after the caller read the entry.

use sqlx::PgPool;

use super::v5::{Watermark, apply_state, read_entry, replace_tag_values};
use crate::model::{
    Precondition, StateTransition, Tag, WorkitemIdentifier, WorkitemMetadataEntry,
};
use crate::versioning::{IndexOperationSet, OpFuture};

pub(super) fn operations() -> IndexOperationSet<PgPool> {
    IndexOperationSet {
        get_entry: Some(get_entry),
        update_state: Some(update_state),
        update_tags: Some(update_tags),
        ..IndexOperationSet::inherit_all()
    }
}

fn get_entry<'a>(
    pool: &'a PgPool,
    partition_key: i32,
    workitem_uid: &'a str,
) -> OpFuture<'a, WorkitemMetadataEntry> {
    Box::pin(read_entry(pool, partition_key, workitem_uid, Watermark::Tracked))
}

fn update_state<'a>(
    pool: &'a PgPool,
    identifier: &'a WorkitemIdentifier,
    transition: &'a StateTransition,
) -> OpFuture<'a, ()> {
    Box::pin(apply_state(pool, identifier, transition, Watermark::Tracked))
}

fn update_tags<'a>(
    pool: &'a PgPool,
    identifier: &'a WorkitemIdentifier,
    precondition: &'a Precondition,
    values: &'a [(Tag, String)],
) -> OpFuture<'a, i64> {
    Box::pin(replace_tag_values(
        pool,
        identifier,
        precondition,
        values,
        Watermark::Tracked,
    ))
}
