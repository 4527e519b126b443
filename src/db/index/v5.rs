//! Base index layout.

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{Error, Result};
use crate::model::{
    Precondition, QueryTag, QueryTagKind, StateTransition, Tag, WorkitemDocument,
    WorkitemIdentifier, WorkitemMetadataEntry, WorkitemState, extract_tag_values,
};
use crate::versioning::{IndexOperationSet, OpFuture};

pub(super) fn operations() -> IndexOperationSet<PgPool> {
    IndexOperationSet {
        add_entry: Some(add_entry),
        get_entry: Some(get_entry),
        delete_entry: Some(delete_entry),
        update_state: Some(update_state),
        update_tags: Some(update_tags),
        get_query_tags: Some(get_query_tags),
    }
}

/// Whether a write also advances `workitem.watermark` (V7 and later).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Watermark {
    Untracked,
    Tracked,
}

fn add_entry<'a>(
    pool: &'a PgPool,
    partition_key: i32,
    document: &'a WorkitemDocument,
    tags: &'a [QueryTag],
) -> OpFuture<'a, i64> {
    Box::pin(async move {
        let uid = document
            .workitem_uid()
            .ok_or_else(|| Error::validation("workitem document has no workitem UID"))?;
        let state = document
            .procedure_step_state()?
            .unwrap_or(WorkitemState::Scheduled);
        let values = extract_tag_values(document, tags);

        let mut tx = pool.begin().await?;
        let (workitem_key,): (i64,) = sqlx::query_as(
            "INSERT INTO workitem (partition_key, workitem_uid, state, transaction_uid)
             VALUES ($1, $2, $3, $4)
             RETURNING workitem_key",
        )
        .bind(partition_key)
        .bind(uid)
        .bind(state.to_string())
        .bind(document.transaction_uid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return Error::AlreadyExists(format!("{partition_key}/{uid}"));
                }
            }
            Error::Storage(e)
        })?;

        insert_tag_values(&mut tx, workitem_key, &values).await?;
        tx.commit().await?;
        Ok(workitem_key)
    })
}

fn get_entry<'a>(
    pool: &'a PgPool,
    partition_key: i32,
    workitem_uid: &'a str,
) -> OpFuture<'a, WorkitemMetadataEntry> {
    Box::pin(read_entry(pool, partition_key, workitem_uid, Watermark::Untracked))
}

/// Load an entry with its tag values. Untracked layouts report watermark 0.
pub(super) async fn read_entry(
    pool: &PgPool,
    partition_key: i32,
    workitem_uid: &str,
    watermark: Watermark,
) -> Result<WorkitemMetadataEntry> {
    let sql = match watermark {
        Watermark::Untracked => {
            "SELECT workitem_key, state, transaction_uid, 0::bigint FROM workitem
             WHERE partition_key = $1 AND workitem_uid = $2"
        }
        Watermark::Tracked => {
            "SELECT workitem_key, state, transaction_uid, watermark FROM workitem
             WHERE partition_key = $1 AND workitem_uid = $2"
        }
    };
    let row: Option<(i64, String, Option<String>, i64)> = sqlx::query_as(sql)
        .bind(partition_key)
        .bind(workitem_uid)
        .fetch_optional(pool)
        .await?;
    let (workitem_key, state, transaction_uid, watermark) =
        row.ok_or_else(|| Error::NotFound(format!("workitem {partition_key}/{workitem_uid}")))?;

    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT tag, value FROM workitem_tag_value WHERE workitem_key = $1")
            .bind(workitem_key)
            .fetch_all(pool)
            .await?;
    let mut tags = rows
        .into_iter()
        .map(|(tag, value)| Ok((tag.parse::<Tag>()?, value)))
        .collect::<Result<Vec<_>>>()?;
    tags.sort_by_key(|(tag, _)| *tag);

    Ok(WorkitemMetadataEntry {
        identifier: WorkitemIdentifier::new(workitem_uid, workitem_key, partition_key),
        state: state.parse()?,
        transaction_uid,
        tags,
        watermark,
    })
}

fn delete_entry<'a>(pool: &'a PgPool, partition_key: i32, workitem_uid: &'a str) -> OpFuture<'a, ()> {
    Box::pin(async move {
        // Tag values go with the row (ON DELETE CASCADE).
        sqlx::query("DELETE FROM workitem WHERE partition_key = $1 AND workitem_uid = $2")
            .bind(partition_key)
            .bind(workitem_uid)
            .execute(pool)
            .await?;
        Ok(())
    })
}

fn update_state<'a>(
    pool: &'a PgPool,
    identifier: &'a WorkitemIdentifier,
    transition: &'a StateTransition,
) -> OpFuture<'a, ()> {
    Box::pin(apply_state(pool, identifier, transition, Watermark::Untracked))
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
        Watermark::Untracked,
    ))
}

fn get_query_tags(pool: &PgPool) -> OpFuture<'_, Vec<QueryTag>> {
    Box::pin(async move {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT tag, vr, kind FROM workitem_query_tag ORDER BY tag")
                .fetch_all(pool)
                .await?;
        rows.into_iter()
            .map(|(tag, vr, kind)| {
                let kind = match kind.as_str() {
                    "core" => QueryTagKind::Core,
                    "extended" => QueryTagKind::Extended,
                    other => return Err(Error::Other(format!("unknown query tag kind: {other}"))),
                };
                Ok(QueryTag {
                    tag: tag.parse()?,
                    vr: vr.parse()?,
                    kind,
                })
            })
            .collect()
    })
}

/// Conditional state change. Zero rows touched means the entry is gone or
/// no longer in the expected state. The indexed ProcedureStepState value
/// is rewritten in the same transaction.
pub(super) async fn apply_state(
    pool: &PgPool,
    identifier: &WorkitemIdentifier,
    transition: &StateTransition,
    watermark: Watermark,
) -> Result<()> {
    let sql = match watermark {
        Watermark::Untracked => {
            "UPDATE workitem SET state = $1, transaction_uid = $2, updated_at = now()
             WHERE workitem_key = $3 AND partition_key = $4
               AND state = $5 AND transaction_uid IS NOT DISTINCT FROM $6"
        }
        Watermark::Tracked => {
            "UPDATE workitem SET state = $1, transaction_uid = $2, updated_at = now(),
                                 watermark = watermark + 1
             WHERE workitem_key = $3 AND partition_key = $4
               AND state = $5 AND transaction_uid IS NOT DISTINCT FROM $6
               AND watermark = $7"
        }
    };
    let mut tx = pool.begin().await?;
    let mut update = sqlx::query(sql)
        .bind(transition.new_state.to_string())
        .bind(transition.new_transaction_uid.as_deref())
        .bind(identifier.workitem_key())
        .bind(identifier.partition_key())
        .bind(transition.expected_state.to_string())
        .bind(transition.expected_transaction_uid.as_deref());
    if watermark == Watermark::Tracked {
        update = update.bind(transition.expected_watermark);
    }
    let result = update.execute(&mut *tx).await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(stale_write(pool, identifier).await);
    }

    sqlx::query("UPDATE workitem_tag_value SET value = $1 WHERE workitem_key = $2 AND tag = $3")
        .bind(transition.new_state.as_dicom_str())
        .bind(identifier.workitem_key())
        .bind(Tag::PROCEDURE_STEP_STATE.to_path())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Conditional replacement of the indexed values. The row lock keeps a
/// concurrent state change from slipping in between check and write.
/// Returns the new watermark, 0 when untracked.
pub(super) async fn replace_tag_values(
    pool: &PgPool,
    identifier: &WorkitemIdentifier,
    precondition: &Precondition,
    values: &[(Tag, String)],
    watermark: Watermark,
) -> Result<i64> {
    let lock = match watermark {
        Watermark::Untracked => {
            "SELECT state, transaction_uid, 0::bigint FROM workitem
             WHERE workitem_key = $1 AND partition_key = $2
             FOR UPDATE"
        }
        Watermark::Tracked => {
            "SELECT state, transaction_uid, watermark FROM workitem
             WHERE workitem_key = $1 AND partition_key = $2
             FOR UPDATE"
        }
    };
    let mut tx = pool.begin().await?;
    let row: Option<(String, Option<String>, i64)> = sqlx::query_as(lock)
        .bind(identifier.workitem_key())
        .bind(identifier.partition_key())
        .fetch_optional(&mut *tx)
        .await?;
    let (state, transaction_uid, stored_watermark) =
        row.ok_or_else(|| Error::NotFound(format!("workitem {identifier}")))?;
    if state.parse::<WorkitemState>()? != precondition.state
        || transaction_uid != precondition.transaction_uid
        || (watermark == Watermark::Tracked && stored_watermark != precondition.watermark)
    {
        return Err(Error::Conflict(format!(
            "workitem {identifier} changed since it was read"
        )));
    }

    sqlx::query("DELETE FROM workitem_tag_value WHERE workitem_key = $1")
        .bind(identifier.workitem_key())
        .execute(&mut *tx)
        .await?;
    insert_tag_values(&mut tx, identifier.workitem_key(), values).await?;

    let touch = match watermark {
        Watermark::Untracked => {
            "UPDATE workitem SET updated_at = now() WHERE workitem_key = $1
             RETURNING 0::bigint"
        }
        Watermark::Tracked => {
            "UPDATE workitem SET updated_at = now(), watermark = watermark + 1
             WHERE workitem_key = $1
             RETURNING watermark"
        }
    };
    let (new_watermark,): (i64,) = sqlx::query_as(touch)
        .bind(identifier.workitem_key())
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(new_watermark)
}

async fn insert_tag_values(
    tx: &mut Transaction<'_, Postgres>,
    workitem_key: i64,
    values: &[(Tag, String)],
) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let (tags, values): (Vec<String>, Vec<String>) = values
        .iter()
        .map(|(tag, value)| (tag.to_path(), value.clone()))
        .unzip();
    sqlx::query(
        "INSERT INTO workitem_tag_value (workitem_key, tag, value)
         SELECT $1, t.tag, t.value FROM UNNEST($2::text[], $3::text[]) AS t(tag, value)",
    )
    .bind(workitem_key)
    .bind(&tags)
    .bind(&values)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Tell a lost race from a vanished entry after a conditional write
/// matched nothing.
async fn stale_write(pool: &PgPool, identifier: &WorkitemIdentifier) -> Error {
    let exists: std::result::Result<(bool,), sqlx::Error> = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM workitem WHERE workitem_key = $1 AND partition_key = $2)",
    )
    .bind(identifier.workitem_key())
    .bind(identifier.partition_key())
    .fetch_one(pool)
    .await;
    match exists {
        Ok((true,)) => Error::Conflict(format!("workitem {identifier} changed since it was read")),
        Ok((false,)) => Error::NotFound(format!("workitem {identifier}")),
        Err(e) => Error::Storage(e),
    }
}
