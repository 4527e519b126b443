//! Add, cancel and state change across the index and blob stores.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use workitem_rs::engine::{WorkitemOrchestrator, WorkitemService};
use workitem_rs::model::{QueryTag, Tag, Vr, WorkitemMetadataEntry, WorkitemState};
use workitem_rs::query_tags::QueryTagService;
use workitem_rs::response::{BaseUrlResolver, FailureCode, OutcomeStatus};
use workitem_rs::store::{IndexStore, MemoryIndexStore};

#[tokio::test]
async fn add_then_retrieve_returns_scheduled_document() {
    let fixture = Fixture::new();
    let uid = workitem_uid(1);

    let outcome = fixture
        .service
        .process_add(PARTITION, new_document(&uid))
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(
        outcome.resource_url.as_deref(),
        Some(format!("{BASE_URL}/workitems/{uid}").as_str())
    );

    let document = fixture.service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(document.get_string(Tag::PROCEDURE_STEP_STATE), Some("SCHEDULED"));
    assert_eq!(
        document.get_string(Tag::REQUESTED_SOP_INSTANCE_UID),
        Some(uid.as_str())
    );
    assert!(!document.contains(Tag::TRANSACTION_UID));

    let entry = fixture.entry(&uid).await;
    assert_eq!(entry.state, WorkitemState::Scheduled);
    assert!(entry.tags.contains(&(Tag::PATIENT_ID, "PID-0001".to_string())));
}

#[tokio::test]
async fn blob_failure_removes_index_entry() {
    let fixture = Fixture::new();
    let uid = workitem_uid(2);
    fixture.blob.fail_puts();

    let outcome = fixture
        .service
        .process_add(PARTITION, new_document(&uid))
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Failure);
    assert_eq!(outcome.failure_code, Some(FailureCode::ProcessingFailure));
    assert!(!fixture.index.contains(PARTITION, &uid));
    assert!(fixture.blob.inner.is_empty());
}

#[tokio::test]
async fn duplicate_add_keeps_first_workitem() {
    let fixture = Fixture::new();
    let uid = workitem_uid(3);
    fixture.add(&uid).await;

    let mut second = new_document(&uid);
    second.set_string(Tag::PATIENT_ID, Vr::LO, "PID-9999");
    let outcome = fixture.service.process_add(PARTITION, second).await.unwrap();

    assert_eq!(outcome.failure_code, Some(FailureCode::InstanceAlreadyExists));
    assert_eq!(fixture.blob.puts.load(Ordering::SeqCst), 1);
    let document = fixture.service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(document.get_string(Tag::PATIENT_ID), Some("PID-0001"));
}

#[tokio::test]
async fn concurrent_adds_of_same_workitem_store_once() {
    let fixture = Fixture::new();
    let uid = workitem_uid(4);

    let (a, b) = tokio::join!(
        fixture.service.process_add(PARTITION, new_document(&uid)),
        fixture.service.process_add(PARTITION, new_document(&uid)),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 1);
    assert!(
        outcomes
            .iter()
            .any(|o| o.failure_code == Some(FailureCode::InstanceAlreadyExists))
    );
    assert_eq!(fixture.blob.puts.load(Ordering::SeqCst), 1);
    assert!(fixture.index.contains(PARTITION, &uid));
}

#[tokio::test]
async fn same_uid_in_other_partition_is_independent() {
    let fixture = Fixture::new();
    let uid = workitem_uid(5);
    fixture.add(&uid).await;

    let outcome = fixture
        .service
        .process_add(PARTITION + 1, new_document(&uid))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert!(fixture.index.contains(PARTITION + 1, &uid));
}

#[tokio::test]
async fn compensation_failure_does_not_mask_blob_error() {
    let index = Arc::new(FaultyIndexStore::default());
    index.fail_delete.store(true, Ordering::SeqCst);
    let blob = Arc::new(FaultyBlobStore::default());
    blob.fail_puts();
    let orchestrator = WorkitemOrchestrator::new(
        index.clone(),
        blob.clone(),
        Arc::new(QueryTagService::new(Arc::new(CountingTagSource::new(
            QueryTag::defaults(),
        )))),
    );

    let err = orchestrator
        .add_workitem(PARTITION, new_document(&workitem_uid(6)))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "blob store unavailable");
    assert_eq!(index.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_add_still_removes_index_entry() {
    let fixture = Fixture::new();
    let uid = workitem_uid(7);
    fixture.blob.hang_puts();

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        fixture.orchestrator.add_workitem(PARTITION, new_document(&uid)),
    )
    .await;
    assert!(result.is_err(), "add should still be waiting on the blob store");

    for _ in 0..50 {
        if !fixture.index.contains(PARTITION, &uid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!fixture.index.contains(PARTITION, &uid));
}

#[tokio::test]
async fn invalid_add_stores_nothing() {
    let fixture = Fixture::new();
    let uid = workitem_uid(8);

    let mut with_transaction = new_document(&uid);
    with_transaction.set_string(Tag::TRANSACTION_UID, Vr::UI, transaction_uid(1));
    let outcome = fixture
        .service
        .process_add(PARTITION, with_transaction)
        .await
        .unwrap();
    assert_eq!(outcome.failure_code, Some(FailureCode::ValidationFailure));

    let mut in_progress = new_document(&uid);
    in_progress.set_string(Tag::PROCEDURE_STEP_STATE, Vr::CS, "IN PROGRESS");
    let outcome = fixture.service.process_add(PARTITION, in_progress).await.unwrap();
    assert_eq!(outcome.failure_code, Some(FailureCode::ValidationFailure));

    let mut no_uid = new_document(&uid);
    no_uid.remove(Tag::AFFECTED_SOP_INSTANCE_UID);
    let outcome = fixture.service.process_add(PARTITION, no_uid).await.unwrap();
    assert_eq!(outcome.failure_code, Some(FailureCode::ValidationFailure));
    assert!(outcome.resource_url.is_none());

    assert!(fixture.index.is_empty());
    assert!(fixture.blob.inner.is_empty());
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_scheduled_workitem_stores_reason() {
    let fixture = Fixture::new();
    let uid = workitem_uid(20);
    fixture.add(&uid).await;

    let outcome = fixture
        .service
        .process_cancel(PARTITION, &uid, Some("patient left"))
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert!(outcome.resource_url.is_none());

    assert_eq!(fixture.entry(&uid).await.state, WorkitemState::Canceled);
    let document = fixture.service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(document.get_string(Tag::PROCEDURE_STEP_STATE), Some("CANCELED"));
    assert_eq!(
        document.get_string(Tag::REASON_FOR_CANCELLATION),
        Some("patient left")
    );
    assert!(document.contains(Tag::PROCEDURE_STEP_CANCELLATION_DATE_TIME));
}

#[tokio::test]
async fn cancel_in_progress_clears_transaction_uid() {
    let fixture = Fixture::new();
    let uid = workitem_uid(21);
    fixture.add_in_progress(&uid, &transaction_uid(21)).await;

    let outcome = fixture
        .service
        .process_cancel(PARTITION, &uid, None)
        .await
        .unwrap();
    assert!(outcome.is_success());

    let entry = fixture.entry(&uid).await;
    assert_eq!(entry.state, WorkitemState::Canceled);
    assert_eq!(entry.transaction_uid, None);
}

#[tokio::test]
async fn cancel_rejects_missing_and_terminal_workitems() {
    let fixture = Fixture::new();

    let outcome = fixture
        .service
        .process_cancel(PARTITION, &workitem_uid(22), None)
        .await
        .unwrap();
    assert_eq!(outcome.failure_code, Some(FailureCode::InstanceNotFound));

    let uid = workitem_uid(23);
    fixture.add(&uid).await;
    fixture
        .service
        .process_cancel(PARTITION, &uid, None)
        .await
        .unwrap();
    let outcome = fixture
        .service
        .process_cancel(PARTITION, &uid, None)
        .await
        .unwrap();
    assert_eq!(outcome.failure_code, Some(FailureCode::UpdateNotAllowed));
}

#[tokio::test]
async fn cancel_without_stored_document_keeps_state() {
    let fixture = Fixture::new();
    let uid = workitem_uid(24);
    fixture.add(&uid).await;
    fixture.blob.fail_get.store(true, Ordering::SeqCst);

    let outcome = fixture
        .service
        .process_cancel(PARTITION, &uid, Some("duplicate order"))
        .await
        .unwrap();

    assert_eq!(outcome.failure_code, Some(FailureCode::ProcessingFailure));
    assert_eq!(fixture.entry(&uid).await.state, WorkitemState::Scheduled);
}

#[tokio::test]
async fn cancel_reason_write_failure_is_a_warning() {
    let fixture = Fixture::new();
    let uid = workitem_uid(25);
    fixture.add(&uid).await;
    fixture.blob.fail_puts();

    let outcome = fixture
        .service
        .process_cancel(PARTITION, &uid, Some("equipment down"))
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Warning);
    assert_eq!(outcome.warning_tags, vec![Tag::REASON_FOR_CANCELLATION]);
    assert_eq!(fixture.entry(&uid).await.state, WorkitemState::Canceled);
}

#[tokio::test]
async fn cancel_loses_to_an_update_that_lands_first() {
    let index = Arc::new(MemoryIndexStore::default());
    let blob = Arc::new(GatedBlobStore::default());
    let orchestrator = Arc::new(WorkitemOrchestrator::new(
        index.clone(),
        blob.clone(),
        Arc::new(QueryTagService::new(index.clone())),
    ));
    let service = WorkitemService::new(orchestrator, Arc::new(BaseUrlResolver::new(BASE_URL)));
    let uid = workitem_uid(26);
    assert!(
        service
            .process_add(PARTITION, new_document(&uid))
            .await
            .unwrap()
            .is_success()
    );

    // Cancel stalls after reading the document; an update commits meanwhile.
    blob.pause_next_get();
    let (cancel, update) = tokio::join!(
        service.process_cancel(PARTITION, &uid, Some("patient left")),
        async {
            blob.paused.notified().await;
            let outcome = service
                .process_update(
                    PARTITION,
                    update_document(&[(Tag::PATIENT_NAME, Vr::PN, "Roe^Richard")]),
                    &uid,
                    None,
                )
                .await;
            blob.resume();
            outcome
        }
    );

    let update = update.unwrap();
    assert!(update.is_success(), "{update:?}");
    let cancel = cancel.unwrap();
    assert_eq!(cancel.failure_code, Some(FailureCode::UpdateConflict));

    let entry = index.get_entry(PARTITION, &uid).await.unwrap();
    assert_eq!(entry.state, WorkitemState::Scheduled);
    let document = service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(document.get_string(Tag::PATIENT_NAME), Some("Roe^Richard"));
    assert!(!document.contains(Tag::REASON_FOR_CANCELLATION));

    // A cancel issued after the update sees it and keeps it.
    let cancel = service
        .process_cancel(PARTITION, &uid, Some("patient left"))
        .await
        .unwrap();
    assert!(cancel.is_success(), "{cancel:?}");
    let document = service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(document.get_string(Tag::PATIENT_NAME), Some("Roe^Richard"));
    assert_eq!(document.get_string(Tag::REASON_FOR_CANCELLATION), Some("patient left"));
}

#[tokio::test]
async fn indexed_state_follows_the_lifecycle() {
    let fixture = Fixture::new();
    let uid = workitem_uid(27);
    let txn = transaction_uid(27);
    let entry = fixture.add(&uid).await;
    assert_eq!(indexed_state(&entry), Some("SCHEDULED"));

    let entry = fixture.add_in_progress(&workitem_uid(28), &txn).await;
    assert_eq!(indexed_state(&entry), Some("IN PROGRESS"));

    // An update re-extracts tag values; the state value must survive it.
    let outcome = fixture
        .service
        .process_update(
            PARTITION,
            update_document(&[(Tag::PATIENT_NAME, Vr::PN, "Roe^Richard")]),
            &workitem_uid(28),
            Some(&txn),
        )
        .await
        .unwrap();
    assert!(outcome.is_success(), "{outcome:?}");
    let entry = fixture.entry(&workitem_uid(28)).await;
    assert_eq!(indexed_state(&entry), Some("IN PROGRESS"));

    fixture
        .service
        .process_cancel(PARTITION, &uid, None)
        .await
        .unwrap();
    assert_eq!(indexed_state(&fixture.entry(&uid).await), Some("CANCELED"));
}

fn indexed_state(entry: &WorkitemMetadataEntry) -> Option<&str> {
    entry
        .tags
        .iter()
        .find(|(tag, _)| *tag == Tag::PROCEDURE_STEP_STATE)
        .map(|(_, value)| value.as_str())
}

// ---------------------------------------------------------------------------
// State changes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_then_complete() {
    let fixture = Fixture::new();
    let uid = workitem_uid(30);
    let txn = transaction_uid(30);

    let entry = fixture.add_in_progress(&uid, &txn).await;
    assert_eq!(entry.state, WorkitemState::InProgress);
    assert_eq!(entry.transaction_uid.as_deref(), Some(txn.as_str()));

    let outcome = fixture
        .service
        .process_change_state(PARTITION, &uid, &transaction_uid(99), WorkitemState::Completed)
        .await
        .unwrap();
    assert_eq!(outcome.failure_code, Some(FailureCode::ValidationFailure));

    let outcome = fixture
        .service
        .process_change_state(PARTITION, &uid, &txn, WorkitemState::Completed)
        .await
        .unwrap();
    assert!(outcome.is_success());

    let entry = fixture.entry(&uid).await;
    assert_eq!(entry.state, WorkitemState::Completed);
    assert_eq!(entry.transaction_uid, None);
}

#[tokio::test]
async fn claim_requires_transaction_uid() {
    let fixture = Fixture::new();
    let uid = workitem_uid(31);
    fixture.add(&uid).await;

    let outcome = fixture
        .service
        .process_change_state(PARTITION, &uid, "", WorkitemState::InProgress)
        .await
        .unwrap();

    assert_eq!(outcome.failure_code, Some(FailureCode::ValidationFailure));
    assert_eq!(fixture.entry(&uid).await.state, WorkitemState::Scheduled);
}

#[tokio::test]
async fn scheduled_workitem_cannot_be_completed() {
    let fixture = Fixture::new();
    let uid = workitem_uid(32);
    fixture.add(&uid).await;

    let outcome = fixture
        .service
        .process_change_state(PARTITION, &uid, &transaction_uid(32), WorkitemState::Completed)
        .await
        .unwrap();

    assert_eq!(outcome.failure_code, Some(FailureCode::UpdateNotAllowed));
}

#[tokio::test]
async fn stale_state_change_conflicts() {
    let fixture = Fixture::new();
    let uid = workitem_uid(33);
    let stale = fixture.add(&uid).await;

    fixture
        .service
        .process_cancel(PARTITION, &uid, None)
        .await
        .unwrap();
    let err = fixture
        .orchestrator
        .change_workitem_state(&stale, WorkitemState::InProgress, &transaction_uid(33))
        .await
        .unwrap_err();

    assert_eq!(err.failure_code(), FailureCode::UpdateConflict);
    assert_eq!(
        fixture.index.get_entry(PARTITION, &uid).await.unwrap().state,
        WorkitemState::Canceled
    );
}
