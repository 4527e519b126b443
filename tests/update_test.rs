//! Update gating, merge policy and compensation.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::*;
use workitem_rs::engine::{WorkitemOrchestrator, WorkitemService};
use workitem_rs::model::{QueryTag, Tag, Vr, WorkitemState};
use workitem_rs::query_tags::QueryTagService;
use workitem_rs::response::{BaseUrlResolver, FailureCode, OutcomeStatus};
use workitem_rs::store::IndexStore;

const UPS_SOP_CLASS: &str = "1.2.840.10008.5.1.4.34.6.1";

fn rename_patient() -> workitem_rs::model::WorkitemDocument {
    update_document(&[(Tag::PATIENT_NAME, Vr::PN, "Roe^Richard")])
}

#[tokio::test]
async fn update_scheduled_workitem() {
    let fixture = Fixture::new();
    let uid = workitem_uid(1);
    fixture.add(&uid).await;

    let outcome = fixture
        .service
        .process_update(PARTITION, rename_patient(), &uid, None)
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(
        outcome.resource_url.as_deref(),
        Some(format!("{BASE_URL}/workitems/{uid}").as_str())
    );
    let document = fixture.service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(document.get_string(Tag::PATIENT_NAME), Some("Roe^Richard"));
    assert_eq!(document.get_string(Tag::PATIENT_ID), Some("PID-0001"));
    let entry = fixture.entry(&uid).await;
    assert!(entry.tags.contains(&(Tag::PATIENT_NAME, "Roe^Richard".to_string())));
}

#[tokio::test]
async fn scheduled_update_rejects_transaction_uid() {
    let fixture = Fixture::new();
    let uid = workitem_uid(2);
    fixture.add(&uid).await;

    let outcome = fixture
        .service
        .process_update(PARTITION, rename_patient(), &uid, Some(&transaction_uid(2)))
        .await
        .unwrap();

    assert_eq!(outcome.failure_code, Some(FailureCode::ValidationFailure));
    let document = fixture.service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(document.get_string(Tag::PATIENT_NAME), Some("Doe^Jane"));
}

#[tokio::test]
async fn terminal_workitems_reject_every_update() {
    let fixture = Fixture::new();
    let completed = workitem_uid(3);
    let txn = transaction_uid(3);
    fixture.add_in_progress(&completed, &txn).await;
    fixture
        .service
        .process_change_state(PARTITION, &completed, &txn, WorkitemState::Completed)
        .await
        .unwrap();
    let canceled = workitem_uid(4);
    fixture.add(&canceled).await;
    fixture
        .service
        .process_cancel(PARTITION, &canceled, None)
        .await
        .unwrap();

    let payloads = [
        rename_patient(),
        update_document(&[]),
        update_document(&[(Tag::PROCEDURE_STEP_STATE, Vr::CS, "SCHEDULED")]),
        update_document(&[(Tag::SOP_CLASS_UID, Vr::UI, "not-a-uid")]),
    ];
    for uid in [&completed, &canceled] {
        for payload in &payloads {
            for supplied in [None, Some(txn.as_str())] {
                let outcome = fixture
                    .service
                    .process_update(PARTITION, payload.clone(), uid, supplied)
                    .await
                    .unwrap();
                assert_eq!(
                    outcome.failure_code,
                    Some(FailureCode::UpdateNotAllowed),
                    "{uid} with {supplied:?}"
                );
            }
        }
    }
}

#[tokio::test]
async fn in_progress_update_requires_matching_transaction_uid() {
    let fixture = Fixture::new();
    let uid = workitem_uid(5);
    let txn = transaction_uid(5);
    fixture.add_in_progress(&uid, &txn).await;

    for supplied in [None, Some(""), Some("2.25.6")] {
        let outcome = fixture
            .service
            .process_update(PARTITION, rename_patient(), &uid, supplied)
            .await
            .unwrap();
        assert_eq!(
            outcome.failure_code,
            Some(FailureCode::ValidationFailure),
            "{supplied:?}"
        );
    }

    let outcome = fixture
        .service
        .process_update(PARTITION, rename_patient(), &uid, Some(&txn))
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Success);
}

#[tokio::test]
async fn protected_tag_is_ignored_with_warning() {
    let fixture = Fixture::new();
    let uid = workitem_uid(6);
    let txn = transaction_uid(6);
    fixture.add_in_progress(&uid, &txn).await;

    let payload = update_document(&[
        (Tag::PATIENT_NAME, Vr::PN, "Roe^Richard"),
        (Tag::SOP_CLASS_UID, Vr::UI, UPS_SOP_CLASS),
    ]);
    let outcome = fixture
        .service
        .process_update(PARTITION, payload, &uid, Some(&txn))
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Warning);
    assert_eq!(outcome.warning_tags, vec![Tag::SOP_CLASS_UID]);
    assert!(outcome.message.unwrap_or_default().contains("(0008,0016)"));
    let document = fixture.service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(document.get_string(Tag::PATIENT_NAME), Some("Roe^Richard"));
    assert!(!document.contains(Tag::SOP_CLASS_UID));
}

#[tokio::test]
async fn scheduling_attributes_freeze_once_claimed() {
    let fixture = Fixture::new();
    let uid = workitem_uid(7);
    let txn = transaction_uid(7);
    fixture.add_in_progress(&uid, &txn).await;

    let payload = update_document(&[(Tag::SCHEDULED_PROCEDURE_STEP_PRIORITY, Vr::CS, "HIGH")]);
    let outcome = fixture
        .service
        .process_update(PARTITION, payload, &uid, Some(&txn))
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Warning);
    assert_eq!(outcome.warning_tags, vec![Tag::SCHEDULED_PROCEDURE_STEP_PRIORITY]);
    let document = fixture.service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(
        document.get_string(Tag::SCHEDULED_PROCEDURE_STEP_PRIORITY),
        Some("MEDIUM")
    );
}

#[tokio::test]
async fn invalid_payloads_are_rejected() {
    let fixture = Fixture::new();
    let uid = workitem_uid(8);
    fixture.add(&uid).await;

    let cases = [
        (update_document(&[]), FailureCode::ValidationFailure),
        (
            update_document(&[(Tag::PROCEDURE_STEP_STATE, Vr::CS, "COMPLETED")]),
            FailureCode::UpdateNotAllowed,
        ),
        (
            update_document(&[(Tag::TRANSACTION_UID, Vr::UI, "2.25.1")]),
            FailureCode::ValidationFailure,
        ),
        (
            update_document(&[(Tag::SOP_INSTANCE_UID, Vr::UI, "1.02.3")]),
            FailureCode::ValidationFailure,
        ),
    ];
    for (payload, expected) in cases {
        let outcome = fixture
            .service
            .process_update(PARTITION, payload, &uid, None)
            .await
            .unwrap();
        assert_eq!(outcome.failure_code, Some(expected));
    }
    assert_eq!(fixture.entry(&uid).await.state, WorkitemState::Scheduled);
}

#[tokio::test]
async fn update_of_missing_workitem_is_not_found() {
    let fixture = Fixture::new();

    let outcome = fixture
        .service
        .process_update(PARTITION, rename_patient(), &workitem_uid(9), None)
        .await
        .unwrap();

    assert_eq!(outcome.failure_code, Some(FailureCode::InstanceNotFound));
    assert!(outcome.resource_url.is_none());
}

#[tokio::test]
async fn blob_failure_restores_indexed_values() {
    let fixture = Fixture::new();
    let uid = workitem_uid(10);
    let before = fixture.add(&uid).await;
    fixture.blob.fail_puts();

    let outcome = fixture
        .service
        .process_update(PARTITION, rename_patient(), &uid, None)
        .await
        .unwrap();

    assert_eq!(outcome.failure_code, Some(FailureCode::ProcessingFailure));
    assert_eq!(fixture.entry(&uid).await.tags, before.tags);
}

#[tokio::test]
async fn index_failure_leaves_document_untouched() {
    let index = Arc::new(FaultyIndexStore::default());
    let blob = Arc::new(FaultyBlobStore::default());
    let orchestrator = Arc::new(WorkitemOrchestrator::new(
        index.clone(),
        blob.clone(),
        Arc::new(QueryTagService::new(Arc::new(CountingTagSource::new(
            QueryTag::defaults(),
        )))),
    ));
    let service = WorkitemService::new(orchestrator, Arc::new(BaseUrlResolver::new(BASE_URL)));
    let uid = workitem_uid(11);
    assert!(
        service
            .process_add(PARTITION, new_document(&uid))
            .await
            .unwrap()
            .is_success()
    );
    index.fail_update_tags.store(true, Ordering::SeqCst);

    let outcome = service
        .process_update(PARTITION, rename_patient(), &uid, None)
        .await
        .unwrap();

    assert_eq!(outcome.failure_code, Some(FailureCode::ProcessingFailure));
    assert_eq!(blob.puts.load(Ordering::SeqCst), 1);
    let document = service.retrieve(PARTITION, &uid).await.unwrap();
    assert_eq!(document.get_string(Tag::PATIENT_NAME), Some("Doe^Jane"));
}

#[tokio::test]
async fn update_racing_a_cancel_conflicts() {
    let fixture = Fixture::new();
    let uid = workitem_uid(12);
    let stale = fixture.add(&uid).await;
    fixture
        .service
        .process_cancel(PARTITION, &uid, None)
        .await
        .unwrap();

    let err = fixture
        .orchestrator
        .update_workitem(&rename_patient(), &stale)
        .await
        .unwrap_err();

    assert_eq!(err.failure_code(), FailureCode::UpdateConflict);
    let entry = fixture.index.get_entry(PARTITION, &uid).await.unwrap();
    assert_eq!(entry.state, WorkitemState::Canceled);
}
