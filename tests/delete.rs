mod helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use faturas_sync::error::{StoreError, SyncError};
use faturas_sync::models::CostClassification;
use faturas_sync::services::delete::delete_invoice;
use helpers::{database, harness, harness_with_store, seed_invoice, FakeOracle, FlakyStore};

#[tokio::test]
async fn removes_row_file_and_record() {
    let h = harness(FakeOracle::default());
    let record = seed_invoice(&h, "2025-03-14", Some(CostClassification::Fixed)).await;
    let workbook = record.ledger_id.clone().unwrap();

    let report = delete_invoice(&h.session, &record.id).await.unwrap();

    assert!(report.success);
    assert!(report.ledger_row_deleted);
    assert!(report.file_deleted);
    assert!(h.ledger.rows(&workbook, "03 - Março").is_empty());
    assert!(h.drive.node(record.file_id.as_deref().unwrap()).is_none());
    assert!(h.db.lock().unwrap().get_invoice_by_id(&record.id).unwrap().is_none());
}

#[tokio::test]
async fn only_the_matching_row_is_removed() {
    let h = harness(FakeOracle::default());
    let record = seed_invoice(&h, "2025-03-14", Some(CostClassification::Fixed)).await;
    let workbook = record.ledger_id.clone().unwrap();
    let mut other = faturas_sync::models::ledger_row(&record);
    other[faturas_sync::models::LedgerColumn::DocNumber.index()] = "FT 2025/7".to_string();
    h.ledger.seed(&workbook, "03 - Março", vec![other]);
    // The record's own row is now the first of two.
    let rows = h.ledger.rows(&workbook, "03 - Março");
    assert_eq!(rows.len(), 2);

    delete_invoice(&h.session, &record.id).await.unwrap();

    let remaining = h.ledger.rows(&workbook, "03 - Março");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0][faturas_sync::models::LedgerColumn::DocNumber.index()], "FT 2025/7");
}

#[tokio::test]
async fn unknown_invoice_is_not_found() {
    let h = harness(FakeOracle::default());
    let err = delete_invoice(&h.session, "missing").await.unwrap_err();
    assert!(matches!(err, SyncError::Fatal(StoreError::NotFound(_))));
    assert_eq!(h.ledger.mutations(), 0);
}

#[tokio::test]
async fn secondary_failures_still_delete_the_record() {
    let h = harness(FakeOracle::default());
    let record = seed_invoice(&h, "2025-03-14", Some(CostClassification::Fixed)).await;
    h.ledger.fail_delete.store(true, Ordering::SeqCst);
    h.drive.fail_delete.store(true, Ordering::SeqCst);

    let report = delete_invoice(&h.session, &record.id).await.unwrap();

    assert!(report.success);
    assert!(!report.ledger_row_deleted);
    assert!(!report.file_deleted);
    assert!(h.db.lock().unwrap().get_invoice_by_id(&record.id).unwrap().is_none());
    assert_eq!(h.db.lock().unwrap().count_logs("ledger", "sync_debt").unwrap(), 1);
    assert_eq!(h.db.lock().unwrap().count_logs("storage", "sync_debt").unwrap(), 1);
}

#[tokio::test]
async fn store_failure_fails_the_delete() {
    let db = database();
    let store = Arc::new(FlakyStore::new(db.clone()));
    let h = harness_with_store(store.clone(), db, FakeOracle::default());
    let record = seed_invoice(&h, "2025-03-14", Some(CostClassification::Fixed)).await;
    store.fail_delete.store(true, Ordering::SeqCst);

    let err = delete_invoice(&h.session, &record.id).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(h.db.lock().unwrap().get_invoice_by_id(&record.id).unwrap().is_some());
}

#[tokio::test]
async fn record_without_ledger_reference_skips_the_ledger() {
    let h = harness(FakeOracle::default());
    let mut record = seed_invoice(&h, "2025-03-14", None).await;
    h.db.lock().unwrap().delete_invoice(&record.id).unwrap();
    record.ledger_id = None;
    record.file_id = None;
    h.db.lock().unwrap().insert_invoice(&record).unwrap();

    let report = delete_invoice(&h.session, &record.id).await.unwrap();

    assert!(report.success);
    assert!(!report.ledger_row_deleted);
    assert!(!report.file_deleted);
    assert_eq!(h.ledger.reads(), 0);
}
