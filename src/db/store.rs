//! Store seams used by the orchestrators.
//!
//! The SQLite [`Database`](super::Database) is shared as `Arc<Mutex<Database>>`; these traits are
//! implemented for the mutex so the orchestrators hold an `Arc<dyn RecordStore>` and tests can
//! swap in wrappers that inject failures.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

use super::Database;
use crate::error::StoreError;
use crate::models::{Credential, InvoicePatch, InvoiceRecord, InvoiceStatus, RunSummary};

#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    pub year: Option<i32>,
    pub supplier_contains: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub limit: Option<usize>,
}

/// The authoritative invoice table.
pub trait RecordStore: Send + Sync {
    fn insert_invoice(&self, invoice: &InvoiceRecord) -> Result<(), StoreError>;
    fn get_invoice(&self, id: &str) -> Result<Option<InvoiceRecord>, StoreError>;
    fn update_invoice(&self, id: &str, patch: &InvoicePatch) -> Result<InvoiceRecord, StoreError>;
    fn set_ledger_reference(&self, id: &str, ledger_id: &str) -> Result<(), StoreError>;
    fn delete_invoice(&self, id: &str) -> Result<bool, StoreError>;
    fn find_by_doc_number(&self, doc_number: &str) -> Result<Vec<InvoiceRecord>, StoreError>;
    fn find_without_doc_number(
        &self,
        supplier_name: &str,
        doc_date: &str,
        total_amount: f64,
    ) -> Result<Vec<InvoiceRecord>, StoreError>;
    fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError>;
    /// Audit trail; callers ignore failures here.
    fn log_processing(
        &self,
        invoice_id: Option<&str>,
        file_hash: Option<&str>,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), StoreError>;
    fn record_run(&self, started_at: &str, summary: &RunSummary) -> Result<(), StoreError>;
    fn last_run(&self) -> Result<Option<RunSummary>, StoreError>;
}

pub trait CredentialStore: Send + Sync {
    fn get_credential(&self, account: &str) -> Result<Option<Credential>, StoreError>;
    fn list_credentials(&self) -> Result<Vec<Credential>, StoreError>;
    fn primary_storage_credential(&self) -> Result<Option<Credential>, StoreError>;
    fn save_credential(&self, credential: &Credential) -> Result<(), StoreError>;
    fn update_tokens(
        &self,
        account: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        refresh_token: Option<&str>,
    ) -> Result<(), StoreError>;
    fn set_primary_storage(&self, account: &str) -> Result<(), StoreError>;
    fn delete_credential(&self, account: &str) -> Result<bool, StoreError>;
}

fn lock(db: &Mutex<Database>) -> Result<std::sync::MutexGuard<'_, Database>, StoreError> {
    db.lock().map_err(|_| StoreError::LockPoisoned)
}

impl RecordStore for Mutex<Database> {
    fn insert_invoice(&self, invoice: &InvoiceRecord) -> Result<(), StoreError> {
        Ok(lock(self)?.insert_invoice(invoice)?)
    }

    fn get_invoice(&self, id: &str) -> Result<Option<InvoiceRecord>, StoreError> {
        Ok(lock(self)?.get_invoice_by_id(id)?)
    }

    fn update_invoice(&self, id: &str, patch: &InvoicePatch) -> Result<InvoiceRecord, StoreError> {
        lock(self)?.update_invoice(id, patch)
    }

    fn set_ledger_reference(&self, id: &str, ledger_id: &str) -> Result<(), StoreError> {
        Ok(lock(self)?.set_ledger_reference(id, ledger_id)?)
    }

    fn delete_invoice(&self, id: &str) -> Result<bool, StoreError> {
        Ok(lock(self)?.delete_invoice(id)?)
    }

    fn find_by_doc_number(&self, doc_number: &str) -> Result<Vec<InvoiceRecord>, StoreError> {
        Ok(lock(self)?.find_by_doc_number(doc_number)?)
    }

    fn find_without_doc_number(
        &self,
        supplier_name: &str,
        doc_date: &str,
        total_amount: f64,
    ) -> Result<Vec<InvoiceRecord>, StoreError> {
        Ok(lock(self)?.find_without_doc_number(supplier_name, doc_date, total_amount)?)
    }

    fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError> {
        Ok(lock(self)?.list_invoices(filter)?)
    }

    fn log_processing(
        &self,
        invoice_id: Option<&str>,
        file_hash: Option<&str>,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        Ok(lock(self)?.log_processing(invoice_id, file_hash, process_type, status, message)?)
    }

    fn record_run(&self, started_at: &str, summary: &RunSummary) -> Result<(), StoreError> {
        Ok(lock(self)?.record_run(started_at, summary)?)
    }

    fn last_run(&self) -> Result<Option<RunSummary>, StoreError> {
        Ok(lock(self)?.last_run()?)
    }
}

impl CredentialStore for Mutex<Database> {
    fn get_credential(&self, account: &str) -> Result<Option<Credential>, StoreError> {
        lock(self)?.get_credential(account)
    }

    fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        lock(self)?.list_credentials()
    }

    fn primary_storage_credential(&self) -> Result<Option<Credential>, StoreError> {
        lock(self)?.primary_storage_credential()
    }

    fn save_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        lock(self)?.save_credential(credential)
    }

    fn update_tokens(
        &self,
        account: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        refresh_token: Option<&str>,
    ) -> Result<(), StoreError> {
        lock(self)?.update_tokens(account, access_token, expires_at, refresh_token)
    }

    fn set_primary_storage(&self, account: &str) -> Result<(), StoreError> {
        lock(self)?.set_primary_storage(account)
    }

    fn delete_credential(&self, account: &str) -> Result<bool, StoreError> {
        Ok(lock(self)?.delete_credential(account)?)
    }
}
