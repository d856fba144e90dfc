use crate::error::{ServiceResult, StoreError, SyncResult};
use crate::models::{DeleteReport, InvoiceRecord};
use crate::services::row_locator::locate_row;
use crate::services::state::SyncSession;
use crate::utils::tab_for_date;

/// Removes an invoice from all three stores.
///
/// The ledger row and the stored file are removed best-effort. The record-store delete decides
/// the outcome: its failure is returned as an error whatever happened to the other two.
#[tracing::instrument(skip(session))]
pub async fn delete_invoice(session: &SyncSession, invoice_id: &str) -> SyncResult<DeleteReport> {
    let record = session
        .store
        .get_invoice(invoice_id)?
        .ok_or_else(|| StoreError::NotFound(invoice_id.to_string()))?;

    let ledger_row_deleted = match delete_ledger_row(session, &record).await {
        Ok(deleted) => deleted,
        Err(error) => {
            tracing::warn!(%error, "Ledger row delete failed");
            session.log(Some(invoice_id), None, "ledger", "sync_debt", Some(&error.to_string()));
            false
        }
    };

    let file_deleted = match record.file_id.as_deref() {
        Some(file_id) => match session.files.delete_file(file_id).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(file_id, %error, "Stored file delete failed");
                session.log(
                    Some(invoice_id),
                    None,
                    "storage",
                    "sync_debt",
                    Some(&error.to_string()),
                );
                false
            }
        },
        None => false,
    };

    let removed = match session.store.delete_invoice(invoice_id) {
        Ok(removed) => removed,
        Err(error) => {
            tracing::error!(%error, "Record delete failed");
            return Err(error.into());
        }
    };
    if !removed {
        tracing::warn!("Record vanished before it could be deleted");
    }

    tracing::info!(ledger_row_deleted, file_deleted, "Invoice deleted");
    Ok(DeleteReport {
        invoice_id: invoice_id.to_string(),
        ledger_row_deleted,
        file_deleted,
        success: removed,
    })
}

async fn delete_ledger_row(session: &SyncSession, record: &InvoiceRecord) -> ServiceResult<bool> {
    let Some(workbook) = record.ledger_id.as_deref() else {
        return Ok(false);
    };
    let Some(tab) = tab_for_date(&record.doc_date) else {
        return Ok(false);
    };
    let Some(info) = session.resolver.find_tab(workbook, &tab).await? else {
        return Ok(false);
    };
    let snapshot = record.snapshot();
    let Some(located) = locate_row(session.ledger.as_ref(), workbook, &tab, &snapshot).await? else {
        tracing::debug!(workbook_id = workbook, tab = %tab, "No ledger row to delete");
        return Ok(false);
    };
    session.ledger.delete_row(workbook, info.sheet_id, located.row).await?;
    Ok(true)
}
