//! Propagates an attribute change from the record store to the stored file and the ledger.
//!
//! Only the record-store write gates success. The file move and the ledger relocation are
//! each best-effort; a miss is logged as sync debt and the next update gets another chance.

use crate::error::{ServiceResult, StoreError, SyncResult};
use crate::models::{
    changed_columns, ledger_cell, InvoicePatch, InvoiceRecord, LedgerAction, LedgerColumn,
    UpdateReport,
};
use crate::services::row_locator::{locate_row, LocatedRow};
use crate::services::sheets::CellUpdate;
use crate::services::state::SyncSession;
use crate::utils::tab_for_date;

/// Which ledger relocation an update calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    AcrossWorkbooks,
    AcrossTabs,
    InPlace,
}

pub fn relocation_for(before: &InvoiceRecord, after: &InvoiceRecord) -> Relocation {
    if before.doc_year != after.doc_year {
        Relocation::AcrossWorkbooks
    } else if tab_for_date(&before.doc_date) != tab_for_date(&after.doc_date) {
        Relocation::AcrossTabs
    } else {
        Relocation::InPlace
    }
}

fn needs_file_move(before: &InvoiceRecord, after: &InvoiceRecord) -> bool {
    before.cost_classification != after.cost_classification || before.doc_year != after.doc_year
}

/// Row values for the destination: what the sheet held, with changed columns rewritten.
fn merged_row(source: &[String], after: &InvoiceRecord, changed: &[LedgerColumn]) -> Vec<String> {
    LedgerColumn::ALL
        .iter()
        .map(|column| {
            let current = source.get(column.index()).cloned().unwrap_or_default();
            if changed.contains(column) || current.is_empty() {
                ledger_cell(after, *column)
            } else {
                current
            }
        })
        .collect()
}

#[tracing::instrument(skip(session, patch))]
pub async fn update_invoice(
    session: &SyncSession,
    invoice_id: &str,
    patch: &InvoicePatch,
) -> SyncResult<UpdateReport> {
    let before = session
        .store
        .get_invoice(invoice_id)?
        .ok_or_else(|| StoreError::NotFound(invoice_id.to_string()))?;
    let after = match session.store.update_invoice(invoice_id, patch) {
        Ok(after) => after,
        Err(error) => {
            tracing::error!(%error, "Record update failed, nothing propagated");
            return Err(error.into());
        }
    };

    let file_moved = move_file_if_needed(session, &before, &after).await;

    let ledger_action = match sync_ledger(session, &before, &after).await {
        Ok(action) => action,
        Err(error) => {
            tracing::warn!(%error, "Ledger update failed");
            session.log(Some(invoice_id), None, "ledger", "sync_debt", Some(&error.to_string()));
            LedgerAction::Failed
        }
    };
    if ledger_action == LedgerAction::NotFound {
        session.log(Some(invoice_id), None, "ledger", "sync_debt", Some("ledger row not found"));
    }

    session.log(Some(invoice_id), None, "update", "success", None);
    tracing::info!(file_moved, ?ledger_action, "Invoice updated");
    Ok(UpdateReport {
        invoice_id: invoice_id.to_string(),
        file_moved,
        ledger_action,
    })
}

async fn move_file_if_needed(
    session: &SyncSession,
    before: &InvoiceRecord,
    after: &InvoiceRecord,
) -> bool {
    if !needs_file_move(before, after) {
        return false;
    }
    let Some(file_id) = after.file_id.as_deref() else {
        return false;
    };

    match reparent_file(session, after, file_id).await {
        Ok(()) => {
            tracing::info!(file_id, year = after.doc_year, "Stored file relocated");
            true
        }
        Err(error) => {
            tracing::warn!(file_id, %error, "Stored file relocation failed");
            session.log(Some(&after.id), None, "storage", "sync_debt", Some(&error.to_string()));
            false
        }
    }
}

async fn reparent_file(
    session: &SyncSession,
    after: &InvoiceRecord,
    file_id: &str,
) -> ServiceResult<()> {
    let path = session
        .resolver
        .ensure_path(after.doc_year, after.cost_classification)
        .await?;
    session.files.move_file(file_id, &path.classification).await
}

/// Workbook a record's row lives in: the stored reference, else a lookup by year.
async fn workbook_for(
    session: &SyncSession,
    record: &InvoiceRecord,
) -> ServiceResult<Option<String>> {
    match &record.ledger_id {
        Some(id) => Ok(Some(id.clone())),
        None => session.resolver.find_yearly_ledger(record.doc_year).await,
    }
}

async fn sync_ledger(
    session: &SyncSession,
    before: &InvoiceRecord,
    after: &InvoiceRecord,
) -> ServiceResult<LedgerAction> {
    let changed = changed_columns(before, after);
    let relocation = relocation_for(before, after);
    tracing::debug!(?relocation, changed = changed.len(), "Resolving ledger change");

    if relocation == Relocation::InPlace && changed.is_empty() {
        return Ok(LedgerAction::NoChange);
    }

    if relocation != Relocation::InPlace {
        if let Some(action) = relocate_row(session, before, after, relocation, &changed).await? {
            return Ok(action);
        }
        tracing::debug!("No source row to relocate, falling back to an in-place update");
    }

    update_in_place(session, before, after, relocation, &changed).await
}

/// Read, delete and re-append the row. `None` when the source row cannot be found.
async fn relocate_row(
    session: &SyncSession,
    before: &InvoiceRecord,
    after: &InvoiceRecord,
    relocation: Relocation,
    changed: &[LedgerColumn],
) -> ServiceResult<Option<LedgerAction>> {
    let (Some(source_tab), Some(target_tab)) =
        (tab_for_date(&before.doc_date), tab_for_date(&after.doc_date))
    else {
        return Ok(None);
    };
    let Some(source_workbook) = workbook_for(session, before).await? else {
        return Ok(None);
    };
    let Some(source_info) = session.resolver.find_tab(&source_workbook, &source_tab).await? else {
        return Ok(None);
    };
    let snapshot = before.snapshot();
    let Some(LocatedRow { row, values }) =
        locate_row(session.ledger.as_ref(), &source_workbook, &source_tab, &snapshot).await?
    else {
        return Ok(None);
    };

    // Resolve the destination before touching the source row.
    let target_workbook = match relocation {
        Relocation::AcrossWorkbooks => {
            let (_, year_folder) = session.resolver.ensure_year_folder(after.doc_year).await?;
            session
                .resolver
                .ensure_yearly_ledger(after.doc_year, &year_folder)
                .await?
        }
        _ => source_workbook.clone(),
    };
    session.resolver.ensure_tab(&target_workbook, &target_tab).await?;

    session
        .ledger
        .delete_row(&source_workbook, source_info.sheet_id, row)
        .await?;
    let merged = merged_row(&values, after, changed);
    if let Err(error) = session.ledger.append_row(&target_workbook, &target_tab, &merged).await {
        tracing::error!(
            workbook_id = %target_workbook,
            tab = %target_tab,
            %error,
            "Source row deleted but append failed, row lost from ledger"
        );
        return Err(error);
    }

    if relocation == Relocation::AcrossWorkbooks {
        if let Err(error) = session.store.set_ledger_reference(&after.id, &target_workbook) {
            tracing::error!(invoice_id = %after.id, %error, "Failed to store new ledger reference");
        }
    }

    tracing::info!(
        from_workbook = %source_workbook,
        from_tab = %source_tab,
        row,
        to_workbook = %target_workbook,
        to_tab = %target_tab,
        "Ledger row relocated"
    );
    Ok(Some(match relocation {
        Relocation::AcrossWorkbooks => LedgerAction::MovedAcrossWorkbooks,
        _ => LedgerAction::MovedAcrossTabs,
    }))
}

async fn update_in_place(
    session: &SyncSession,
    before: &InvoiceRecord,
    after: &InvoiceRecord,
    relocation: Relocation,
    changed: &[LedgerColumn],
) -> ServiceResult<LedgerAction> {
    if changed.is_empty() {
        return Ok(LedgerAction::NoChange);
    }
    let Some(tab) = tab_for_date(&after.doc_date) else {
        return Ok(LedgerAction::NotFound);
    };
    // After a failed year move the row, if anywhere, sits in the new year's workbook.
    let workbook = match relocation {
        Relocation::AcrossWorkbooks => session.resolver.find_yearly_ledger(after.doc_year).await?,
        _ => workbook_for(session, after).await?,
    };
    let Some(workbook) = workbook else {
        return Ok(LedgerAction::NotFound);
    };
    if session.resolver.find_tab(&workbook, &tab).await?.is_none() {
        return Ok(LedgerAction::NotFound);
    }

    let ledger = session.ledger.as_ref();
    let mut located = locate_row(ledger, &workbook, &tab, &before.snapshot()).await?;
    if located.is_none() {
        located = locate_row(ledger, &workbook, &tab, &after.snapshot()).await?;
    }
    let Some(located) = located else {
        tracing::warn!(
            workbook_id = %workbook,
            tab = %tab,
            "Ledger row not found, left as sync debt"
        );
        return Ok(LedgerAction::NotFound);
    };

    let updates: Vec<CellUpdate> = changed
        .iter()
        .map(|column| CellUpdate {
            tab: tab.clone(),
            row: located.row,
            column: *column,
            value: ledger_cell(after, *column),
        })
        .collect();
    session.ledger.update_cells(&workbook, &updates).await?;
    if after.ledger_id.as_deref() != Some(workbook.as_str()) {
        if let Err(error) = session.store.set_ledger_reference(&after.id, &workbook) {
            tracing::error!(invoice_id = %after.id, %error, "Failed to store ledger reference");
        }
    }
    tracing::info!(
        workbook_id = %workbook,
        tab = %tab,
        row = located.row,
        cells = updates.len(),
        "Ledger cells updated"
    );
    Ok(LedgerAction::CellsUpdated)
}
