use crate::db::RecordStore;
use crate::error::StoreError;
use crate::models::{InvoiceCandidate, InvoiceRecord};
use crate::utils::normalize_summary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    DocNumber,
    SupplierDateAmountSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMatch {
    pub existing: InvoiceRecord,
    pub reason: DuplicateReason,
}

/// Returns the stored record the candidate duplicates, if any.
///
/// With a document number only that number decides, compared case-insensitively. Without one,
/// a stored record that also lacks a number must match supplier, date, amount and the
/// normalized summary.
pub fn find_duplicate(
    store: &dyn RecordStore,
    candidate: &InvoiceCandidate,
) -> Result<Option<DuplicateMatch>, StoreError> {
    if let Some(doc_number) = candidate.doc_number.as_deref() {
        let existing = store.find_by_doc_number(doc_number)?;
        return Ok(existing.into_iter().next().map(|existing| DuplicateMatch {
            existing,
            reason: DuplicateReason::DocNumber,
        }));
    }

    let summary = normalize_summary(candidate.summary.as_deref());
    let existing = store
        .find_without_doc_number(
            &candidate.supplier_name,
            &candidate.doc_date,
            candidate.total_amount,
        )?
        .into_iter()
        .find(|record| normalize_summary(record.summary.as_deref()) == summary);
    Ok(existing.map(|existing| DuplicateMatch {
        existing,
        reason: DuplicateReason::SupplierDateAmountSummary,
    }))
}
