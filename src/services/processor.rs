//! Ingestion pipeline: one document in, one record, stored file and ledger row out.
//!
//! The pipeline is not transactional. A step that fails returns its typed error and leaves
//! whatever earlier steps already wrote; a retry is safe because the duplicate check runs
//! before anything is created.

use crate::error::{SyncError, SyncResult, ValidationError};
use crate::models::{
    ledger_row, IngestOutcome, IngestRequest, InvoiceCandidate, InvoiceRecord, InvoiceStatus,
};
use crate::services::duplicates::find_duplicate;
use crate::services::extraction::to_candidate;
use crate::services::google::STORAGE_SCOPES;
use crate::services::state::SyncSession;
use crate::utils::{now_rfc3339, sha256_bytes, stored_file_name, tab_for_date};

/// Rejects a request before any network call.
pub fn validate(session: &SyncSession, request: &IngestRequest) -> Result<(), ValidationError> {
    let options = &session.options;
    if request.bytes.is_empty() {
        return Err(ValidationError::EmptyFile);
    }
    if request.bytes.len() > options.max_file_size_bytes {
        return Err(ValidationError::FileTooLarge {
            size: request.bytes.len(),
            max: options.max_file_size_bytes,
        });
    }
    if !options
        .allowed_mime_types
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&request.mime_type))
    {
        return Err(ValidationError::UnsupportedMimeType(request.mime_type.clone()));
    }
    if session.oracle.is_none() {
        return Err(ValidationError::MissingCredential("extraction API key".to_string()));
    }
    Ok(())
}

fn verify_scopes(session: &SyncSession) -> Result<(), ValidationError> {
    let token = &session.credential;
    match STORAGE_SCOPES
        .iter()
        .find(|scope| !token.scopes.iter().any(|granted| granted == *scope))
    {
        Some(missing) => Err(ValidationError::InsufficientScope {
            account: token.account.clone(),
            scope: missing.to_string(),
        }),
        None => Ok(()),
    }
}

fn new_record(
    candidate: InvoiceCandidate,
    owner_id: Option<String>,
    review_threshold: u8,
) -> InvoiceRecord {
    let now = now_rfc3339();
    let needs_review = candidate.confidence_score < review_threshold;
    InvoiceRecord {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id,
        document_type: candidate.document_type,
        cost_classification: candidate.cost_classification,
        doc_date: candidate.doc_date,
        doc_year: candidate.doc_year,
        supplier_name: candidate.supplier_name,
        supplier_tax_id: candidate.supplier_tax_id,
        doc_number: candidate.doc_number,
        total_amount: candidate.total_amount,
        tax_amount: candidate.tax_amount,
        summary: candidate.summary,
        file_id: None,
        file_link: None,
        ledger_id: None,
        status: if needs_review {
            InvoiceStatus::Review
        } else {
            InvoiceStatus::Processed
        },
        confidence_score: candidate.confidence_score,
        manual_review: needs_review,
        created_at: now.clone(),
        updated_at: now,
    }
}

#[tracing::instrument(
    skip(session, request),
    fields(file = %request.file_name, size = request.bytes.len())
)]
pub async fn process_invoice(
    session: &SyncSession,
    request: IngestRequest,
) -> SyncResult<IngestOutcome> {
    let file_hash = sha256_bytes(&request.bytes);
    match run_pipeline(session, request, &file_hash).await {
        Ok(outcome) => Ok(outcome),
        Err(error) => {
            tracing::warn!(%error, "Ingestion failed");
            session.log(None, Some(&file_hash), "ingest", "failed", Some(&error.to_string()));
            Err(error)
        }
    }
}

async fn run_pipeline(
    session: &SyncSession,
    request: IngestRequest,
    file_hash: &str,
) -> SyncResult<IngestOutcome> {
    validate(session, &request)?;
    verify_scopes(session)?;
    let oracle = session
        .oracle
        .as_ref()
        .ok_or_else(|| ValidationError::MissingCredential("extraction API key".to_string()))?;

    let extracted = oracle
        .extract(&request.bytes, &request.mime_type)
        .await
        .map_err(SyncError::Extraction)?;
    let candidate = to_candidate(extracted)?;
    tracing::debug!(
        supplier = %candidate.supplier_name,
        doc_date = %candidate.doc_date,
        confidence = candidate.confidence_score,
        "Extracted candidate"
    );

    if let Some(duplicate) = find_duplicate(session.store.as_ref(), &candidate)? {
        tracing::info!(
            existing_id = %duplicate.existing.id,
            reason = ?duplicate.reason,
            "Duplicate invoice skipped"
        );
        session.log(Some(&duplicate.existing.id), Some(file_hash), "ingest", "duplicate", None);
        return Ok(IngestOutcome::Duplicate {
            existing_id: duplicate.existing.id,
        });
    }

    let folders = session
        .resolver
        .ensure_path(candidate.doc_year, candidate.cost_classification)
        .await
        .map_err(SyncError::Storage)?;

    let tab = tab_for_date(&candidate.doc_date).ok_or_else(|| ValidationError::InvalidField {
        field: "doc_date",
        reason: candidate.doc_date.clone(),
    })?;
    let workbook_id = session
        .resolver
        .ensure_yearly_ledger(candidate.doc_year, &folders.year)
        .await
        .map_err(SyncError::Ledger)?;
    session
        .resolver
        .ensure_tab(&workbook_id, &tab)
        .await
        .map_err(SyncError::Ledger)?;

    let file_name = stored_file_name(
        &candidate.doc_date,
        &candidate.supplier_name,
        candidate.total_amount,
        &request.file_name,
    );
    let stored = session
        .files
        .upload_file(&file_name, &request.mime_type, request.bytes, &folders.classification)
        .await
        .map_err(SyncError::Storage)?;

    let mut record = new_record(candidate, request.owner_id, session.options.review_threshold);
    record.file_id = Some(stored.id);
    record.file_link = stored.web_view_link;
    record.ledger_id = Some(workbook_id.clone());
    if let Err(error) = session.store.insert_invoice(&record) {
        tracing::error!(
            file_id = ?record.file_id,
            %error,
            "Record insert failed after upload, stored file is orphaned"
        );
        return Err(error.into());
    }

    let ledger_appended = match session
        .ledger
        .append_row(&workbook_id, &tab, &ledger_row(&record))
        .await
    {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(
                invoice_id = %record.id,
                workbook_id = %workbook_id,
                tab = %tab,
                %error,
                "Ledger append failed"
            );
            session.log(
                Some(&record.id),
                Some(file_hash),
                "ledger",
                "sync_debt",
                Some(&error.to_string()),
            );
            false
        }
    };

    session.log(Some(&record.id), Some(file_hash), "ingest", record.status.as_str(), None);
    tracing::info!(
        invoice_id = %record.id,
        status = record.status.as_str(),
        ledger_appended,
        "Invoice ingested"
    );
    Ok(IngestOutcome::Processed {
        record,
        ledger_appended,
    })
}
