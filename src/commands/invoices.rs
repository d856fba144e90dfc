use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::InvoiceFilter;
use crate::models::{
    CostClassification, DeleteReport, IngestRequest, InvoicePatch, InvoiceRecord, InvoiceStatus,
    RunSummary, UpdateReport,
};
use crate::services::export::{export_files, ExportReport};
use crate::services::queue::{tally, AbortHandle, IngestQueue};
use crate::services::state::AppState;
use crate::services::{delete, update};
use crate::utils::{normalize_date, parse_decimal};

/// Field changes as typed on the command line. An empty value clears a nullable field.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct PatchInput {
    #[arg(long)]
    pub document_type: Option<String>,
    /// fixed, variable or none
    #[arg(long)]
    pub classification: Option<String>,
    #[arg(long)]
    pub date: Option<String>,
    #[arg(long)]
    pub year: Option<i32>,
    #[arg(long)]
    pub supplier: Option<String>,
    #[arg(long)]
    pub tax_id: Option<String>,
    #[arg(long)]
    pub doc_number: Option<String>,
    #[arg(long)]
    pub amount: Option<String>,
    #[arg(long)]
    pub tax: Option<String>,
    #[arg(long)]
    pub summary: Option<String>,
    /// processed or review
    #[arg(long)]
    pub status: Option<String>,
}

fn clearable(value: Option<String>) -> Option<Option<String>> {
    value.map(|v| {
        let trimmed = v.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}

impl PatchInput {
    pub fn into_patch(self) -> Result<InvoicePatch> {
        let cost_classification = match self.classification.as_deref().map(str::trim) {
            None => None,
            Some("") | Some("none") => Some(None),
            Some(raw) => Some(Some(
                CostClassification::parse(raw)
                    .ok_or_else(|| anyhow!("Unknown classification: {}", raw))?,
            )),
        };
        let doc_date = match self.date {
            Some(raw) => Some(
                normalize_date(Some(raw.clone()))
                    .ok_or_else(|| anyhow!("Invalid date: {}", raw))?,
            ),
            None => None,
        };
        let total_amount = match self.amount {
            Some(raw) => Some(parse_decimal(&raw).context("Invalid amount")?),
            None => None,
        };
        let tax_amount = match clearable(self.tax) {
            Some(Some(raw)) => Some(Some(parse_decimal(&raw).context("Invalid tax amount")?)),
            Some(None) => Some(None),
            None => None,
        };
        let status = match self.status {
            Some(raw) => Some(
                InvoiceStatus::parse(raw.trim())
                    .ok_or_else(|| anyhow!("Unknown status: {}", raw))?,
            ),
            None => None,
        };
        let supplier_name = match self.supplier {
            Some(raw) if raw.trim().is_empty() => return Err(anyhow!("Supplier cannot be empty")),
            other => other,
        };

        Ok(InvoicePatch {
            document_type: self.document_type,
            cost_classification,
            doc_date,
            doc_year: self.year,
            supplier_name,
            supplier_tax_id: clearable(self.tax_id),
            doc_number: clearable(self.doc_number),
            total_amount,
            tax_amount,
            summary: clearable(self.summary),
            status,
        })
    }
}

fn mime_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_lowercase();
    match extension.as_str() {
        "pdf" => Some("application/pdf"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Documents under `paths`, directories walked recursively.
pub fn collect_documents(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut documents: Vec<PathBuf> = paths
        .iter()
        .flat_map(|path| {
            walkdir::WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .filter(|e| mime_for(e.path()).is_some())
                .map(|e| e.path().to_path_buf())
        })
        .collect();
    documents.sort();
    documents.dedup();
    documents
}

pub async fn ingest(state: &AppState, paths: &[PathBuf], abort: AbortHandle) -> Result<RunSummary> {
    let documents = collect_documents(paths);
    if documents.is_empty() {
        return Err(anyhow!("No PDF or image files found"));
    }
    let session = state.open_session().await.context("Failed to open sync session")?;
    let queue = IngestQueue::new(Duration::from_millis(state.settings.inter_item_delay_ms), abort);
    let mut summary = RunSummary::default();

    for path in documents {
        let Some(mime_type) = mime_for(&path) else {
            continue;
        };
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let request = IngestRequest {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            mime_type: mime_type.to_string(),
            bytes,
            owner_id: None,
        };
        let Some(result) = queue.process(&session, request).await else {
            summary.aborted = true;
            break;
        };
        match &result {
            Ok(outcome) => tracing::info!(path = %path.display(), ?outcome, "Document ingested"),
            Err(error) => tracing::error!(path = %path.display(), %error, "Document rejected"),
        }
        tally(&mut summary, &result);
    }
    Ok(summary)
}

pub async fn update_invoice(
    state: &AppState,
    invoice_id: &str,
    input: PatchInput,
) -> Result<UpdateReport> {
    let patch = input.into_patch()?;
    if patch.is_empty() {
        return Err(anyhow!("Nothing to update"));
    }
    let session = state.open_session().await.context("Failed to open sync session")?;
    update::update_invoice(&session, invoice_id, &patch)
        .await
        .with_context(|| format!("Failed to update invoice {}", invoice_id))
}

pub async fn delete_invoice(state: &AppState, invoice_id: &str) -> Result<DeleteReport> {
    let session = state.open_session().await.context("Failed to open sync session")?;
    delete::delete_invoice(&session, invoice_id)
        .await
        .with_context(|| format!("Failed to delete invoice {}", invoice_id))
}

pub fn list_invoices(state: &AppState, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>> {
    Ok(state.store.list_invoices(filter)?)
}

pub async fn export_invoices(
    state: &AppState,
    filter: &InvoiceFilter,
    dir: &Path,
) -> Result<ExportReport> {
    let records = state.store.list_invoices(filter)?;
    let session = state.open_session().await.context("Failed to open sync session")?;
    export_files(session.files.as_ref(), &records, dir, state.settings.export_batch_size)
        .await
        .with_context(|| format!("Failed to export into {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_clear_nullable_fields() {
        let patch = PatchInput {
            doc_number: Some(" ".to_string()),
            classification: Some("none".to_string()),
            ..Default::default()
        }
        .into_patch()
        .unwrap();
        assert_eq!(patch.doc_number, Some(None));
        assert_eq!(patch.cost_classification, Some(None));
        assert_eq!(patch.summary, None);
    }

    #[test]
    fn values_are_parsed() {
        let patch = PatchInput {
            date: Some("02/03/2025".to_string()),
            amount: Some("1.234,56".to_string()),
            classification: Some("Fixo".to_string()),
            status: Some("review".to_string()),
            ..Default::default()
        }
        .into_patch()
        .unwrap();
        assert_eq!(patch.doc_date.as_deref(), Some("2025-03-02"));
        assert_eq!(patch.total_amount, Some(1234.56));
        assert_eq!(patch.cost_classification, Some(Some(CostClassification::Fixed)));
        assert_eq!(patch.status, Some(InvoiceStatus::Review));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(PatchInput { date: Some("yesterday".to_string()), ..Default::default() }
            .into_patch()
            .is_err());
        assert!(PatchInput { supplier: Some("  ".to_string()), ..Default::default() }
            .into_patch()
            .is_err());
    }

    #[test]
    fn collects_documents_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("jan")).unwrap();
        std::fs::write(dir.path().join("jan/a.pdf"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("b.JPG"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let found = collect_documents(&[dir.path().to_path_buf()]);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| mime_for(p).is_some()));
    }
}
