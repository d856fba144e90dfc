use futures::future::join_all;
use std::path::{Path, PathBuf};

use crate::models::InvoiceRecord;
use crate::services::drive::FileStorage;
use crate::utils::stored_file_name;

#[derive(Debug, Default)]
pub struct ExportReport {
    pub written: Vec<PathBuf>,
    /// Invoice id and reason for every item that could not be exported.
    pub failed: Vec<(String, String)>,
    pub skipped: usize,
}

fn extension_for(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"%PDF") {
        "pdf"
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(&b"WEBP"[..]) {
        "webp"
    } else {
        "bin"
    }
}

async fn export_one(
    files: &dyn FileStorage,
    record: &InvoiceRecord,
    file_id: &str,
    dir: &Path,
) -> Result<PathBuf, String> {
    let bytes = files
        .download_file(file_id)
        .await
        .map_err(|e| e.to_string())?;
    let name = stored_file_name(
        &record.doc_date,
        &record.supplier_name,
        record.total_amount,
        &format!("file.{}", extension_for(&bytes)),
    );
    let prefix: String = record.id.chars().take(8).collect();
    let path = dir.join(format!("{}_{}", prefix, name));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| format!("write {}: {}", path.display(), e))?;
    Ok(path)
}

/// Downloads the stored files of `records` into `dir`, `batch_size` at a time.
/// A failed item is reported and does not stop the rest.
pub async fn export_files(
    files: &dyn FileStorage,
    records: &[InvoiceRecord],
    dir: &Path,
    batch_size: usize,
) -> std::io::Result<ExportReport> {
    tokio::fs::create_dir_all(dir).await?;
    let mut report = ExportReport::default();

    let exportable: Vec<(&InvoiceRecord, &str)> = records
        .iter()
        .filter_map(|r| r.file_id.as_deref().map(|id| (r, id)))
        .collect();
    report.skipped = records.len() - exportable.len();

    for batch in exportable.chunks(batch_size.max(1)) {
        let results = join_all(
            batch
                .iter()
                .map(|(record, file_id)| export_one(files, record, file_id, dir)),
        )
        .await;
        for ((record, _), result) in batch.iter().zip(results) {
            match result {
                Ok(path) => report.written.push(path),
                Err(reason) => {
                    tracing::warn!(invoice_id = %record.id, %reason, "Export failed");
                    report.failed.push((record.id.clone(), reason));
                }
            }
        }
    }

    tracing::info!(
        written = report.written.len(),
        failed = report.failed.len(),
        skipped = report.skipped,
        "Export finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_document_types() {
        assert_eq!(extension_for(b"%PDF-1.7"), "pdf");
        assert_eq!(extension_for(&[0x89, b'P', b'N', b'G', 0x0D]), "png");
        assert_eq!(extension_for(&[0xFF, 0xD8, 0xFF, 0xE0]), "jpg");
        assert_eq!(extension_for(b"RIFF\0\0\0\0WEBPVP8 "), "webp");
        assert_eq!(extension_for(b"hello"), "bin");
    }
}
