use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{format_decimal, normalize_supplier, year_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClassification {
    Fixed,
    Variable,
}

impl CostClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostClassification::Fixed => "fixed",
            CostClassification::Variable => "variable",
        }
    }

    /// Accepts the stored form as well as the labels the extraction model tends to emit.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "fixed" | "fixo" | "fixa" | "custo fixo" | "custos fixos" => {
                Some(CostClassification::Fixed)
            }
            "variable" | "variavel" | "variável" | "custo variável" | "custos variáveis" => {
                Some(CostClassification::Variable)
            }
            _ => None,
        }
    }

    pub fn ledger_label(&self) -> &'static str {
        match self {
            CostClassification::Fixed => "Fixo",
            CostClassification::Variable => "Variável",
        }
    }
}

/// Folder name under the year folder; unclassified documents share one bucket.
pub fn classification_folder(classification: Option<CostClassification>) -> &'static str {
    match classification {
        Some(CostClassification::Fixed) => "Custos Fixos",
        Some(CostClassification::Variable) => "Custos Variáveis",
        None => "Sem Classificação",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Processed,
    Review,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Processed => "processed",
            InvoiceStatus::Review => "review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processed" => Some(InvoiceStatus::Processed),
            "review" => Some(InvoiceStatus::Review),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: String,
    pub owner_id: Option<String>,
    pub document_type: String,
    pub cost_classification: Option<CostClassification>,
    pub doc_date: String,
    pub doc_year: i32,
    pub supplier_name: String,
    pub supplier_tax_id: Option<String>,
    pub doc_number: Option<String>,
    pub total_amount: f64,
    pub tax_amount: Option<f64>,
    pub summary: Option<String>,
    pub file_id: Option<String>,
    pub file_link: Option<String>,
    pub ledger_id: Option<String>,
    pub status: InvoiceStatus,
    pub confidence_score: u8,
    pub manual_review: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl InvoiceRecord {
    pub fn snapshot(&self) -> RowSnapshot {
        RowSnapshot {
            doc_number: self.doc_number.clone(),
            supplier_name: self.supplier_name.clone(),
            total_amount: self.total_amount,
            doc_date: self.doc_date.clone(),
        }
    }
}

/// Changed fields of an update. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoicePatch {
    pub document_type: Option<String>,
    pub cost_classification: Option<Option<CostClassification>>,
    pub doc_date: Option<String>,
    pub doc_year: Option<i32>,
    pub supplier_name: Option<String>,
    pub supplier_tax_id: Option<Option<String>>,
    pub doc_number: Option<Option<String>>,
    pub total_amount: Option<f64>,
    pub tax_amount: Option<Option<f64>>,
    pub summary: Option<Option<String>>,
    pub status: Option<InvoiceStatus>,
}

impl InvoicePatch {
    pub fn is_empty(&self) -> bool {
        *self == InvoicePatch::default()
    }

    /// A new date moves the year with it unless a year is given explicitly.
    pub fn apply_to(&self, record: &mut InvoiceRecord) {
        if let Some(value) = &self.document_type {
            record.document_type = value.clone();
        }
        if let Some(value) = self.cost_classification {
            record.cost_classification = value;
        }
        if let Some(value) = &self.doc_date {
            record.doc_date = value.clone();
            if self.doc_year.is_none() {
                if let Some(year) = year_of(value) {
                    record.doc_year = year;
                }
            }
        }
        if let Some(value) = self.doc_year {
            record.doc_year = value;
        }
        if let Some(value) = &self.supplier_name {
            record.supplier_name = normalize_supplier(value);
        }
        if let Some(value) = &self.supplier_tax_id {
            record.supplier_tax_id = value.clone();
        }
        if let Some(value) = &self.doc_number {
            record.doc_number = value.clone();
        }
        if let Some(value) = self.total_amount {
            record.total_amount = value;
        }
        if let Some(value) = self.tax_amount {
            record.tax_amount = value;
        }
        if let Some(value) = &self.summary {
            record.summary = value.clone();
        }
        if let Some(value) = self.status {
            record.status = value;
            record.manual_review = value == InvoiceStatus::Review;
        }
    }
}

/// Fields used to rediscover a ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSnapshot {
    pub doc_number: Option<String>,
    pub supplier_name: String,
    pub total_amount: f64,
    pub doc_date: String,
}

/// Fixed column layout of every month tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerColumn {
    Date,
    Supplier,
    TaxId,
    Classification,
    DocNumber,
    Amount,
    Tax,
    Summary,
    FileLink,
    ProcessedAt,
}

impl LedgerColumn {
    pub const ALL: [LedgerColumn; 10] = [
        LedgerColumn::Date,
        LedgerColumn::Supplier,
        LedgerColumn::TaxId,
        LedgerColumn::Classification,
        LedgerColumn::DocNumber,
        LedgerColumn::Amount,
        LedgerColumn::Tax,
        LedgerColumn::Summary,
        LedgerColumn::FileLink,
        LedgerColumn::ProcessedAt,
    ];

    pub fn index(&self) -> usize {
        match self {
            LedgerColumn::Date => 0,
            LedgerColumn::Supplier => 1,
            LedgerColumn::TaxId => 2,
            LedgerColumn::Classification => 3,
            LedgerColumn::DocNumber => 4,
            LedgerColumn::Amount => 5,
            LedgerColumn::Tax => 6,
            LedgerColumn::Summary => 7,
            LedgerColumn::FileLink => 8,
            LedgerColumn::ProcessedAt => 9,
        }
    }

    pub fn letter(&self) -> char {
        (b'A' + self.index() as u8) as char
    }

    pub fn header(&self) -> &'static str {
        match self {
            LedgerColumn::Date => "Data",
            LedgerColumn::Supplier => "Fornecedor",
            LedgerColumn::TaxId => "NIF",
            LedgerColumn::Classification => "Classificação",
            LedgerColumn::DocNumber => "Nº Documento",
            LedgerColumn::Amount => "Total",
            LedgerColumn::Tax => "IVA",
            LedgerColumn::Summary => "Resumo",
            LedgerColumn::FileLink => "Link",
            LedgerColumn::ProcessedAt => "Processado em",
        }
    }
}

pub fn ledger_header() -> Vec<String> {
    LedgerColumn::ALL.iter().map(|c| c.header().to_string()).collect()
}

pub fn ledger_cell(record: &InvoiceRecord, column: LedgerColumn) -> String {
    match column {
        LedgerColumn::Date => record.doc_date.clone(),
        LedgerColumn::Supplier => record.supplier_name.clone(),
        LedgerColumn::TaxId => record.supplier_tax_id.clone().unwrap_or_default(),
        LedgerColumn::Classification => record
            .cost_classification
            .map(|c| c.ledger_label().to_string())
            .unwrap_or_default(),
        LedgerColumn::DocNumber => record.doc_number.clone().unwrap_or_default(),
        LedgerColumn::Amount => format_decimal(record.total_amount),
        LedgerColumn::Tax => record.tax_amount.map(format_decimal).unwrap_or_default(),
        LedgerColumn::Summary => record.summary.clone().unwrap_or_default(),
        LedgerColumn::FileLink => record.file_link.clone().unwrap_or_default(),
        LedgerColumn::ProcessedAt => record.updated_at.get(..10).unwrap_or_default().to_string(),
    }
}

pub fn ledger_row(record: &InvoiceRecord) -> Vec<String> {
    LedgerColumn::ALL
        .iter()
        .map(|column| ledger_cell(record, *column))
        .collect()
}

/// Columns whose rendered value differs between two versions of a record.
pub fn changed_columns(before: &InvoiceRecord, after: &InvoiceRecord) -> Vec<LedgerColumn> {
    LedgerColumn::ALL
        .iter()
        .copied()
        .filter(|c| *c != LedgerColumn::ProcessedAt)
        .filter(|c| ledger_cell(before, *c) != ledger_cell(after, *c))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub account: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub is_primary_storage: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Credential {
    pub fn has_scopes(&self, required: &[&str]) -> bool {
        required
            .iter()
            .all(|scope| self.scopes.iter().any(|granted| granted == scope))
    }
}

/// Raw oracle output before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedInvoiceData {
    pub document_type: Option<String>,
    pub cost_classification: Option<String>,
    pub doc_date: Option<String>,
    pub doc_year: Option<i32>,
    pub supplier_name: Option<String>,
    pub supplier_tax_id: Option<String>,
    pub doc_number: Option<String>,
    pub total_amount: Option<f64>,
    pub tax_amount: Option<f64>,
    pub summary: Option<String>,
    pub confidence: Option<f64>,
}

/// Validated, normalized extraction result.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceCandidate {
    pub document_type: String,
    pub cost_classification: Option<CostClassification>,
    pub doc_date: String,
    pub doc_year: i32,
    pub supplier_name: String,
    pub supplier_tax_id: Option<String>,
    pub doc_number: Option<String>,
    pub total_amount: f64,
    pub tax_amount: Option<f64>,
    pub summary: Option<String>,
    pub confidence_score: u8,
}

/// One document handed to the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Processed {
        record: InvoiceRecord,
        ledger_appended: bool,
    },
    Duplicate {
        existing_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAction {
    /// Row moved to another workbook (year change).
    MovedAcrossWorkbooks,
    /// Row moved to another tab of the same workbook (month change).
    MovedAcrossTabs,
    CellsUpdated,
    /// Nothing in the ledger reflects the changed fields.
    NoChange,
    /// No row found; left as sync debt.
    NotFound,
    Failed,
}

impl LedgerAction {
    pub fn updated(&self) -> bool {
        matches!(
            self,
            LedgerAction::MovedAcrossWorkbooks
                | LedgerAction::MovedAcrossTabs
                | LedgerAction::CellsUpdated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateReport {
    pub invoice_id: String,
    pub file_moved: bool,
    pub ledger_action: LedgerAction,
}

impl UpdateReport {
    pub fn ledger_updated(&self) -> bool {
        self.ledger_action.updated()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub invoice_id: String,
    pub ledger_row_deleted: bool,
    pub file_deleted: bool,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub accounts: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub max_requests: usize,
    pub window_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_redirect_uri: String,
    pub token_endpoint: String,
    pub token_secret: String,
    pub extraction_api_key: Option<String>,
    pub extraction_base_url: String,
    pub extraction_model: String,
    pub root_folder_name: String,
    pub max_file_size_bytes: usize,
    pub allowed_mime_types: Vec<String>,
    pub review_threshold: u8,
    pub token_refresh_buffer_secs: i64,
    pub inter_item_delay_ms: u64,
    pub export_batch_size: usize,
    pub mailbox_lookback_hours: i64,
    pub extraction_rate: RateLimit,
    pub drive_rate: RateLimit,
    pub sheets_rate: RateLimit,
    pub gmail_rate: RateLimit,
}
