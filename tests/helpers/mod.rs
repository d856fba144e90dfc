#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use faturas_sync::db::{Database, InvoiceFilter, RecordStore};
use faturas_sync::error::{ServiceError, ServiceResult, StoreError};
use faturas_sync::models::{
    ledger_row, CostClassification, ExtractedInvoiceData, InvoicePatch, InvoiceRecord,
    InvoiceStatus, RunSummary,
};
use faturas_sync::services::credentials::{AccessToken, TokenFreshness};
use faturas_sync::services::crypto::TokenCipher;
use faturas_sync::services::drive::{FileStorage, NodeKind, StoredFile};
use faturas_sync::services::extraction::ExtractionOracle;
use faturas_sync::services::gmail::{AttachmentRef, MailMessage, MailSource};
use faturas_sync::services::google::STORAGE_SCOPES;
use faturas_sync::services::sheets::{CellUpdate, LedgerService, TabInfo, FIRST_DATA_ROW};
use faturas_sync::services::state::{SyncOptions, SyncSession};

pub fn database() -> Arc<Mutex<Database>> {
    let cipher = TokenCipher::new("test-secret").unwrap();
    Arc::new(Mutex::new(Database::open_in_memory(cipher).unwrap()))
}

fn injected(service: &'static str) -> ServiceError {
    ServiceError::other(service, "injected failure")
}

fn rejected(service: &'static str, status: u16, body: &str) -> ServiceError {
    ServiceError::Status {
        service,
        status,
        body: body.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub parent: Option<String>,
    pub kind: Option<NodeKind>,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct DriveState {
    pub nodes: HashMap<String, Node>,
    pub next_id: usize,
    pub creates: usize,
    pub moves: Vec<(String, String)>,
    pub deleted: Vec<String>,
}

/// In-memory folder tree. Files are nodes without a kind.
#[derive(Clone, Default)]
pub struct FakeDrive {
    pub state: Arc<Mutex<DriveState>>,
    pub fail_move: Arc<AtomicBool>,
    pub fail_delete: Arc<AtomicBool>,
    pub fail_upload: Arc<AtomicBool>,
    pub downloads_in_flight: Arc<AtomicUsize>,
    pub peak_downloads: Arc<AtomicUsize>,
}

impl FakeDrive {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &self,
        name: &str,
        parent: Option<&str>,
        kind: Option<NodeKind>,
        bytes: Vec<u8>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("node-{}", state.next_id);
        state.nodes.insert(
            id.clone(),
            Node {
                id: id.clone(),
                name: name.to_string(),
                parent: parent.map(str::to_string),
                kind,
                bytes,
            },
        );
        id
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(id).cloned()
    }

    pub fn parent_of(&self, id: &str) -> Option<String> {
        self.node(id).and_then(|n| n.parent)
    }

    /// Folder names from the root down to the node's parent.
    pub fn path_of(&self, id: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = self.parent_of(id);
        while let Some(parent) = current {
            let node = self.node(&parent).unwrap();
            names.push(node.name.clone());
            current = node.parent;
        }
        names.reverse();
        names
    }

    pub fn count_named(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.name == name)
            .count()
    }

    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    pub fn moves(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().moves.clone()
    }

    pub fn files(&self) -> Vec<Node> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.kind.is_none())
            .cloned()
            .collect()
    }

    pub fn find_by_name(&self, name: &str, parent: Option<&str>) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .values()
            .find(|n| n.name == name && n.parent.as_deref() == parent)
            .map(|n| n.id.clone())
    }

    /// Adds a stored file directly, for records that did not come through ingestion.
    pub fn put_file(&self, name: &str, parent: &str, bytes: &[u8]) -> String {
        self.insert(name, Some(parent), None, bytes.to_vec())
    }
}

#[async_trait]
impl FileStorage for FakeDrive {
    async fn find_node(
        &self,
        name: &str,
        parent: Option<&str>,
        kind: NodeKind,
    ) -> ServiceResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nodes
            .values()
            .find(|n| n.name == name && n.parent.as_deref() == parent && n.kind == Some(kind))
            .map(|n| n.id.clone()))
    }

    async fn create_node(
        &self,
        name: &str,
        parent: Option<&str>,
        kind: NodeKind,
    ) -> ServiceResult<String> {
        let id = self.insert(name, parent, Some(kind), Vec::new());
        self.state.lock().unwrap().creates += 1;
        Ok(id)
    }

    async fn upload_file(
        &self,
        name: &str,
        _mime_type: &str,
        bytes: Vec<u8>,
        parent: &str,
    ) -> ServiceResult<StoredFile> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(injected("drive"));
        }
        let id = self.insert(name, Some(parent), None, bytes);
        Ok(StoredFile {
            web_view_link: Some(format!("https://drive.example/{}", id)),
            id,
        })
    }

    async fn move_file(&self, file_id: &str, new_parent: &str) -> ServiceResult<()> {
        if self.fail_move.load(Ordering::SeqCst) {
            return Err(injected("drive"));
        }
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get_mut(file_id)
            .ok_or_else(|| rejected("drive", 404, ""))?;
        node.parent = Some(new_parent.to_string());
        state.moves.push((file_id.to_string(), new_parent.to_string()));
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> ServiceResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(injected("drive"));
        }
        let mut state = self.state.lock().unwrap();
        state.nodes.remove(file_id);
        state.deleted.push(file_id.to_string());
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> ServiceResult<Vec<u8>> {
        let now = self.downloads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_downloads.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.downloads_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.node(file_id)
            .map(|n| n.bytes)
            .ok_or_else(|| rejected("drive", 404, ""))
    }
}

#[derive(Debug, Clone)]
pub struct FakeTab {
    pub title: String,
    pub sheet_id: i64,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Default)]
pub struct LedgerState {
    pub workbooks: HashMap<String, Vec<FakeTab>>,
    pub next_sheet_id: i64,
    pub header_writes: usize,
    pub reads: usize,
    pub cell_updates: Vec<CellUpdate>,
    pub deletes: usize,
    pub appends: usize,
}

#[derive(Clone, Default)]
pub struct FakeLedger {
    pub state: Arc<Mutex<LedgerState>>,
    pub fail_append: Arc<AtomicBool>,
    pub fail_delete: Arc<AtomicBool>,
    pub fail_all: Arc<AtomicBool>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> ServiceResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(injected("sheets"));
        }
        Ok(())
    }

    pub fn rows(&self, workbook_id: &str, tab: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .workbooks
            .get(workbook_id)
            .and_then(|tabs| tabs.iter().find(|t| t.title == tab))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn tab(&self, workbook_id: &str, tab: &str) -> Option<FakeTab> {
        self.state
            .lock()
            .unwrap()
            .workbooks
            .get(workbook_id)
            .and_then(|tabs| tabs.iter().find(|t| t.title == tab).cloned())
    }

    /// Seeds a tab with rows, creating it if needed.
    pub fn seed(&self, workbook_id: &str, tab: &str, rows: Vec<Vec<String>>) {
        let mut state = self.state.lock().unwrap();
        state.next_sheet_id += 1;
        let sheet_id = state.next_sheet_id;
        let tabs = state.workbooks.entry(workbook_id.to_string()).or_default();
        match tabs.iter_mut().find(|t| t.title == tab) {
            Some(existing) => existing.rows.extend(rows),
            None => tabs.push(FakeTab {
                title: tab.to_string(),
                sheet_id,
                header: faturas_sync::models::ledger_header(),
                rows,
            }),
        }
    }

    pub fn header_writes(&self) -> usize {
        self.state.lock().unwrap().header_writes
    }

    pub fn cell_updates(&self) -> Vec<CellUpdate> {
        self.state.lock().unwrap().cell_updates.clone()
    }

    pub fn deletes(&self) -> usize {
        self.state.lock().unwrap().deletes
    }

    pub fn appends(&self) -> usize {
        self.state.lock().unwrap().appends
    }

    pub fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }

    pub fn mutations(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.cell_updates.len() + state.deletes + state.appends
    }
}

#[async_trait]
impl LedgerService for FakeLedger {
    async fn list_tabs(&self, workbook_id: &str) -> ServiceResult<Vec<TabInfo>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .workbooks
            .get(workbook_id)
            .map(|tabs| {
                tabs.iter()
                    .map(|t| TabInfo { title: t.title.clone(), sheet_id: t.sheet_id })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_tab(
        &self,
        workbook_id: &str,
        title: &str,
        header: &[String],
    ) -> ServiceResult<TabInfo> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.next_sheet_id += 1;
        state.header_writes += 1;
        let sheet_id = state.next_sheet_id;
        state
            .workbooks
            .entry(workbook_id.to_string())
            .or_default()
            .push(FakeTab {
                title: title.to_string(),
                sheet_id,
                header: header.to_vec(),
                rows: Vec::new(),
            });
        Ok(TabInfo { title: title.to_string(), sheet_id })
    }

    async fn append_row(
        &self,
        workbook_id: &str,
        tab: &str,
        values: &[String],
    ) -> ServiceResult<()> {
        self.check()?;
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(injected("sheets"));
        }
        let mut state = self.state.lock().unwrap();
        state.appends += 1;
        let target = state
            .workbooks
            .get_mut(workbook_id)
            .and_then(|tabs| tabs.iter_mut().find(|t| t.title == tab))
            .ok_or_else(|| rejected("sheets", 400, "no such tab"))?;
        target.rows.push(values.to_vec());
        Ok(())
    }

    async fn read_rows(&self, workbook_id: &str, tab: &str) -> ServiceResult<Vec<Vec<String>>> {
        self.check()?;
        self.state.lock().unwrap().reads += 1;
        Ok(self.rows(workbook_id, tab))
    }

    async fn update_cells(&self, workbook_id: &str, updates: &[CellUpdate]) -> ServiceResult<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        for update in updates {
            let tab = state
                .workbooks
                .get_mut(workbook_id)
                .and_then(|tabs| tabs.iter_mut().find(|t| t.title == update.tab))
                .ok_or_else(|| rejected("sheets", 400, "no such tab"))?;
            let row = &mut tab.rows[update.row - FIRST_DATA_ROW];
            if row.len() <= update.column.index() {
                row.resize(update.column.index() + 1, String::new());
            }
            row[update.column.index()] = update.value.clone();
        }
        state.cell_updates.extend(updates.iter().cloned());
        Ok(())
    }

    async fn delete_row(&self, workbook_id: &str, sheet_id: i64, row: usize) -> ServiceResult<()> {
        self.check()?;
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(injected("sheets"));
        }
        let mut state = self.state.lock().unwrap();
        state.deletes += 1;
        let tab = state
            .workbooks
            .get_mut(workbook_id)
            .and_then(|tabs| tabs.iter_mut().find(|t| t.sheet_id == sheet_id))
            .ok_or_else(|| rejected("sheets", 400, "no such sheet"))?;
        tab.rows.remove(row - FIRST_DATA_ROW);
        Ok(())
    }
}

/// Returns queued responses in order, then repeats the last one.
#[derive(Clone, Default)]
pub struct FakeOracle {
    pub responses: Arc<Mutex<VecDeque<ExtractedInvoiceData>>>,
    pub calls: Arc<AtomicUsize>,
}

impl FakeOracle {
    pub fn returning(data: ExtractedInvoiceData) -> Self {
        let oracle = Self::default();
        oracle.push(data);
        oracle
    }

    pub fn push(&self, data: ExtractedInvoiceData) {
        self.responses.lock().unwrap().push_back(data);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionOracle for FakeOracle {
    async fn extract(
        &self,
        _bytes: &[u8],
        _mime_type: &str,
    ) -> ServiceResult<ExtractedInvoiceData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        let next = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        next.ok_or_else(|| ServiceError::other("extraction", "no response queued"))
    }
}

#[derive(Clone, Default)]
pub struct FakeMailbox {
    pub messages: Arc<Mutex<Vec<(MailMessage, HashMap<String, Vec<u8>>)>>>,
    pub read: Arc<Mutex<Vec<String>>>,
}

impl FakeMailbox {
    pub fn add_message(&self, id: &str, attachments: Vec<(&str, &str, &[u8])>) {
        let mut refs = Vec::new();
        let mut bodies = HashMap::new();
        for (index, (name, mime, bytes)) in attachments.into_iter().enumerate() {
            let attachment_id = format!("{}-att-{}", id, index);
            refs.push(AttachmentRef {
                attachment_id: attachment_id.clone(),
                file_name: name.to_string(),
                mime_type: mime.to_string(),
                size: bytes.len(),
            });
            bodies.insert(attachment_id, bytes.to_vec());
        }
        self.messages.lock().unwrap().push((
            MailMessage {
                id: id.to_string(),
                subject: None,
                attachments: refs,
            },
            bodies,
        ));
    }

    pub fn read_ids(&self) -> Vec<String> {
        self.read.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSource for FakeMailbox {
    async fn list_unread(&self, _since: DateTime<Utc>) -> ServiceResult<Vec<MailMessage>> {
        let read = self.read_ids();
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| !read.contains(&m.id))
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment: &AttachmentRef,
    ) -> ServiceResult<Vec<u8>> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|(m, _)| m.id == message_id)
            .and_then(|(_, bodies)| bodies.get(&attachment.attachment_id).cloned())
            .ok_or_else(|| ServiceError::other("gmail", "unknown attachment"))
    }

    async fn mark_read(&self, message_id: &str) -> ServiceResult<()> {
        self.read.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}

/// Record store whose writes can be made to fail.
pub struct FlakyStore {
    pub inner: Arc<Mutex<Database>>,
    pub fail_update: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<Mutex<Database>>) -> Self {
        Self {
            inner,
            fail_update: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        }
    }
}

fn store_failure() -> StoreError {
    StoreError::Corrupt("injected failure".to_string())
}

impl RecordStore for FlakyStore {
    fn insert_invoice(&self, invoice: &InvoiceRecord) -> Result<(), StoreError> {
        self.inner.insert_invoice(invoice)
    }

    fn get_invoice(&self, id: &str) -> Result<Option<InvoiceRecord>, StoreError> {
        self.inner.get_invoice(id)
    }

    fn update_invoice(&self, id: &str, patch: &InvoicePatch) -> Result<InvoiceRecord, StoreError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(store_failure());
        }
        self.inner.update_invoice(id, patch)
    }

    fn set_ledger_reference(&self, id: &str, ledger_id: &str) -> Result<(), StoreError> {
        self.inner.set_ledger_reference(id, ledger_id)
    }

    fn delete_invoice(&self, id: &str) -> Result<bool, StoreError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(store_failure());
        }
        self.inner.delete_invoice(id)
    }

    fn find_by_doc_number(&self, doc_number: &str) -> Result<Vec<InvoiceRecord>, StoreError> {
        self.inner.find_by_doc_number(doc_number)
    }

    fn find_without_doc_number(
        &self,
        supplier_name: &str,
        doc_date: &str,
        total_amount: f64,
    ) -> Result<Vec<InvoiceRecord>, StoreError> {
        self.inner.find_without_doc_number(supplier_name, doc_date, total_amount)
    }

    fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<InvoiceRecord>, StoreError> {
        self.inner.list_invoices(filter)
    }

    fn log_processing(
        &self,
        invoice_id: Option<&str>,
        file_hash: Option<&str>,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.inner.log_processing(invoice_id, file_hash, process_type, status, message)
    }

    fn record_run(&self, started_at: &str, summary: &RunSummary) -> Result<(), StoreError> {
        self.inner.record_run(started_at, summary)
    }

    fn last_run(&self) -> Result<Option<RunSummary>, StoreError> {
        self.inner.last_run()
    }
}

pub fn options() -> SyncOptions {
    SyncOptions {
        max_file_size_bytes: 10 * 1024 * 1024,
        allowed_mime_types: vec![
            "application/pdf".to_string(),
            "image/jpeg".to_string(),
            "image/png".to_string(),
        ],
        review_threshold: 70,
        root_folder_name: "FATURAS".to_string(),
    }
}

pub fn storage_token() -> AccessToken {
    AccessToken {
        account: "storage@example.com".to_string(),
        token: "ya29.test".to_string(),
        scopes: STORAGE_SCOPES.iter().map(|s| s.to_string()).collect(),
        freshness: TokenFreshness::Fresh,
    }
}

pub struct Harness {
    pub db: Arc<Mutex<Database>>,
    pub drive: FakeDrive,
    pub ledger: FakeLedger,
    pub oracle: FakeOracle,
    pub session: SyncSession,
}

pub fn harness_with_store(
    store: Arc<dyn RecordStore>,
    db: Arc<Mutex<Database>>,
    oracle: FakeOracle,
) -> Harness {
    let drive = FakeDrive::new();
    let ledger = FakeLedger::new();
    let session = SyncSession::new(
        store,
        Arc::new(drive.clone()),
        Arc::new(ledger.clone()),
        Some(Arc::new(oracle.clone())),
        storage_token(),
        options(),
    );
    Harness {
        db,
        drive,
        ledger,
        oracle,
        session,
    }
}

pub fn harness(oracle: FakeOracle) -> Harness {
    let db = database();
    harness_with_store(db.clone(), db, oracle)
}

pub fn extracted(
    supplier: &str,
    date: &str,
    amount: f64,
    doc_number: Option<&str>,
    summary: Option<&str>,
    confidence: f64,
) -> ExtractedInvoiceData {
    ExtractedInvoiceData {
        document_type: Some("fatura".to_string()),
        cost_classification: Some("variable".to_string()),
        doc_date: Some(date.to_string()),
        doc_year: None,
        supplier_name: Some(supplier.to_string()),
        supplier_tax_id: Some("500697370".to_string()),
        doc_number: doc_number.map(str::to_string),
        total_amount: Some(amount),
        tax_amount: Some(7.95),
        summary: summary.map(str::to_string),
        confidence: Some(confidence),
    }
}

pub fn pdf_request(name: &str) -> faturas_sync::models::IngestRequest {
    faturas_sync::models::IngestRequest {
        file_name: name.to_string(),
        mime_type: "application/pdf".to_string(),
        bytes: b"%PDF-1.7 test".to_vec(),
        owner_id: Some("mail@example.com".to_string()),
    }
}

/// A stored record, plus its row in the ledger and its file in the tree, as ingestion
/// would have left them.
pub async fn seed_invoice(
    h: &Harness,
    doc_date: &str,
    classification: Option<CostClassification>,
) -> InvoiceRecord {
    let year: i32 = doc_date[..4].parse().unwrap();
    let path = h.session.resolver.ensure_path(year, classification).await.unwrap();
    let workbook = h.session.resolver.ensure_yearly_ledger(year, &path.year).await.unwrap();
    let tab = faturas_sync::utils::tab_for_date(doc_date).unwrap();
    h.session.resolver.ensure_tab(&workbook, &tab).await.unwrap();
    let file_id = h.drive.put_file("invoice.pdf", &path.classification, b"%PDF-1.7 seeded");

    let record = InvoiceRecord {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: None,
        document_type: "fatura".to_string(),
        cost_classification: classification,
        doc_date: doc_date.to_string(),
        doc_year: year,
        supplier_name: "GALP".to_string(),
        supplier_tax_id: Some("500697370".to_string()),
        doc_number: Some("FT 2024/118".to_string()),
        total_amount: 42.5,
        tax_amount: Some(7.95),
        summary: Some("Combustível".to_string()),
        file_id: Some(file_id),
        file_link: Some("https://drive.example/seeded".to_string()),
        ledger_id: Some(workbook.clone()),
        status: InvoiceStatus::Processed,
        confidence_score: 92,
        manual_review: false,
        created_at: "2024-12-01T10:00:00+00:00".to_string(),
        updated_at: "2024-12-01T10:00:00+00:00".to_string(),
    };
    h.db.insert_invoice(&record).unwrap();
    h.ledger.seed(&workbook, &tab, vec![ledger_row(&record)]);
    record
}
