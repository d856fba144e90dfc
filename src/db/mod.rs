use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;

use crate::error::StoreError;
use crate::models::{
    CostClassification, Credential, InvoicePatch, InvoiceRecord, InvoiceStatus, RunSummary,
};
use crate::services::crypto::TokenCipher;
use crate::utils::{format_decimal, now_rfc3339};

mod store;

pub use store::{CredentialStore, InvoiceFilter, RecordStore};

const INVOICE_COLUMNS: &str = "id, owner_id, document_type, cost_classification, doc_date, doc_year,
    supplier_name, supplier_tax_id, doc_number, total_amount, tax_amount, summary, file_id,
    file_link, ledger_id, status, confidence_score, manual_review, created_at, updated_at";

const CREDENTIAL_COLUMNS: &str = "account, access_token, refresh_token, expires_at, scopes,
    is_primary_storage, created_at, updated_at";

pub struct Database {
    conn: Connection,
    cipher: TokenCipher,
}

impl Database {
    pub fn new(db_path: impl AsRef<Path>, cipher: TokenCipher) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, cipher)
    }

    pub fn open_in_memory(cipher: TokenCipher) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, cipher)
    }

    fn from_connection(conn: Connection, cipher: TokenCipher) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut db = Database { conn, cipher };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = vec![
            (
                "001_create_invoices.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/001_create_invoices.sql"
                )),
            ),
            (
                "002_create_credentials.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/002_create_credentials.sql"
                )),
            ),
            (
                "003_create_processing_logs_and_runs.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/003_create_processing_logs_and_runs.sql"
                )),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, datetime('now'))",
                    params![name],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    }

    pub fn insert_invoice(&self, invoice: &InvoiceRecord) -> SqlResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO invoices ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                 ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                INVOICE_COLUMNS
            ),
            params![
                invoice.id,
                invoice.owner_id,
                invoice.document_type,
                invoice.cost_classification.map(|c| c.as_str()),
                invoice.doc_date,
                invoice.doc_year,
                invoice.supplier_name,
                invoice.supplier_tax_id,
                invoice.doc_number,
                format_decimal(invoice.total_amount),
                invoice.tax_amount.map(format_decimal),
                invoice.summary,
                invoice.file_id,
                invoice.file_link,
                invoice.ledger_id,
                invoice.status.as_str(),
                invoice.confidence_score,
                invoice.manual_review,
                invoice.created_at,
                invoice.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn get_invoice_by_id(&self, id: &str) -> SqlResult<Option<InvoiceRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM invoices WHERE id = ?1", INVOICE_COLUMNS))?;
        stmt.query_row(params![id], invoice_from_row).optional()
    }

    /// Applies the patch and writes every mutable column back in one statement.
    pub fn update_invoice(
        &self,
        id: &str,
        patch: &InvoicePatch,
    ) -> Result<InvoiceRecord, StoreError> {
        let mut invoice = self
            .get_invoice_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply_to(&mut invoice);
        invoice.updated_at = now_rfc3339();

        self.conn.execute(
            "UPDATE invoices SET
                document_type = ?2, cost_classification = ?3, doc_date = ?4, doc_year = ?5,
                supplier_name = ?6, supplier_tax_id = ?7, doc_number = ?8, total_amount = ?9,
                tax_amount = ?10, summary = ?11, status = ?12, manual_review = ?13, updated_at = ?14
             WHERE id = ?1",
            params![
                invoice.id,
                invoice.document_type,
                invoice.cost_classification.map(|c| c.as_str()),
                invoice.doc_date,
                invoice.doc_year,
                invoice.supplier_name,
                invoice.supplier_tax_id,
                invoice.doc_number,
                format_decimal(invoice.total_amount),
                invoice.tax_amount.map(format_decimal),
                invoice.summary,
                invoice.status.as_str(),
                invoice.manual_review,
                invoice.updated_at
            ],
        )?;
        Ok(invoice)
    }

    pub fn set_ledger_reference(&self, id: &str, ledger_id: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE invoices SET ledger_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, ledger_id, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_invoice(&self, id: &str) -> SqlResult<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM invoices WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn find_by_doc_number(&self, doc_number: &str) -> SqlResult<Vec<InvoiceRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM invoices
             WHERE doc_number IS NOT NULL AND lower(doc_number) = lower(?1)",
            INVOICE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![doc_number.trim()], invoice_from_row)?;
        rows.collect()
    }

    pub fn find_without_doc_number(
        &self,
        supplier_name: &str,
        doc_date: &str,
        total_amount: f64,
    ) -> SqlResult<Vec<InvoiceRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM invoices
             WHERE (doc_number IS NULL OR trim(doc_number) = '')
               AND lower(supplier_name) = lower(?1)
               AND doc_date = ?2
               AND total_amount = ?3",
            INVOICE_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![supplier_name.trim(), doc_date, format_decimal(total_amount)],
            invoice_from_row,
        )?;
        rows.collect()
    }

    pub fn list_invoices(&self, filter: &InvoiceFilter) -> SqlResult<Vec<InvoiceRecord>> {
        let supplier_pattern = filter
            .supplier_contains
            .as_ref()
            .map(|s| format!("%{}%", s.to_lowercase()));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM invoices
             WHERE (?1 IS NULL OR doc_year = ?1)
               AND (?2 IS NULL OR lower(supplier_name) LIKE ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY doc_date DESC, created_at DESC
             LIMIT ?4",
            INVOICE_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                filter.year,
                supplier_pattern,
                filter.status.map(|s| s.as_str()),
                filter.limit.map(|l| l as i64).unwrap_or(-1)
            ],
            invoice_from_row,
        )?;
        rows.collect()
    }

    pub fn save_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let access_token = self.cipher.encrypt(&credential.access_token)?;
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO credentials ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                CREDENTIAL_COLUMNS
            ),
            params![
                credential.account,
                access_token,
                refresh_token,
                credential.expires_at.to_rfc3339(),
                credential.scopes.join(" "),
                credential.is_primary_storage,
                credential.created_at,
                credential.updated_at
            ],
        )?;
        Ok(())
    }

    /// Stores a refreshed token. The refresh token is only replaced when rotated.
    pub fn update_tokens(
        &self,
        account: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        refresh_token: Option<&str>,
    ) -> Result<(), StoreError> {
        let access_token = self.cipher.encrypt(access_token)?;
        let refresh_token = refresh_token
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;
        let affected = self.conn.execute(
            "UPDATE credentials SET
                access_token = ?2,
                expires_at = ?3,
                refresh_token = COALESCE(?4, refresh_token),
                updated_at = ?5
             WHERE account = ?1",
            params![account, access_token, expires_at.to_rfc3339(), refresh_token, now_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::CredentialNotFound(account.to_string()));
        }
        Ok(())
    }

    pub fn get_credential(&self, account: &str) -> Result<Option<Credential>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM credentials WHERE account = ?1",
            CREDENTIAL_COLUMNS
        ))?;
        let raw = stmt.query_row(params![account], raw_credential).optional()?;
        raw.map(|raw| self.decrypt_credential(raw)).transpose()
    }

    pub fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM credentials ORDER BY account",
            CREDENTIAL_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], raw_credential)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter()
            .map(|raw| self.decrypt_credential(raw))
            .collect()
    }

    pub fn primary_storage_credential(&self) -> Result<Option<Credential>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM credentials WHERE is_primary_storage = 1 LIMIT 1",
            CREDENTIAL_COLUMNS
        ))?;
        let raw = stmt.query_row([], raw_credential).optional()?;
        raw.map(|raw| self.decrypt_credential(raw)).transpose()
    }

    /// Clears the flag everywhere and sets it on one account, in one transaction.
    pub fn set_primary_storage(&mut self, account: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE credentials SET is_primary_storage = 0 WHERE is_primary_storage = 1",
            [],
        )?;
        let affected = tx.execute(
            "UPDATE credentials SET is_primary_storage = 1, updated_at = ?2 WHERE account = ?1",
            params![account, now_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::CredentialNotFound(account.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_credential(&self, account: &str) -> SqlResult<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM credentials WHERE account = ?1", params![account])?;
        Ok(affected > 0)
    }

    pub fn log_processing(
        &self,
        invoice_id: Option<&str>,
        file_hash: Option<&str>,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO processing_logs
                 (id, invoice_id, file_hash, process_type, status, message, created_at)
             VALUES (hex(randomblob(16)), ?1, ?2, ?3, ?4, ?5, datetime('now'))",
            params![invoice_id, file_hash, process_type, status, message],
        )?;
        Ok(())
    }

    pub fn count_logs(&self, process_type: &str, status: &str) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM processing_logs WHERE process_type = ?1 AND status = ?2",
            params![process_type, status],
            |row| row.get(0),
        )
    }

    pub fn record_run(&self, started_at: &str, summary: &RunSummary) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO sync_runs
                 (id, started_at, finished_at, accounts, processed, duplicates, errors, aborted)
             VALUES (hex(randomblob(16)), ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                started_at,
                now_rfc3339(),
                summary.accounts as i64,
                summary.processed as i64,
                summary.duplicates as i64,
                summary.errors as i64,
                summary.aborted
            ],
        )?;
        Ok(())
    }

    pub fn last_run(&self) -> SqlResult<Option<RunSummary>> {
        self.conn
            .query_row(
                "SELECT accounts, processed, duplicates, errors, aborted
                 FROM sync_runs ORDER BY finished_at DESC LIMIT 1",
                [],
                |row| {
                    Ok(RunSummary {
                        accounts: row.get::<_, i64>(0)? as usize,
                        processed: row.get::<_, i64>(1)? as usize,
                        duplicates: row.get::<_, i64>(2)? as usize,
                        errors: row.get::<_, i64>(3)? as usize,
                        aborted: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    fn decrypt_credential(&self, raw: RawCredential) -> Result<Credential, StoreError> {
        let expires_at = DateTime::parse_from_rfc3339(&raw.expires_at)
            .map_err(|e| StoreError::Corrupt(format!("credential expiry: {}", e)))?
            .with_timezone(&Utc);
        Ok(Credential {
            access_token: self.cipher.decrypt(&raw.access_token)?,
            refresh_token: raw
                .refresh_token
                .as_deref()
                .map(|token| self.cipher.decrypt(token))
                .transpose()?,
            expires_at,
            scopes: raw.scopes.split_whitespace().map(str::to_string).collect(),
            account: raw.account,
            is_primary_storage: raw.is_primary_storage,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

struct RawCredential {
    account: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: String,
    scopes: String,
    is_primary_storage: bool,
    created_at: String,
    updated_at: String,
}

fn raw_credential(row: &Row<'_>) -> SqlResult<RawCredential> {
    Ok(RawCredential {
        account: row.get(0)?,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        expires_at: row.get(3)?,
        scopes: row.get(4)?,
        is_primary_storage: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn decimal_column(row: &Row<'_>, idx: usize) -> SqlResult<f64> {
    let raw: String = row.get(idx)?;
    raw.parse::<f64>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_decimal_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<f64>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        value
            .parse::<f64>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn invoice_from_row(row: &Row<'_>) -> SqlResult<InvoiceRecord> {
    let classification: Option<String> = row.get(3)?;
    let status: String = row.get(15)?;
    Ok(InvoiceRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        document_type: row.get(2)?,
        cost_classification: classification.as_deref().and_then(CostClassification::parse),
        doc_date: row.get(4)?,
        doc_year: row.get(5)?,
        supplier_name: row.get(6)?,
        supplier_tax_id: row.get(7)?,
        doc_number: row.get(8)?,
        total_amount: decimal_column(row, 9)?,
        tax_amount: optional_decimal_column(row, 10)?,
        summary: row.get(11)?,
        file_id: row.get(12)?,
        file_link: row.get(13)?,
        ledger_id: row.get(14)?,
        status: InvoiceStatus::parse(&status).unwrap_or(InvoiceStatus::Review),
        confidence_score: row.get(16)?,
        manual_review: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}
