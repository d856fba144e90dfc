use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::models::LedgerColumn;
use crate::services::google::{GoogleApi, SHEETS_API_BASE};

/// First data row; row 1 holds the header.
pub const FIRST_DATA_ROW: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct TabInfo {
    pub title: String,
    pub sheet_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    pub tab: String,
    pub row: usize,
    pub column: LedgerColumn,
    pub value: String,
}

/// Row-oriented ledger: workbooks containing named tabs.
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Tab titles and internal ids of a workbook.
    async fn list_tabs(&self, workbook_id: &str) -> ServiceResult<Vec<TabInfo>>;
    async fn create_tab(
        &self,
        workbook_id: &str,
        title: &str,
        header: &[String],
    ) -> ServiceResult<TabInfo>;
    async fn append_row(
        &self,
        workbook_id: &str,
        tab: &str,
        values: &[String],
    ) -> ServiceResult<()>;
    /// Data rows of a tab, header excluded. Index `i` is sheet row `i + FIRST_DATA_ROW`.
    async fn read_rows(&self, workbook_id: &str, tab: &str) -> ServiceResult<Vec<Vec<String>>>;
    async fn update_cells(&self, workbook_id: &str, updates: &[CellUpdate]) -> ServiceResult<()>;
    /// Deletes one 1-indexed row; rows below shift up.
    async fn delete_row(&self, workbook_id: &str, sheet_id: i64, row: usize) -> ServiceResult<()>;
}

pub fn a1_range(tab: &str, range: &str) -> String {
    format!("'{}'!{}", tab.replace('\'', "''"), range)
}

pub fn cell_range(update: &CellUpdate) -> String {
    a1_range(&update.tab, &format!("{}{}", update.column.letter(), update.row))
}

#[derive(Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct BatchUpdateResponse {
    #[serde(default)]
    replies: Vec<Value>,
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub struct GoogleSheets {
    api: GoogleApi,
    base_url: String,
}

impl GoogleSheets {
    pub fn new(api: GoogleApi) -> Self {
        Self::with_base_url(api, SHEETS_API_BASE)
    }

    pub fn with_base_url(api: GoogleApi, base_url: &str) -> Self {
        Self {
            api,
            base_url: base_url.to_string(),
        }
    }

    async fn batch_update(
        &self,
        workbook_id: &str,
        requests: Value,
    ) -> ServiceResult<BatchUpdateResponse> {
        let url = self
            .api
            .url(&self.base_url, &["spreadsheets", &format!("{}:batchUpdate", workbook_id)])?;
        self.api
            .send_json(self.api.client().post(url).json(&json!({ "requests": requests })))
            .await
    }
}

#[async_trait]
impl LedgerService for GoogleSheets {
    async fn list_tabs(&self, workbook_id: &str) -> ServiceResult<Vec<TabInfo>> {
        let url = self.api.url(&self.base_url, &["spreadsheets", workbook_id])?;
        let meta: SpreadsheetMeta = self
            .api
            .send_json(
                self.api
                    .client()
                    .get(url)
                    .query(&[("fields", "sheets.properties(sheetId,title)")]),
            )
            .await?;
        Ok(meta
            .sheets
            .into_iter()
            .map(|s| TabInfo {
                title: s.properties.title,
                sheet_id: s.properties.sheet_id,
            })
            .collect())
    }

    async fn create_tab(
        &self,
        workbook_id: &str,
        title: &str,
        header: &[String],
    ) -> ServiceResult<TabInfo> {
        let add_sheet = json!([{ "addSheet": { "properties": { "title": title } } }]);
        let response = self.batch_update(workbook_id, add_sheet).await?;
        let sheet_id = response
            .replies
            .first()
            .and_then(|r| r.pointer("/addSheet/properties/sheetId"))
            .and_then(Value::as_i64)
            .ok_or_else(|| ServiceError::Decode {
                service: self.api.service(),
                reason: "addSheet reply without sheetId".to_string(),
            })?;

        let range = a1_range(title, "A1:J1");
        let url = self
            .api
            .url(&self.base_url, &["spreadsheets", workbook_id, "values", &range])?;
        self.api
            .send(
                self.api
                    .client()
                    .put(url)
                    .query(&[("valueInputOption", "RAW")])
                    .json(&json!({ "values": [header] })),
            )
            .await?;

        Ok(TabInfo {
            title: title.to_string(),
            sheet_id,
        })
    }

    async fn append_row(
        &self,
        workbook_id: &str,
        tab: &str,
        values: &[String],
    ) -> ServiceResult<()> {
        let range = format!("{}:append", a1_range(tab, "A:J"));
        let url = self
            .api
            .url(&self.base_url, &["spreadsheets", workbook_id, "values", &range])?;
        self.api
            .send(
                self.api
                    .client()
                    .post(url)
                    .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
                    .json(&json!({ "values": [values] })),
            )
            .await?;
        Ok(())
    }

    async fn read_rows(&self, workbook_id: &str, tab: &str) -> ServiceResult<Vec<Vec<String>>> {
        let range = a1_range(tab, &format!("A{}:J", FIRST_DATA_ROW));
        let url = self
            .api
            .url(&self.base_url, &["spreadsheets", workbook_id, "values", &range])?;
        let values: ValueRange = self.api.send_json(self.api.client().get(url)).await?;
        Ok(values
            .values
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }

    async fn update_cells(&self, workbook_id: &str, updates: &[CellUpdate]) -> ServiceResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let data: Vec<Value> = updates
            .iter()
            .map(|u| json!({ "range": cell_range(u), "values": [[u.value]] }))
            .collect();
        let url = self.api.url(
            &self.base_url,
            &["spreadsheets", workbook_id, "values:batchUpdate"],
        )?;
        self.api
            .send(
                self.api
                    .client()
                    .post(url)
                    .json(&json!({ "valueInputOption": "RAW", "data": data })),
            )
            .await?;
        Ok(())
    }

    async fn delete_row(&self, workbook_id: &str, sheet_id: i64, row: usize) -> ServiceResult<()> {
        if row < FIRST_DATA_ROW {
            return Err(ServiceError::other(
                self.api.service(),
                "refusing to delete the header row",
            ));
        }
        self.batch_update(
            workbook_id,
            json!([{
                "deleteDimension": {
                    "range": {
                        "sheetId": sheet_id,
                        "dimension": "ROWS",
                        "startIndex": row - 1,
                        "endIndex": row,
                    }
                }
            }]),
        )
        .await?;
        Ok(())
    }
}
