use std::sync::Arc;

use crate::error::ServiceResult;
use crate::models::{classification_folder, ledger_header, CostClassification};
use crate::services::drive::{FileStorage, NodeKind};
use crate::services::sheets::{LedgerService, TabInfo};
use crate::utils::workbook_name;

/// Folder ids along root / year / classification.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderPath {
    pub root: String,
    pub year: String,
    pub classification: String,
}

/// Get-or-create primitives for the storage tree and the yearly ledgers.
///
/// Search-then-create is not atomic on the backing service; two concurrent callers can still
/// create sibling nodes with the same name.
#[derive(Clone)]
pub struct FolderResolver {
    files: Arc<dyn FileStorage>,
    ledger: Arc<dyn LedgerService>,
    root_name: String,
}

impl FolderResolver {
    pub fn new(
        files: Arc<dyn FileStorage>,
        ledger: Arc<dyn LedgerService>,
        root_name: impl Into<String>,
    ) -> Self {
        Self {
            files,
            ledger,
            root_name: root_name.into(),
        }
    }

    pub async fn ensure_folder(&self, name: &str, parent: Option<&str>) -> ServiceResult<String> {
        self.ensure_node(name, parent, NodeKind::Folder).await
    }

    async fn ensure_node(
        &self,
        name: &str,
        parent: Option<&str>,
        kind: NodeKind,
    ) -> ServiceResult<String> {
        if let Some(id) = self.files.find_node(name, parent, kind).await? {
            tracing::debug!(name, parent, id = %id, "Node exists");
            return Ok(id);
        }
        self.files.create_node(name, parent, kind).await
    }

    /// Root and year folder, without the classification level.
    pub async fn ensure_year_folder(&self, year: i32) -> ServiceResult<(String, String)> {
        let root = self.ensure_folder(&self.root_name, None).await?;
        let year_folder = self.ensure_folder(&year.to_string(), Some(&root)).await?;
        Ok((root, year_folder))
    }

    pub async fn ensure_path(
        &self,
        year: i32,
        classification: Option<CostClassification>,
    ) -> ServiceResult<FolderPath> {
        let (root, year_folder) = self.ensure_year_folder(year).await?;
        let class_folder = self
            .ensure_folder(classification_folder(classification), Some(&year_folder))
            .await?;
        Ok(FolderPath {
            root,
            year: year_folder,
            classification: class_folder,
        })
    }

    /// The single workbook of a year, kept in that year's folder.
    pub async fn ensure_yearly_ledger(
        &self,
        year: i32,
        year_folder: &str,
    ) -> ServiceResult<String> {
        self.ensure_node(&workbook_name(year), Some(year_folder), NodeKind::Spreadsheet)
            .await
    }

    /// Looks a yearly workbook up without creating any part of the tree.
    pub async fn find_yearly_ledger(&self, year: i32) -> ServiceResult<Option<String>> {
        let Some(root) = self.files.find_node(&self.root_name, None, NodeKind::Folder).await? else {
            return Ok(None);
        };
        let Some(year_folder) = self
            .files
            .find_node(&year.to_string(), Some(&root), NodeKind::Folder)
            .await?
        else {
            return Ok(None);
        };
        self.files
            .find_node(&workbook_name(year), Some(&year_folder), NodeKind::Spreadsheet)
            .await
    }

    pub async fn find_tab(&self, workbook_id: &str, title: &str) -> ServiceResult<Option<TabInfo>> {
        let tabs = self.ledger.list_tabs(workbook_id).await?;
        Ok(tabs.into_iter().find(|t| t.title == title))
    }

    /// Month tab; the header row is written only when the tab is created here.
    pub async fn ensure_tab(&self, workbook_id: &str, title: &str) -> ServiceResult<TabInfo> {
        if let Some(tab) = self.find_tab(workbook_id, title).await? {
            return Ok(tab);
        }
        let tab = self.ledger.create_tab(workbook_id, title, &ledger_header()).await?;
        tracing::info!(workbook_id, tab = title, "Created ledger tab");
        Ok(tab)
    }
}
