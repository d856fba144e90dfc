use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ServiceError, ServiceResult};
use crate::services::google::{is_not_found, GoogleApi, DRIVE_API_BASE, DRIVE_UPLOAD_BASE};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
const MULTIPART_BOUNDARY: &str = "faturas_sync_boundary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Folder,
    Spreadsheet,
}

impl NodeKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            NodeKind::Folder => FOLDER_MIME,
            NodeKind::Spreadsheet => SPREADSHEET_MIME,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub id: String,
    pub web_view_link: Option<String>,
}

/// Hierarchical file storage. `parent: None` means the storage root.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn find_node(
        &self,
        name: &str,
        parent: Option<&str>,
        kind: NodeKind,
    ) -> ServiceResult<Option<String>>;
    async fn create_node(
        &self,
        name: &str,
        parent: Option<&str>,
        kind: NodeKind,
    ) -> ServiceResult<String>;
    async fn upload_file(
        &self,
        name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        parent: &str,
    ) -> ServiceResult<StoredFile>;
    /// Reparents a file so `new_parent` becomes its only parent.
    async fn move_file(&self, file_id: &str, new_parent: &str) -> ServiceResult<()>;
    /// Deleting a file that no longer exists succeeds.
    async fn delete_file(&self, file_id: &str) -> ServiceResult<()>;
    async fn download_file(&self, file_id: &str) -> ServiceResult<Vec<u8>>;
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileEntry {
    id: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    web_view_link: Option<String>,
}

pub struct GoogleDrive {
    api: GoogleApi,
    base_url: String,
    upload_url: String,
}

impl GoogleDrive {
    pub fn new(api: GoogleApi) -> Self {
        Self::with_base_urls(api, DRIVE_API_BASE, DRIVE_UPLOAD_BASE)
    }

    pub fn with_base_urls(api: GoogleApi, base_url: &str, upload_url: &str) -> Self {
        Self {
            api,
            base_url: base_url.to_string(),
            upload_url: upload_url.to_string(),
        }
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn node_query(name: &str, parent: Option<&str>, kind: NodeKind) -> String {
    format!(
        "name = '{}' and '{}' in parents and mimeType = '{}' and trashed = false",
        escape_query(name),
        escape_query(parent.unwrap_or("root")),
        kind.mime_type()
    )
}

fn multipart_body(metadata: &serde_json::Value, mime_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n\
             --{b}\r\nContent-Type: {mime}\r\n\r\n",
            b = MULTIPART_BOUNDARY,
            meta = metadata,
            mime = mime_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--", MULTIPART_BOUNDARY).as_bytes());
    body
}

#[async_trait]
impl FileStorage for GoogleDrive {
    async fn find_node(
        &self,
        name: &str,
        parent: Option<&str>,
        kind: NodeKind,
    ) -> ServiceResult<Option<String>> {
        let url = self.api.url(&self.base_url, &["files"])?;
        let query = node_query(name, parent, kind);
        let list: FileList = self
            .api
            .send_json(
                self.api
                    .client()
                    .get(url)
                    .query(&[("q", query.as_str()), ("fields", "files(id)"), ("spaces", "drive")]),
            )
            .await?;
        if list.files.len() > 1 {
            tracing::warn!(
                name,
                parent,
                count = list.files.len(),
                "Duplicate nodes found, using the first"
            );
        }
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_node(
        &self,
        name: &str,
        parent: Option<&str>,
        kind: NodeKind,
    ) -> ServiceResult<String> {
        let url = self.api.url(&self.base_url, &["files"])?;
        let body = json!({
            "name": name,
            "mimeType": kind.mime_type(),
            "parents": [parent.unwrap_or("root")],
        });
        let created: FileEntry = self
            .api
            .send_json(self.api.client().post(url).query(&[("fields", "id")]).json(&body))
            .await?;
        tracing::info!(name, parent, ?kind, id = %created.id, "Created storage node");
        Ok(created.id)
    }

    async fn upload_file(
        &self,
        name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        parent: &str,
    ) -> ServiceResult<StoredFile> {
        let url = self.api.url(&self.upload_url, &["files"])?;
        let metadata = json!({ "name": name, "parents": [parent] });
        let body = multipart_body(&metadata, mime_type, &bytes);
        let created: FileEntry = self
            .api
            .send_json(
                self.api
                    .client()
                    .post(url)
                    .query(&[("uploadType", "multipart"), ("fields", "id,webViewLink")])
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
                    )
                    .body(body),
            )
            .await?;
        Ok(StoredFile {
            id: created.id,
            web_view_link: created.web_view_link,
        })
    }

    async fn move_file(&self, file_id: &str, new_parent: &str) -> ServiceResult<()> {
        let url = self.api.url(&self.base_url, &["files", file_id])?;
        let current: FileEntry = self
            .api
            .send_json(self.api.client().get(url.clone()).query(&[("fields", "id,parents")]))
            .await?;

        if current.parents.len() == 1 && current.parents[0] == new_parent {
            return Ok(());
        }
        let remove = current
            .parents
            .iter()
            .filter(|p| p.as_str() != new_parent)
            .cloned()
            .collect::<Vec<_>>()
            .join(",");

        self.api
            .send(
                self.api
                    .client()
                    .patch(url)
                    .query(&[
                        ("addParents", new_parent),
                        ("removeParents", remove.as_str()),
                        ("fields", "id,parents"),
                    ])
                    .json(&json!({})),
            )
            .await?;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> ServiceResult<()> {
        let url = self.api.url(&self.base_url, &["files", file_id])?;
        match self.api.send(self.api.client().delete(url)).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => {
                tracing::debug!(file_id, "File already gone");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn download_file(&self, file_id: &str) -> ServiceResult<Vec<u8>> {
        let url = self.api.url(&self.base_url, &["files", file_id])?;
        let response = self
            .api
            .send(self.api.client().get(url).query(&[("alt", "media")]))
            .await?;
        let bytes = response.bytes().await.map_err(|source| ServiceError::Transport {
            service: self.api.service(),
            source,
        })?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_escapes_quotes() {
        let query = node_query("D'Ávila", Some("abc"), NodeKind::Folder);
        assert!(query.starts_with("name = 'D\\'Ávila' and 'abc' in parents"));
        assert!(query.contains(FOLDER_MIME));
        assert!(node_query("FATURAS", None, NodeKind::Folder).contains("'root' in parents"));
    }

    #[test]
    fn multipart_body_wraps_metadata_and_content() {
        let body = multipart_body(&json!({"name": "a.pdf"}), "application/pdf", b"%PDF");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--faturas_sync_boundary\r\nContent-Type: application/json"));
        assert!(text.contains("Content-Type: application/pdf\r\n\r\n%PDF\r\n"));
        assert!(text.ends_with("--faturas_sync_boundary--"));
    }
}
