use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ServiceError, ServiceResult};
use crate::services::google::{GoogleApi, GMAIL_API_BASE};

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRef {
    pub attachment_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub id: String,
    pub subject: Option<String>,
    pub attachments: Vec<AttachmentRef>,
}

/// A mailbox whose unread attachments feed the ingestion queue.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn list_unread(&self, since: DateTime<Utc>) -> ServiceResult<Vec<MailMessage>>;
    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment: &AttachmentRef,
    ) -> ServiceResult<Vec<u8>>;
    async fn mark_read(&self, message_id: &str) -> ServiceResult<()>;
}

#[derive(Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageId>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct MessageId {
    id: String,
}

#[derive(Deserialize)]
struct FullMessage {
    id: String,
    payload: Option<MessagePart>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    attachment_id: Option<String>,
    #[serde(default)]
    size: usize,
}

#[derive(Deserialize)]
struct AttachmentBody {
    data: String,
}

fn collect_attachments(part: &MessagePart, out: &mut Vec<AttachmentRef>) {
    if !part.filename.is_empty() {
        if let Some(body) = &part.body {
            if let Some(attachment_id) = &body.attachment_id {
                out.push(AttachmentRef {
                    attachment_id: attachment_id.clone(),
                    file_name: part.filename.clone(),
                    mime_type: part.mime_type.clone(),
                    size: body.size,
                });
            }
        }
    }
    for child in &part.parts {
        collect_attachments(child, out);
    }
}

fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    general_purpose::URL_SAFE
        .decode(data)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')))
        .ok()
}

pub struct Gmail {
    api: GoogleApi,
    base_url: String,
}

impl Gmail {
    pub fn new(api: GoogleApi) -> Self {
        Self::with_base_url(api, GMAIL_API_BASE)
    }

    pub fn with_base_url(api: GoogleApi, base_url: &str) -> Self {
        Self {
            api,
            base_url: base_url.to_string(),
        }
    }

    async fn get_message(&self, id: &str) -> ServiceResult<MailMessage> {
        let url = self
            .api
            .url(&self.base_url, &["users", "me", "messages", id])?;
        let message: FullMessage = self
            .api
            .send_json(self.api.client().get(url).query(&[("format", "full")]))
            .await?;
        let payload = message.payload.unwrap_or_default();
        let subject = payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("subject"))
            .map(|h| h.value.clone());
        let mut attachments = Vec::new();
        collect_attachments(&payload, &mut attachments);
        Ok(MailMessage {
            id: message.id,
            subject,
            attachments,
        })
    }
}

#[async_trait]
impl MailSource for Gmail {
    async fn list_unread(&self, since: DateTime<Utc>) -> ServiceResult<Vec<MailMessage>> {
        let query = format!("is:unread has:attachment after:{}", since.timestamp());
        let url = self.api.url(&self.base_url, &["users", "me", "messages"])?;
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .api
                .client()
                .get(url.clone())
                .query(&[("q", query.as_str()), ("maxResults", "100")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: MessageList = self.api.send_json(request).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            messages.push(self.get_message(&id).await?);
        }
        Ok(messages)
    }

    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment: &AttachmentRef,
    ) -> ServiceResult<Vec<u8>> {
        let url = self.api.url(
            &self.base_url,
            &[
                "users",
                "me",
                "messages",
                message_id,
                "attachments",
                &attachment.attachment_id,
            ],
        )?;
        let body: AttachmentBody = self.api.send_json(self.api.client().get(url)).await?;
        decode_base64url(&body.data).ok_or_else(|| ServiceError::Decode {
            service: self.api.service(),
            reason: format!("attachment {} is not base64url", attachment.file_name),
        })
    }

    async fn mark_read(&self, message_id: &str) -> ServiceResult<()> {
        let url = self.api.url(
            &self.base_url,
            &["users", "me", "messages", message_id, "modify"],
        )?;
        self.api
            .send(
                self.api
                    .client()
                    .post(url)
                    .json(&json!({ "removeLabelIds": ["UNREAD"] })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nested_attachments() {
        let payload: MessagePart = serde_json::from_value(json!({
            "mimeType": "multipart/mixed",
            "headers": [{ "name": "Subject", "value": "Fatura" }],
            "parts": [
                { "mimeType": "text/plain", "filename": "", "body": { "size": 10 } },
                {
                    "mimeType": "multipart/related",
                    "filename": "",
                    "parts": [{
                        "mimeType": "application/pdf",
                        "filename": "FT-2025-1.pdf",
                        "body": { "attachmentId": "att-1", "size": 2048 }
                    }]
                }
            ]
        }))
        .unwrap();
        let mut found = Vec::new();
        collect_attachments(&payload, &mut found);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_name, "FT-2025-1.pdf");
        assert_eq!(found[0].attachment_id, "att-1");
        assert_eq!(found[0].size, 2048);
    }

    #[test]
    fn decodes_padded_and_unpadded_base64url() {
        assert_eq!(decode_base64url("JVBERg==").unwrap(), b"%PDF");
        assert_eq!(decode_base64url("JVBERg").unwrap(), b"%PDF");
    }
}
