use chrono::{Duration, Utc};
use std::time::Duration as StdDuration;

use crate::error::{SyncError, SyncResult};
use crate::models::{Credential, IngestOutcome, IngestRequest, RunSummary};
use crate::services::gmail::{MailMessage, MailSource};
use crate::services::google::GMAIL_SCOPE;
use crate::services::queue::{tally, AbortHandle, IngestQueue};
use crate::services::state::{AppState, SyncSession};
use crate::utils::now_rfc3339;

fn mailbox_accounts(credentials: Vec<Credential>) -> Vec<Credential> {
    credentials
        .into_iter()
        .filter(|c| c.has_scopes(&[GMAIL_SCOPE]))
        .collect()
}

/// One scheduled pass: every mailbox account's recent unread attachments go through the
/// ingestion queue into the primary storage account.
#[tracing::instrument(skip(state, abort))]
pub async fn run_once(state: &AppState, abort: AbortHandle) -> SyncResult<RunSummary> {
    let started_at = now_rfc3339();
    let session = state.open_session().await?;
    let accounts = mailbox_accounts(state.credential_store.list_credentials()?);
    let since = Utc::now() - Duration::hours(state.settings.mailbox_lookback_hours);
    let queue = IngestQueue::new(
        StdDuration::from_millis(state.settings.inter_item_delay_ms),
        abort,
    );

    let mut summary = RunSummary {
        accounts: accounts.len(),
        ..Default::default()
    };
    tracing::info!(accounts = accounts.len(), %since, "Scheduled run started");

    for credential in accounts {
        if queue.is_aborted() {
            break;
        }
        let account = credential.account.as_str();
        let token = match state.credentials.token_or_stale(account).await {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(account, %error, "Skipping mailbox account");
                summary.errors += 1;
                continue;
            }
        };
        let mailbox = state.connector.mailbox(&token);
        let scanned = ingest_mailbox(
            &session,
            mailbox.as_ref(),
            account,
            since,
            &queue,
            &mut summary,
        )
        .await;
        if let Err(error) = scanned {
            tracing::error!(account, %error, "Mailbox scan failed");
            summary.errors += 1;
        }
    }

    summary.aborted = queue.is_aborted();
    if let Err(error) = state.store.record_run(&started_at, &summary) {
        tracing::error!(%error, "Failed to record run summary");
    }
    tracing::info!(
        processed = summary.processed,
        duplicates = summary.duplicates,
        errors = summary.errors,
        aborted = summary.aborted,
        "Scheduled run finished"
    );
    Ok(summary)
}

/// Ingests one mailbox. A message is marked read only when every eligible attachment was
/// either stored or recognized as a duplicate.
pub async fn ingest_mailbox(
    session: &SyncSession,
    mailbox: &dyn MailSource,
    account: &str,
    since: chrono::DateTime<Utc>,
    queue: &IngestQueue,
    summary: &mut RunSummary,
) -> SyncResult<()> {
    let messages = mailbox.list_unread(since).await.map_err(SyncError::Mailbox)?;
    tracing::debug!(account, messages = messages.len(), "Unread messages with attachments");

    for message in messages {
        if queue.is_aborted() {
            break;
        }
        let requests = match fetch_attachments(session, mailbox, account, &message).await {
            Ok(requests) => requests,
            Err(error) => {
                tracing::warn!(
                    account,
                    message_id = %message.id,
                    %error,
                    "Attachment download failed"
                );
                summary.errors += 1;
                continue;
            }
        };
        if requests.is_empty() {
            continue;
        }

        let expected = requests.len();
        let results = queue.run(session, requests).await;
        let mut settled = results.len() == expected;
        for result in &results {
            tally(summary, result);
            if let Err(error) = result {
                settled = false;
                tracing::debug!(
                    account,
                    message_id = %message.id,
                    %error,
                    "Attachment not ingested"
                );
            }
            if let Ok(IngestOutcome::Duplicate { existing_id }) = result {
                tracing::debug!(
                    account,
                    message_id = %message.id,
                    %existing_id,
                    "Attachment already stored"
                );
            }
        }

        if settled {
            if let Err(error) = mailbox.mark_read(&message.id).await {
                tracing::warn!(
                    account,
                    message_id = %message.id,
                    %error,
                    "Failed to mark message read"
                );
            }
        }
    }
    Ok(())
}

async fn fetch_attachments(
    session: &SyncSession,
    mailbox: &dyn MailSource,
    account: &str,
    message: &MailMessage,
) -> SyncResult<Vec<IngestRequest>> {
    let options = &session.options;
    let mut requests = Vec::new();
    for attachment in &message.attachments {
        let allowed = options
            .allowed_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&attachment.mime_type));
        if !allowed {
            tracing::debug!(
                file = %attachment.file_name,
                mime = %attachment.mime_type,
                "Attachment type ignored"
            );
            continue;
        }
        let bytes = mailbox
            .fetch_attachment(&message.id, attachment)
            .await
            .map_err(SyncError::Mailbox)?;
        requests.push(IngestRequest {
            file_name: attachment.file_name.clone(),
            mime_type: attachment.mime_type.clone(),
            bytes,
            owner_id: Some(account.to_string()),
        });
    }
    Ok(requests)
}
