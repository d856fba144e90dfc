use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::Credential;
use crate::services::google::{GMAIL_SCOPE, STORAGE_SCOPES};
use crate::services::state::AppState;

/// Account view without token material.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account: String,
    pub is_primary_storage: bool,
    pub can_store: bool,
    pub can_read_mail: bool,
    pub expires_at: DateTime<Utc>,
    pub has_refresh_token: bool,
}

impl From<&Credential> for AccountSummary {
    fn from(credential: &Credential) -> Self {
        AccountSummary {
            account: credential.account.clone(),
            is_primary_storage: credential.is_primary_storage,
            can_store: credential.has_scopes(&STORAGE_SCOPES),
            can_read_mail: credential.has_scopes(&[GMAIL_SCOPE]),
            expires_at: credential.expires_at,
            has_refresh_token: credential.refresh_token.is_some(),
        }
    }
}

pub async fn add_account(
    state: &AppState,
    account: &str,
    code: &str,
    primary: bool,
) -> Result<AccountSummary> {
    let credential = state
        .credentials
        .link_account(account, code, primary)
        .await
        .with_context(|| format!("Failed to link {}", account))?;
    if primary && !credential.has_scopes(&STORAGE_SCOPES) {
        tracing::warn!(account, "Primary storage account lacks Drive or Sheets scope");
    }
    let mut summary = AccountSummary::from(&credential);
    summary.is_primary_storage = primary || summary.is_primary_storage;
    Ok(summary)
}

pub fn set_primary(state: &AppState, account: &str) -> Result<()> {
    state
        .credential_store
        .set_primary_storage(account)
        .with_context(|| format!("Failed to make {} the primary storage account", account))?;
    tracing::info!(account, "Primary storage account changed");
    Ok(())
}

pub fn remove_account(state: &AppState, account: &str) -> Result<()> {
    if !state.credential_store.delete_credential(account)? {
        return Err(anyhow!("Unknown account: {}", account));
    }
    tracing::info!(account, "Account removed");
    Ok(())
}

pub fn list_accounts(state: &AppState) -> Result<Vec<AccountSummary>> {
    Ok(state
        .credential_store
        .list_credentials()?
        .iter()
        .map(AccountSummary::from)
        .collect())
}
