use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::CredentialStore;
use crate::error::{AuthError, SyncError, ValidationError};
use crate::models::Credential;
use crate::services::rate_limiter::{ApiFamily, RateLimiter};
use crate::utils::now_rfc3339;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenGrant {
    fn expires_at(&self) -> chrono::DateTime<Utc> {
        Utc::now() + Duration::seconds(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS))
    }
}

/// The OAuth token endpoint.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange_code(&self, account: &str, code: &str) -> Result<TokenGrant, AuthError>;
    async fn refresh(&self, account: &str, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

#[derive(Deserialize)]
struct TokenErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

pub struct GoogleTokenClient {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    limiter: Arc<RateLimiter>,
}

impl GoogleTokenClient {
    pub fn new(
        client: reqwest::Client,
        endpoint: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            client,
            endpoint,
            client_id,
            client_secret,
            redirect_uri,
            limiter,
        }
    }

    async fn post_form(
        &self,
        account: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, AuthError> {
        self.limiter.wait_for_slot(ApiFamily::OAuth).await;
        let response = self
            .client
            .post(&self.endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::Transient {
                account: account.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<TokenGrant>().await.map_err(|e| AuthError::Transient {
                account: account.to_string(),
                reason: format!("decode token response: {}", e),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_token_error(account, status.as_u16(), &body))
    }
}

/// 400/401 from the token endpoint means the grant itself was refused; anything else may pass.
fn classify_token_error(account: &str, status: u16, body: &str) -> AuthError {
    let parsed = serde_json::from_str::<TokenErrorBody>(body).ok();
    let reason = parsed
        .as_ref()
        .map(|b| {
            format!(
                "{}: {}",
                b.error.as_deref().unwrap_or("error"),
                b.error_description.as_deref().unwrap_or_default()
            )
        })
        .unwrap_or_else(|| format!("status {}", status));

    if status == 400 || status == 401 {
        AuthError::NeedsReauth {
            account: account.to_string(),
            reason,
        }
    } else {
        AuthError::Transient {
            account: account.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl TokenExchange for GoogleTokenClient {
    async fn exchange_code(&self, account: &str, code: &str) -> Result<TokenGrant, AuthError> {
        self.post_form(
            account,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("redirect_uri", &self.redirect_uri),
            ],
        )
        .await
    }

    async fn refresh(&self, account: &str, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        self.post_form(
            account,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ],
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenFreshness {
    Fresh,
    Refreshed,
    /// Refresh failed; the token may still work until its real expiry.
    Stale(AuthError),
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub account: String,
    pub token: String,
    pub scopes: Vec<String>,
    pub freshness: TokenFreshness,
}

/// Hands out bearer tokens valid for at least `buffer` from now.
///
/// Refreshes are serialized, so redundant callers in one session reuse the first refresh.
/// A failed refresh is attempted only once per session per account; later calls get the
/// recorded failure without another round trip.
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    buffer: Duration,
    refresh_lock: tokio::sync::Mutex<()>,
    failed: Mutex<HashMap<String, AuthError>>,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
        buffer_secs: i64,
    ) -> Self {
        Self {
            store,
            exchange,
            buffer: Duration::seconds(buffer_secs),
            refresh_lock: tokio::sync::Mutex::new(()),
            failed: Mutex::new(HashMap::new()),
        }
    }

    fn load(&self, account: &str) -> Result<Credential, SyncError> {
        self.store
            .get_credential(account)?
            .ok_or_else(|| ValidationError::MissingCredential(account.to_string()).into())
    }

    fn is_fresh(&self, credential: &Credential) -> bool {
        credential.expires_at - Utc::now() >= self.buffer
    }

    fn recorded_failure(&self, account: &str) -> Option<AuthError> {
        self.failed
            .lock()
            .ok()
            .and_then(|failed| failed.get(account).cloned())
    }

    fn record_failure(&self, account: &str, error: &AuthError) {
        if let Ok(mut failed) = self.failed.lock() {
            failed.insert(account.to_string(), error.clone());
        }
    }

    /// Strict variant: an auth failure is returned as an error.
    #[tracing::instrument(skip(self))]
    pub async fn valid_token(&self, account: &str) -> Result<AccessToken, SyncError> {
        let credential = self.load(account)?;
        if self.is_fresh(&credential) {
            return Ok(access_token(credential, TokenFreshness::Fresh));
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        let credential = self.load(account)?;
        if self.is_fresh(&credential) {
            return Ok(access_token(credential, TokenFreshness::Fresh));
        }
        if let Some(error) = self.recorded_failure(account) {
            return Err(error.into());
        }

        let refresh_token = match credential.refresh_token.as_deref() {
            Some(token) => token.to_string(),
            None => {
                let error = AuthError::NeedsReauth {
                    account: account.to_string(),
                    reason: "no refresh token stored".to_string(),
                };
                self.record_failure(account, &error);
                return Err(error.into());
            }
        };

        tracing::debug!(account, expires_at = %credential.expires_at, "Refreshing access token");
        let grant = match self.exchange.refresh(account, &refresh_token).await {
            Ok(grant) => grant,
            Err(error) => {
                self.record_failure(account, &error);
                return Err(error.into());
            }
        };

        let expires_at = grant.expires_at();
        self.store.update_tokens(
            account,
            &grant.access_token,
            expires_at,
            grant.refresh_token.as_deref(),
        )?;
        tracing::info!(
            account,
            %expires_at,
            rotated = grant.refresh_token.is_some(),
            "Access token refreshed"
        );

        Ok(AccessToken {
            account: credential.account,
            token: grant.access_token,
            scopes: credential.scopes,
            freshness: TokenFreshness::Refreshed,
        })
    }

    /// Soft variant: on auth failure the stored token is returned and the failure logged.
    pub async fn token_or_stale(&self, account: &str) -> Result<AccessToken, SyncError> {
        match self.valid_token(account).await {
            Ok(token) => Ok(token),
            Err(SyncError::Auth(error)) => {
                if error.needs_reauth() {
                    tracing::error!(
                        account,
                        %error,
                        "Refresh token rejected, account needs re-authentication"
                    );
                } else {
                    tracing::warn!(
                        account,
                        %error,
                        "Token refresh failed, continuing with stale token"
                    );
                }
                let credential = self.load(account)?;
                Ok(access_token(credential, TokenFreshness::Stale(error)))
            }
            Err(other) => Err(other),
        }
    }

    /// Exchanges an authorization code and stores the resulting credential.
    pub async fn link_account(
        &self,
        account: &str,
        code: &str,
        primary_storage: bool,
    ) -> Result<Credential, SyncError> {
        let grant = self.exchange.exchange_code(account, code).await?;
        let existing = self.store.get_credential(account)?;
        let now = now_rfc3339();
        let credential = Credential {
            account: account.to_string(),
            access_token: grant.access_token.clone(),
            refresh_token: grant
                .refresh_token
                .clone()
                .or_else(|| existing.as_ref().and_then(|c| c.refresh_token.clone())),
            expires_at: grant.expires_at(),
            scopes: grant
                .scope
                .as_deref()
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            is_primary_storage: existing.as_ref().map(|c| c.is_primary_storage).unwrap_or(false),
            created_at: existing
                .as_ref()
                .map(|c| c.created_at.clone())
                .unwrap_or_else(|| now.clone()),
            updated_at: now,
        };
        self.store.save_credential(&credential)?;
        if primary_storage {
            self.store.set_primary_storage(account)?;
        }
        if let Ok(mut failed) = self.failed.lock() {
            failed.remove(account);
        }
        tracing::info!(
            account,
            primary_storage,
            scopes = credential.scopes.len(),
            "Account linked"
        );
        Ok(credential)
    }
}

fn access_token(credential: Credential, freshness: TokenFreshness) -> AccessToken {
    AccessToken {
        account: credential.account,
        token: credential.access_token,
        scopes: credential.scopes,
        freshness,
    }
}
