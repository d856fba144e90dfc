use reqwest::{RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult};
use crate::services::rate_limiter::{ApiFamily, RateLimiter};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
pub const GMAIL_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";

/// Scopes the primary storage account must have granted.
pub const STORAGE_SCOPES: [&str; 2] = [DRIVE_SCOPE, SHEETS_SCOPE];

pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Authenticated, rate-limited access to one Google API family.
#[derive(Clone)]
pub struct GoogleApi {
    client: reqwest::Client,
    token: String,
    limiter: Arc<RateLimiter>,
    family: ApiFamily,
    service: &'static str,
}

impl GoogleApi {
    pub fn new(
        client: reqwest::Client,
        token: String,
        limiter: Arc<RateLimiter>,
        family: ApiFamily,
        service: &'static str,
    ) -> Self {
        Self {
            client,
            token,
            limiter,
            family,
            service,
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    /// Builds `base/segment/segment` with each segment percent-encoded.
    pub fn url(&self, base: &str, segments: &[&str]) -> ServiceResult<Url> {
        let mut url = Url::parse(base).map_err(|e| {
            ServiceError::other(self.service, format!("bad base url {}: {}", base, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::other(self.service, "base url cannot have segments"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn send(&self, request: RequestBuilder) -> ServiceResult<Response> {
        self.limiter.wait_for_slot(self.family).await;
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|source| ServiceError::Transport {
                service: self.service,
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                service: self.service,
                status,
                body,
            });
        }
        Ok(response)
    }

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> ServiceResult<T> {
        let response = self.send(request).await?;
        response.json::<T>().await.map_err(|e| ServiceError::Decode {
            service: self.service,
            reason: e.to_string(),
        })
    }
}

pub fn is_not_found(error: &ServiceError) -> bool {
    matches!(error, ServiceError::Status { status: 404, .. })
}
