use std::sync::{Arc, Mutex};

use crate::db::{CredentialStore, Database, RecordStore};
use crate::error::{SyncError, ValidationError};
use crate::models::Settings;
use crate::services::credentials::{AccessToken, CredentialManager, GoogleTokenClient};
use crate::services::crypto::TokenCipher;
use crate::services::drive::{FileStorage, GoogleDrive};
use crate::services::extraction::{ExtractionOracle, OpenAiExtractor};
use crate::services::gmail::{Gmail, MailSource};
use crate::services::google::GoogleApi;
use crate::services::rate_limiter::{ApiFamily, RateLimiter};
use crate::services::resolver::FolderResolver;
use crate::services::sheets::{GoogleSheets, LedgerService};

/// Pipeline limits taken from [`Settings`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub max_file_size_bytes: usize,
    pub allowed_mime_types: Vec<String>,
    pub review_threshold: u8,
    pub root_folder_name: String,
}

impl From<&Settings> for SyncOptions {
    fn from(settings: &Settings) -> Self {
        SyncOptions {
            max_file_size_bytes: settings.max_file_size_bytes,
            allowed_mime_types: settings.allowed_mime_types.clone(),
            review_threshold: settings.review_threshold,
            root_folder_name: settings.root_folder_name.clone(),
        }
    }
}

/// Builds API clients bound to one account's token.
pub trait ServiceConnector: Send + Sync {
    fn storage(&self, token: &AccessToken) -> Arc<dyn FileStorage>;
    fn ledger(&self, token: &AccessToken) -> Arc<dyn LedgerService>;
    fn mailbox(&self, token: &AccessToken) -> Arc<dyn MailSource>;
}

pub struct GoogleConnector {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl GoogleConnector {
    pub fn new(client: reqwest::Client, limiter: Arc<RateLimiter>) -> Self {
        Self { client, limiter }
    }

    fn api(&self, token: &AccessToken, family: ApiFamily, service: &'static str) -> GoogleApi {
        GoogleApi::new(
            self.client.clone(),
            token.token.clone(),
            self.limiter.clone(),
            family,
            service,
        )
    }
}

impl ServiceConnector for GoogleConnector {
    fn storage(&self, token: &AccessToken) -> Arc<dyn FileStorage> {
        Arc::new(GoogleDrive::new(self.api(token, ApiFamily::Drive, "drive")))
    }

    fn ledger(&self, token: &AccessToken) -> Arc<dyn LedgerService> {
        Arc::new(GoogleSheets::new(self.api(token, ApiFamily::Sheets, "sheets")))
    }

    fn mailbox(&self, token: &AccessToken) -> Arc<dyn MailSource> {
        Arc::new(Gmail::new(self.api(token, ApiFamily::Gmail, "gmail")))
    }
}

/// Everything an orchestrator needs, bound to the primary storage account.
pub struct SyncSession {
    pub store: Arc<dyn RecordStore>,
    pub files: Arc<dyn FileStorage>,
    pub ledger: Arc<dyn LedgerService>,
    pub oracle: Option<Arc<dyn ExtractionOracle>>,
    pub resolver: FolderResolver,
    pub credential: AccessToken,
    pub options: SyncOptions,
}

impl SyncSession {
    pub fn new(
        store: Arc<dyn RecordStore>,
        files: Arc<dyn FileStorage>,
        ledger: Arc<dyn LedgerService>,
        oracle: Option<Arc<dyn ExtractionOracle>>,
        credential: AccessToken,
        options: SyncOptions,
    ) -> Self {
        let resolver = FolderResolver::new(
            files.clone(),
            ledger.clone(),
            options.root_folder_name.clone(),
        );
        SyncSession {
            store,
            files,
            ledger,
            oracle,
            resolver,
            credential,
            options,
        }
    }

    /// Audit trail entry; a failure here never affects the operation being logged.
    pub fn log(
        &self,
        invoice_id: Option<&str>,
        file_hash: Option<&str>,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) {
        if let Err(error) = self
            .store
            .log_processing(invoice_id, file_hash, process_type, status, message)
        {
            tracing::warn!(
                ?invoice_id,
                process_type,
                status,
                %error,
                "Failed to write processing log"
            );
        }
    }
}

pub struct AppState {
    pub settings: Settings,
    pub store: Arc<dyn RecordStore>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub credentials: Arc<CredentialManager>,
    pub connector: Arc<dyn ServiceConnector>,
    pub oracle: Option<Arc<dyn ExtractionOracle>>,
}

impl AppState {
    /// Opens the database and wires the Google and extraction clients.
    pub fn new(settings: Settings) -> Result<Self, SyncError> {
        let cipher = TokenCipher::new(&settings.token_secret)?;
        let db = Arc::new(Mutex::new(Database::new(&settings.database_path, cipher)?));
        let limiter = Arc::new(RateLimiter::new([
            (ApiFamily::Extraction, settings.extraction_rate),
            (ApiFamily::Drive, settings.drive_rate),
            (ApiFamily::Sheets, settings.sheets_rate),
            (ApiFamily::Gmail, settings.gmail_rate),
        ]));
        let client = reqwest::Client::new();

        let exchange = Arc::new(GoogleTokenClient::new(
            client.clone(),
            settings.token_endpoint.clone(),
            settings.google_client_id.clone(),
            settings.google_client_secret.clone(),
            settings.google_redirect_uri.clone(),
            limiter.clone(),
        ));
        let credential_store: Arc<dyn CredentialStore> = db.clone();
        let credentials = Arc::new(CredentialManager::new(
            credential_store.clone(),
            exchange,
            settings.token_refresh_buffer_secs,
        ));

        let oracle = settings.extraction_api_key.as_ref().map(|key| {
            Arc::new(OpenAiExtractor::new(
                client.clone(),
                key.clone(),
                settings.extraction_base_url.clone(),
                settings.extraction_model.clone(),
                limiter.clone(),
            )) as Arc<dyn ExtractionOracle>
        });

        Ok(AppState {
            store: db,
            credential_store,
            credentials,
            connector: Arc::new(GoogleConnector::new(client, limiter)),
            oracle,
            settings,
        })
    }

    /// Session bound to the primary storage account, refreshing its token if needed.
    pub async fn open_session(&self) -> Result<SyncSession, SyncError> {
        let primary = self
            .credential_store
            .primary_storage_credential()?
            .ok_or_else(|| {
                ValidationError::MissingCredential("primary storage account".to_string())
            })?;
        let token = self.credentials.token_or_stale(&primary.account).await?;
        tracing::debug!(account = %token.account, "Opened sync session");

        Ok(SyncSession::new(
            self.store.clone(),
            self.connector.storage(&token),
            self.connector.ledger(&token),
            self.oracle.clone(),
            token,
            SyncOptions::from(&self.settings),
        ))
    }
}
