use thiserror::Error;

/// Rejections raised before any network call is made.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: usize, max: usize },

    #[error("Unsupported MIME type: {0}")]
    UnsupportedMimeType(String),

    #[error("Empty file")]
    EmptyFile,

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Account {account} has not granted {scope}")]
    InsufficientScope { account: String, scope: String },

    #[error("Extraction incomplete, missing {0}")]
    IncompleteExtraction(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    /// The refresh token was rejected; the account must be linked again.
    #[error("Re-authentication required for {account}: {reason}")]
    NeedsReauth { account: String, reason: String },

    /// Network failure or 5xx from the token endpoint; retrying later may succeed.
    #[error("Transient auth failure for {account}: {reason}")]
    Transient { account: String, reason: String },
}

impl AuthError {
    pub fn needs_reauth(&self) -> bool {
        matches!(self, AuthError::NeedsReauth { .. })
    }
}

/// Failures of the record store. These are authoritative and always surface.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invoice not found: {0}")]
    NotFound(String),

    #[error("Credential not found: {0}")]
    CredentialNotFound(String),

    #[error("Token cipher error: {0}")]
    Cipher(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Failures of a secondary external service (file storage, ledger, mailbox, oracle).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} response could not be decoded: {reason}")]
    Decode {
        service: &'static str,
        reason: String,
    },

    #[error("{service}: {reason}")]
    Other {
        service: &'static str,
        reason: String,
    },
}

impl ServiceError {
    pub fn other(service: &'static str, reason: impl Into<String>) -> Self {
        ServiceError::Other {
            service,
            reason: reason.into(),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Top-level failure of an orchestrated operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The authoritative record store write failed.
    #[error("Record store failure: {0}")]
    Fatal(#[from] StoreError),

    #[error("Extraction failed: {0}")]
    Extraction(ServiceError),

    #[error("File storage failed: {0}")]
    Storage(ServiceError),

    #[error("Ledger failed: {0}")]
    Ledger(ServiceError),

    #[error("Mailbox failed: {0}")]
    Mailbox(ServiceError),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
