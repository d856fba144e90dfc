use anyhow::{anyhow, Context, Result};
use std::env;
use std::str::FromStr;

use crate::models::{RateLimit, Settings};

const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_EXTRACTION_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_EXTRACTION_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ROOT_FOLDER: &str = "FATURAS";
const MAX_FILE_SIZE_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_MIME_TYPES: &str = "application/pdf,image/jpeg,image/png,image/webp";
const REVIEW_THRESHOLD: u8 = 70;
const TOKEN_REFRESH_BUFFER_SECS: i64 = 300;
const INTER_ITEM_DELAY_MS: u64 = 1500;
const EXPORT_BATCH_SIZE: usize = 5;
const MAILBOX_LOOKBACK_HOURS: i64 = 24;

/// Loads `.env` if present, then reads `FATURAS_*` variables.
pub fn load_settings() -> Result<Settings> {
    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            return Err(error).context("Failed to read .env");
        }
    }
    settings_from(|key| env::var(key).ok())
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow!("{} must be set", key))
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow!("{} must be a valid number, got {:?}", key, raw)),
        _ => Ok(default),
    }
}

fn rate_limit(max_requests: usize, window_ms: u64) -> RateLimit {
    RateLimit {
        max_requests,
        window_ms,
    }
}

/// `"max/window_ms"`, e.g. `"60/60000"`.
fn rate(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: RateLimit,
) -> Result<RateLimit> {
    let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) else {
        return Ok(default);
    };
    let (max, window) = raw
        .trim()
        .split_once('/')
        .ok_or_else(|| anyhow!("{} must look like MAX/WINDOW_MS, got {:?}", key, raw))?;
    let limit = RateLimit {
        max_requests: max.trim().parse().with_context(|| format!("{} max requests", key))?,
        window_ms: window.trim().parse().with_context(|| format!("{} window", key))?,
    };
    if limit.max_requests == 0 || limit.window_ms == 0 {
        return Err(anyhow!("{} must be positive", key));
    }
    Ok(limit)
}

pub fn settings_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings> {
    let allowed_mime_types = lookup("FATURAS_ALLOWED_MIME_TYPES")
        .unwrap_or_else(|| ALLOWED_MIME_TYPES.to_string())
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    let review_threshold: u8 = parsed(&lookup, "FATURAS_REVIEW_THRESHOLD", REVIEW_THRESHOLD)?;
    if review_threshold > 100 {
        return Err(anyhow!("FATURAS_REVIEW_THRESHOLD must be between 0 and 100"));
    }

    Ok(Settings {
        database_path: lookup("FATURAS_DATABASE_PATH")
            .unwrap_or_else(|| "faturas.sqlite".to_string()),
        google_client_id: required(&lookup, "FATURAS_GOOGLE_CLIENT_ID")?,
        google_client_secret: required(&lookup, "FATURAS_GOOGLE_CLIENT_SECRET")?,
        google_redirect_uri: lookup("FATURAS_GOOGLE_REDIRECT_URI")
            .unwrap_or_else(|| "urn:ietf:wg:oauth:2.0:oob".to_string()),
        token_endpoint: lookup("FATURAS_TOKEN_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_TOKEN_ENDPOINT.to_string()),
        token_secret: required(&lookup, "FATURAS_TOKEN_SECRET")?,
        extraction_api_key: lookup("FATURAS_EXTRACTION_API_KEY").filter(|v| !v.trim().is_empty()),
        extraction_base_url: lookup("FATURAS_EXTRACTION_BASE_URL")
            .unwrap_or_else(|| DEFAULT_EXTRACTION_BASE_URL.to_string()),
        extraction_model: lookup("FATURAS_EXTRACTION_MODEL")
            .unwrap_or_else(|| DEFAULT_EXTRACTION_MODEL.to_string()),
        root_folder_name: lookup("FATURAS_ROOT_FOLDER")
            .unwrap_or_else(|| DEFAULT_ROOT_FOLDER.to_string()),
        max_file_size_bytes: parsed(&lookup, "FATURAS_MAX_FILE_SIZE_BYTES", MAX_FILE_SIZE_BYTES)?,
        allowed_mime_types,
        review_threshold,
        token_refresh_buffer_secs: parsed(
            &lookup,
            "FATURAS_TOKEN_REFRESH_BUFFER_SECS",
            TOKEN_REFRESH_BUFFER_SECS,
        )?,
        inter_item_delay_ms: parsed(&lookup, "FATURAS_INTER_ITEM_DELAY_MS", INTER_ITEM_DELAY_MS)?,
        export_batch_size: parsed(&lookup, "FATURAS_EXPORT_BATCH_SIZE", EXPORT_BATCH_SIZE)?.max(1),
        mailbox_lookback_hours: parsed(
            &lookup,
            "FATURAS_MAILBOX_LOOKBACK_HOURS",
            MAILBOX_LOOKBACK_HOURS,
        )?,
        extraction_rate: rate(&lookup, "FATURAS_EXTRACTION_RATE", rate_limit(10, 60_000))?,
        drive_rate: rate(&lookup, "FATURAS_DRIVE_RATE", rate_limit(100, 100_000))?,
        sheets_rate: rate(&lookup, "FATURAS_SHEETS_RATE", rate_limit(60, 60_000))?,
        gmail_rate: rate(&lookup, "FATURAS_GMAIL_RATE", rate_limit(250, 1_000))?,
    })
}
