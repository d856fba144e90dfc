//! Keeps invoices consistent across the local record store, a Drive folder tree and yearly
//! Sheets ledgers.

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use error::{SyncError, SyncResult};
