use anyhow::Result;
use chrono::{Datelike, Local};
use serde::Serialize;

use crate::db::InvoiceFilter;
use crate::models::{InvoiceStatus, RunSummary};
use crate::services::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub year: i32,
    pub invoices_year: usize,
    pub total_year: f64,
    pub in_review: usize,
    pub last_run: Option<RunSummary>,
}

pub fn get_status(state: &AppState, year: Option<i32>) -> Result<StatusReport> {
    let year = year.unwrap_or_else(|| Local::now().year());
    let invoices = state.store.list_invoices(&InvoiceFilter {
        year: Some(year),
        ..Default::default()
    })?;
    let in_review = state
        .store
        .list_invoices(&InvoiceFilter {
            status: Some(InvoiceStatus::Review),
            ..Default::default()
        })?
        .len();

    Ok(StatusReport {
        year,
        invoices_year: invoices.len(),
        total_year: invoices.iter().map(|i| i.total_amount).sum(),
        in_review,
        last_run: state.store.last_run()?,
    })
}
