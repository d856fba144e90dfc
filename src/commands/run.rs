use anyhow::{Context, Result};

use crate::models::RunSummary;
use crate::services::queue::AbortHandle;
use crate::services::scheduler;
use crate::services::state::AppState;

pub async fn run_scheduled(state: &AppState, abort: AbortHandle) -> Result<RunSummary> {
    scheduler::run_once(state, abort)
        .await
        .context("Scheduled run failed")
}
