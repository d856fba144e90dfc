pub mod credentials;
pub mod crypto;
pub mod delete;
pub mod drive;
pub mod duplicates;
pub mod export;
pub mod extraction;
pub mod gmail;
pub mod google;
pub mod processor;
pub mod queue;
pub mod rate_limiter;
pub mod resolver;
pub mod row_locator;
pub mod scheduler;
pub mod sheets;
pub mod state;
pub mod update;
