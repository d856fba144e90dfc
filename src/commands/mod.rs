pub mod accounts;
pub mod dashboard;
pub mod invoices;
pub mod run;
