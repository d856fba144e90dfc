use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use faturas_sync::commands::{accounts, dashboard, invoices, run};
use faturas_sync::config::load_settings;
use faturas_sync::db::InvoiceFilter;
use faturas_sync::models::InvoiceStatus;
use faturas_sync::services::queue::AbortHandle;
use faturas_sync::services::state::AppState;

#[derive(Parser)]
#[command(name = "faturas", about = "Invoice sync across the record store, Drive and Sheets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scheduled pass over every mailbox account
    Run,
    /// Ingest local PDF or image files; directories are walked
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Change invoice fields and propagate them to Drive and Sheets
    Update {
        id: String,
        #[command(flatten)]
        fields: invoices::PatchInput,
    },
    /// Delete an invoice, its stored file and its ledger row
    Delete { id: String },
    /// List stored invoices
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Download stored files into a local directory
    Export {
        dir: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Invoice totals and the last scheduled run
    Status {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Linked Google accounts
    Account {
        #[command(subcommand)]
        sub: AccountCommands,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    #[arg(long)]
    year: Option<i32>,
    #[arg(long)]
    supplier: Option<String>,
    /// processed or review
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

impl FilterArgs {
    fn into_filter(self) -> Result<InvoiceFilter> {
        let status = match self.status {
            Some(raw) => Some(
                InvoiceStatus::parse(&raw).with_context(|| format!("Unknown status: {}", raw))?,
            ),
            None => None,
        };
        Ok(InvoiceFilter {
            year: self.year,
            supplier_contains: self.supplier,
            status,
            limit: self.limit,
        })
    }
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Exchange an authorization code and store the account
    Add {
        account: String,
        #[arg(long)]
        code: String,
        /// Make this the primary storage account
        #[arg(long)]
        primary: bool,
    },
    /// Make an account the primary storage account
    Primary { account: String },
    Remove { account: String },
    List,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("faturas_sync=info,faturas=info")
            }),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ctrl-C stops the queue between items; the item in flight finishes.
fn abort_on_ctrl_c() -> AbortHandle {
    let handle = AbortHandle::new();
    let signal = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current item");
            signal.abort();
        }
    });
    handle
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = load_settings().context("Invalid configuration")?;
    let state = AppState::new(settings).context("Failed to initialize")?;

    match cli.command {
        Commands::Run => print_json(&run::run_scheduled(&state, abort_on_ctrl_c()).await?),
        Commands::Ingest { paths } => {
            print_json(&invoices::ingest(&state, &paths, abort_on_ctrl_c()).await?)
        }
        Commands::Update { id, fields } => {
            print_json(&invoices::update_invoice(&state, &id, fields).await?)
        }
        Commands::Delete { id } => print_json(&invoices::delete_invoice(&state, &id).await?),
        Commands::List { filter } => {
            print_json(&invoices::list_invoices(&state, &filter.into_filter()?)?)
        }
        Commands::Export { dir, filter } => {
            let report = invoices::export_invoices(&state, &filter.into_filter()?, &dir).await?;
            println!(
                "{} written, {} failed, {} without a stored file",
                report.written.len(),
                report.failed.len(),
                report.skipped
            );
            for (id, reason) in &report.failed {
                eprintln!("  {}: {}", id, reason);
            }
            Ok(())
        }
        Commands::Status { year } => print_json(&dashboard::get_status(&state, year)?),
        Commands::Account { sub } => match sub {
            AccountCommands::Add { account, code, primary } => {
                print_json(&accounts::add_account(&state, &account, &code, primary).await?)
            }
            AccountCommands::Primary { account } => accounts::set_primary(&state, &account),
            AccountCommands::Remove { account } => accounts::remove_account(&state, &account),
            AccountCommands::List => print_json(&accounts::list_accounts(&state)?),
        },
    }
}
