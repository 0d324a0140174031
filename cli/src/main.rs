//! LedgerStream CLI: stream ledger, transaction, validation and consensus
//! events from a node's WebSocket API.
//!
//! # Commands
//! ```text
//! ledgerstream ledger
//! ledgerstream transactions
//! ledgerstream validations
//! ledgerstream consensus
//! ledgerstream account      --address <r...> [--address <r...>]
//! ledgerstream order-book   [--pays XRP] [--gets CUR.ISSUER] [--no-snapshot]
//! ledgerstream book-changes
//! ledgerstream server-info
//! ledgerstream request      --command <name> [--params <json>]
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use ledgerstream_core::{
    Book, ClientConfig, EventKind, HandlerError, Issue, StreamName, Subscription,
};
use ledgerstream_ws::{handler_fn, CloseReason, ConnectionState, LedgerStreamClient};

mod logging;

use logging::LogConfig;

const DEFAULT_URL: &str = "wss://xrplcluster.com";

/// RLUSD issued by its mainnet issuer.
const DEFAULT_GETS: &str = "524C555344000000000000000000000000000000.rMxCKbEDwqr76QuheSUMdEGf4B9xJ8m5De";

#[derive(Parser)]
#[command(
    name = "ledgerstream",
    about = "Stream ledger events from an XRPL-style WebSocket node",
    long_about = "
LedgerStream CLI: subscribe to ledger, transaction, validation, consensus,
account and order-book streams and print each event as JSON.

The connection reconnects with exponential backoff and restores every
subscription before streaming resumes. Stop with Ctrl-C.

ENVIRONMENT VARIABLES:
  RUST_LOG    Overrides --log-level (e.g. RUST_LOG=ledgerstream_ws=debug)
",
    version
)]
struct Cli {
    /// Node WebSocket endpoint
    #[arg(long, global = true, default_value = DEFAULT_URL)]
    url: String,

    /// JSON client config file; flags below override its fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Request timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Give up after this many consecutive failed reconnects
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Exit on the first connection failure instead of reconnecting
    #[arg(long, global = true)]
    no_reconnect: bool,

    /// Log level: trace | debug | info | warn | error
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every closed ledger
    Ledger,

    /// Print every validated transaction
    Transactions,

    /// Print every validation message
    Validations,

    /// Print consensus phase changes
    Consensus,

    /// Print transactions affecting the given accounts
    Account {
        /// Account address (repeatable)
        #[arg(long = "address", required = true, num_args = 1..)]
        addresses: Vec<String>,
    },

    /// Print transactions touching an order book
    #[command(name = "order-book")]
    OrderBook {
        /// Currency the taker pays: "XRP" or "CUR.ISSUER"
        #[arg(long, default_value = "XRP")]
        pays: String,
        /// Currency the taker gets: "XRP" or "CUR.ISSUER"
        #[arg(long, default_value = DEFAULT_GETS)]
        gets: String,
        /// Skip the initial book snapshot
        #[arg(long)]
        no_snapshot: bool,
    },

    /// Fetch book_changes for every closed ledger and print non-empty ones
    #[command(name = "book-changes")]
    BookChanges,

    /// Fetch server_info for every closed ledger
    #[command(name = "server-info")]
    ServerInfo,

    /// Send one request and print its result
    Request {
        /// Command name, e.g. "server_info"
        #[arg(long)]
        command: String,
        /// Parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.json_logs,
        ..Default::default()
    });

    let config = build_config(&cli)?;

    match &cli.command {
        Commands::Request { command, params } => {
            cmd_request(&cli.url, config, command, params).await
        }
        stream => cmd_stream(&cli.url, config, stream).await,
    }
}

fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(ms) = cli.timeout_ms {
        config.request_timeout_ms = ms;
    }
    if let Some(attempts) = cli.max_attempts {
        config.reconnect.max_attempts = Some(attempts);
    }
    if cli.no_reconnect {
        config.reconnect.enabled = false;
    }
    Ok(config)
}

// ─── streaming commands ──────────────────────────────────────────────────────

fn subscriptions_for(command: &Commands) -> Result<Vec<Subscription>> {
    let stream = |name| vec![Subscription::stream(name)];
    Ok(match command {
        Commands::Ledger | Commands::BookChanges | Commands::ServerInfo => {
            stream(StreamName::Ledger)
        }
        Commands::Transactions => stream(StreamName::Transactions),
        Commands::Validations => stream(StreamName::Validations),
        Commands::Consensus => stream(StreamName::Consensus),
        Commands::Account { addresses } => addresses.iter().map(Subscription::account).collect(),
        Commands::OrderBook { pays, gets, no_snapshot } => {
            let pays: Issue = pays.parse().map_err(|e| anyhow!("--pays: {e}"))?;
            let gets: Issue = gets.parse().map_err(|e| anyhow!("--gets: {e}"))?;
            vec![Subscription::book(Book::new(pays, gets).with_snapshot(!no_snapshot))]
        }
        Commands::Request { .. } => Vec::new(),
    })
}

fn register_handlers(client: &LedgerStreamClient, command: &Commands) {
    let printer = |kind| {
        client.on(
            kind,
            handler_fn(|event, _ctx| async move {
                print_record(&event.payload);
                Ok(())
            }),
        );
    };

    match command {
        Commands::Ledger => printer(EventKind::LedgerClosed),
        Commands::Transactions | Commands::Account { .. } | Commands::OrderBook { .. } => {
            printer(EventKind::Transaction)
        }
        Commands::Validations => printer(EventKind::ValidationReceived),
        Commands::Consensus => printer(EventKind::ConsensusPhase),
        Commands::BookChanges => {
            client.on(
                EventKind::LedgerClosed,
                handler_fn(|event, ctx| async move {
                    let Some(index) = event.ledger_index() else {
                        return Err(HandlerError::failed("ledgerClosed without ledger_index"));
                    };
                    let params = json!({ "ledger_index": index });
                    ctx.derive("book_changes", params, move |res| async move {
                        let result = res?;
                        if result["changes"].as_array().is_some_and(|changes| !changes.is_empty()) {
                            print_record(&result);
                        } else {
                            debug!(ledger_index = index, "no book changes");
                        }
                        Ok::<(), HandlerError>(())
                    });
                    Ok(())
                }),
            );
        }
        Commands::ServerInfo => {
            client.on(
                EventKind::LedgerClosed,
                handler_fn(|event, ctx| async move {
                    let index = event.ledger_index();
                    ctx.derive("server_info", Value::Null, move |res| async move {
                        let result = res?;
                        debug!(ledger_index = ?index, "server_info answered");
                        print_record(&result["info"]);
                        Ok::<(), HandlerError>(())
                    });
                    Ok(())
                }),
            );
        }
        Commands::Request { .. } => {}
    }
}

async fn cmd_stream(url: &str, config: ClientConfig, command: &Commands) -> Result<()> {
    let subscriptions = subscriptions_for(command)?;
    let client = LedgerStreamClient::new(url, config);
    register_handlers(&client, command);
    tokio::spawn(log_errors(client.errors()));

    client.start().await.with_context(|| format!("connecting to {url}"))?;
    info!(url, "connected");

    for sub in subscriptions {
        client
            .subscribe(sub.clone())
            .await
            .with_context(|| format!("subscribing to {sub}"))?;
    }

    let mut states = client.state_changes();
    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for Ctrl-C"),
        reason = wait_closed(&mut states) => Err(anyhow!("connection closed: {reason}")),
    };

    client.disconnect().await;
    outcome
}

async fn wait_closed(states: &mut watch::Receiver<ConnectionState>) -> CloseReason {
    loop {
        if let ConnectionState::Closed(reason) = states.borrow_and_update().clone() {
            return reason;
        }
        if states.changed().await.is_err() {
            return CloseReason::Requested;
        }
    }
}

async fn log_errors(mut errors: broadcast::Receiver<ledgerstream_core::ErrorReport>) {
    loop {
        match errors.recv().await {
            Ok(report) => warn!(%report, "stream error"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "error reports dropped")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ─── one-shot request ────────────────────────────────────────────────────────

async fn cmd_request(url: &str, config: ClientConfig, command: &str, params: &str) -> Result<()> {
    let params: Value = serde_json::from_str(params).context("--params must be a JSON object")?;
    let client = LedgerStreamClient::connect(url, config)
        .await
        .with_context(|| format!("connecting to {url}"))?;

    let outcome = client.request(command, params).await;
    client.disconnect().await;

    let result = outcome.with_context(|| format!("request '{command}' failed"))?;
    print_record(&result);
    Ok(())
}

fn print_record(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
    println!("---");
}
