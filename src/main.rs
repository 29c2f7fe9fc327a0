#![forbid(unsafe_code)]

use error_iter::ErrorIter as _;
use is_terminal::IsTerminal as _;
use onlyargs::CliError;
use onlyargs_derive::OnlyArgs;
use rclgains::basis::{BasisDiscipline, BasisError, CostBasisLedger, LedgerOptions, RunSummary};
use rclgains::client::{data::DataClient, DataApi, DataApiError};
use rclgains::config::{Annotations, AnnotationsError};
use rclgains::history::{BalanceChangeIterator, HistoryError};
use rclgains::model::amount::{Address, AddressError, AssetId, AssetIdError};
use rclgains::report::{LedgerReport, ReportSink, TableReport};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::{env, process::ExitCode};
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

#[derive(Debug, OnlyArgs)]
#[footer = "Accounts are given as NICK=ADDRESS, or as a bare r... address."]
#[footer = ""]
#[footer = "Debits are considered sales and gains are calculated against earlier"]
#[footer = "credits. Same-asset payments between observed accounts are ignored"]
#[footer = "(moving funds, not a buy or sell)."]
#[footer = ""]
#[footer = "Additional environment variables:"]
#[footer = "  - RUST_LOG configures logging, e.g. RUST_LOG=debug"]
#[footer = "  - TERM_COLOR accepts \"always\" to override automatic terminal sensing"]
struct Args {
    /// Observe this account's history. Repeatable.
    #[long]
    account: Vec<String>,

    /// Calculate cost basis first in, first out.
    fifo: bool,

    /// Calculate cost basis last in, first out.
    lifo: bool,

    /// Normalize values against this asset.
    #[default("USD/rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B")]
    base: String,

    /// Ripple Data API server.
    #[default("https://data.ripple.com/v2/")]
    data_api: String,

    /// Read note/ignore/strict annotations from a RON file.
    annotations: Option<PathBuf>,

    /// Stop after this many transactions (0 means all).
    #[long]
    #[default(0)]
    limit: u64,

    /// Ignore ledger history after this ledger index.
    until_ledger: Option<u32>,

    /// Do not record transaction fees in the fee bucket.
    no_fees: bool,

    /// Escalate inventory gaps to hard failures.
    strict: bool,

    /// Emit ledger-cli style output instead of the gains table.
    #[long]
    ledger: bool,
}

#[derive(Debug, Error)]
enum Error {
    #[error("Argument parsing error")]
    Args(#[from] CliError),

    #[error("Specify exactly one of --fifo or --lifo")]
    Discipline,

    #[error("Expected at least one --account")]
    NoAccounts,

    #[error("Invalid account argument `{0}`")]
    AccountArg(String, #[source] AddressError),

    #[error("Invalid base asset `{0}`")]
    BaseAsset(String, #[source] AssetIdError),

    #[error("Unable to load annotations from {0:?}")]
    Annotations(PathBuf, #[source] AnnotationsError),

    #[error("Data API client error")]
    Client(#[from] DataApiError),

    #[error("History iteration error")]
    History(#[from] HistoryError),

    #[error("Cost basis error")]
    Basis(#[from] BasisError),
}

fn main() -> ExitCode {
    // Initialize the tracing subscriber for instrumentation.
    // Uses the `RUST_LOG` environment var for configuration. E.g. `RUST_LOG=debug cargo run`
    //
    // See: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/struct.EnvFilter.html#directives
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let term_color = env::var("TERM_COLOR")
        .map(|color| color == "always")
        .unwrap_or_else(|_| std::io::stdout().is_terminal());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(term_color))
        .with(env_filter)
        .init();

    match run(onlyargs::parse()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            for source in err.sources().skip(1) {
                eprintln!("  Caused by: {source}");
            }

            ExitCode::FAILURE
        }
    }
}

struct RunConfig {
    base: AssetId,
    discipline: BasisDiscipline,
    options: LedgerOptions,
    limit: u64,
    until_ledger: Option<u32>,
}

fn run(args: Result<Args, CliError>) -> Result<(), Error> {
    let args = args?;

    if args.fifo == args.lifo {
        return Err(Error::Discipline);
    }
    let discipline = if args.fifo {
        BasisDiscipline::Fifo
    } else {
        BasisDiscipline::Lifo
    };

    if args.account.is_empty() {
        return Err(Error::NoAccounts);
    }
    // Whatever was typed on the command line, nickname or bare address, is
    // how the account shows up in output.
    let mut accounts = BTreeMap::new();
    for arg in &args.account {
        let (nick, address) = match arg.split_once('=') {
            Some((nick, address)) => (nick, address),
            None => (arg.as_str(), arg.as_str()),
        };
        let address: Address = address
            .parse()
            .map_err(|err| Error::AccountArg(arg.clone(), err))?;
        accounts.insert(nick.to_string(), address);
    }

    let base: AssetId = args
        .base
        .parse()
        .map_err(|err| Error::BaseAsset(args.base.clone(), err))?;

    let annotations = match &args.annotations {
        Some(path) => {
            Annotations::load(path).map_err(|err| Error::Annotations(path.clone(), err))?
        }
        None => Annotations::default(),
    };

    let config = RunConfig {
        base: base.clone(),
        discipline,
        options: LedgerOptions {
            strict: args.strict,
            suppress_fees: args.no_fees,
        },
        limit: args.limit,
        until_ledger: args.until_ledger,
    };

    let client = DataClient::new(&args.data_api)?;
    info!(
        "Calculating {count} account(s) via {api}",
        count = accounts.len(),
        api = args.data_api,
    );

    let summary = if args.ledger {
        let mut sink = LedgerReport::new(&client, base);
        let summary = drive(&client, &mut sink, accounts, &annotations, &config)?;
        println!("{}", sink.into_text());

        summary
    } else {
        let mut sink = TableReport::new(base);
        let summary = drive(&client, &mut sink, accounts, &annotations, &config)?;
        println!("{sink}");

        summary
    };

    epilogue(&summary);

    Ok(())
}

/// Feed the merged history through the cost basis ledger, honoring the
/// transaction limit and ledger bound.
fn drive<C, S>(
    client: &C,
    sink: &mut S,
    accounts: BTreeMap<String, Address>,
    annotations: &Annotations,
    config: &RunConfig,
) -> Result<RunSummary, Error>
where
    C: DataApi,
    S: ReportSink,
{
    let mut iterator = BalanceChangeIterator::new(client, accounts);
    iterator.init()?;

    for (nick, data) in &iterator.account_data {
        info!(
            "{nick} created by {parent} at {inception}",
            parent = data.parent,
            inception = data.inception,
        );
    }

    let mut ledger = CostBasisLedger::new(
        client,
        sink,
        config.base.clone(),
        config.discipline,
        annotations,
        config.options,
    );

    let mut count: u64 = 0;
    while let Some(group) = iterator.next_group()? {
        if let Some(until) = config.until_ledger {
            if group.ledger_index() > until {
                info!(
                    "Stopping at ledger {index} (--until-ledger {until})",
                    index = group.ledger_index(),
                );
                break;
            }
        }

        count += 1;
        debug!(
            "Tx {count} ({hash}) has {events} events",
            hash = group.hash(),
            events = group.len(),
        );
        ledger.process_group(&group)?;

        if config.limit > 0 && count >= config.limit {
            info!("Stopping after {count} transactions (--limit)");
            break;
        }
    }

    Ok(ledger.finish())
}

/// Warnings are part of the report, not just the log.
fn epilogue(summary: &RunSummary) {
    println!("Warnings");
    println!("========");
    println!();

    if summary.warnings.is_empty() {
        println!("No gaps detected! 🎉");
    } else {
        for warning in &summary.warnings {
            println!("  ⚠️ {warning}");
        }
    }

    println!();
    println!(
        "Processed {count} transaction(s)",
        count = summary.transactions,
    );
}
