//! finsync CLI: sync, query, ledger and factor commands.
//!
//! Commands:
//! - `update` sync one series across entities (incremental by default)
//! - `query` print stored rows as CSV
//! - `ledger status|clear|compact` inspect or maintain coverage records
//! - `factors list|resolve|eval` work with registered factors
//! - `plugins` dump every plugin's probe as JSON

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use finsync_core::frame::{self, TableFrame};
use finsync_core::time::TimeRange;
use finsync_core::EngineConfig;
use finsync_runner::{Context, LogProgress, QueryOptions, RangePolicy, RunState};

#[derive(Parser)]
#[command(name = "finsync", about = "finsync: incremental financial data sync")]
struct Cli {
    /// Engine config (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the config.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a series for the given entities, or for every entity it enumerates.
    Update {
        /// Series URI or alias (e.g. Market.DailyBar, bars).
        uri: String,

        /// Entities to update. Defaults to the series' update list.
        entities: Vec<String>,

        /// Start date (YYYY-MM-DD) of an explicit window.
        #[arg(long)]
        since: Option<String>,

        /// End date (YYYY-MM-DD) of an explicit window.
        #[arg(long)]
        until: Option<String>,

        /// Ignore coverage and refetch from the default since.
        #[arg(long, default_value_t = false, conflicts_with_all = ["since", "until", "full"])]
        force: bool,

        /// Fetch with no time window at all.
        #[arg(long, default_value_t = false, conflicts_with_all = ["since", "until"])]
        full: bool,
    },
    /// Print stored rows of a series as CSV.
    Query {
        uri: String,

        #[arg(long)]
        entity: Option<String>,

        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        until: Option<String>,

        /// Comma-separated fields to keep.
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Accept and emit human-readable field labels.
        #[arg(long, default_value_t = false)]
        readable: bool,

        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Coverage ledger maintenance.
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
    /// Factor registry commands.
    Factors {
        #[command(subcommand)]
        action: FactorAction,
    },
    /// Print every registered plugin's probe as JSON.
    Plugins,
}

#[derive(Subcommand)]
enum LedgerAction {
    /// List every coverage record.
    Status {
        /// Only records whose tag path starts with this prefix.
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Forget coverage, for one tag path or everything.
    Clear {
        /// Tag path to delete (e.g. Market.DailyBar.SPY).
        #[arg(long)]
        tags: Option<String>,

        /// Required to clear the whole ledger.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Rewrite the ledger file with one line per live record.
    Compact,
}

#[derive(Subcommand)]
enum FactorAction {
    /// List registered factors.
    List,
    /// Show the evaluation plan for factor names.
    Resolve {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Evaluate factors for one entity and print CSV.
    Eval {
        #[arg(required = true)]
        names: Vec<String>,

        #[arg(long)]
        entity: Option<String>,

        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        until: Option<String>,

        /// Use stored data only.
        #[arg(long, default_value_t = false)]
        no_sync: bool,

        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.data_dir)?;

    match cli.command {
        Commands::Update {
            uri,
            entities,
            since,
            until,
            force,
            full,
        } => run_update(config, &uri, entities, since, until, force, full),
        Commands::Query {
            uri,
            entity,
            since,
            until,
            fields,
            readable,
            output,
        } => run_query(
            config,
            &uri,
            entity.as_deref(),
            parse_range(since.as_deref(), until.as_deref())?,
            fields,
            readable,
            output.as_deref(),
        ),
        Commands::Ledger { action } => run_ledger(config, action),
        Commands::Factors { action } => run_factors(config, action),
        Commands::Plugins => {
            let ctx = Context::open(config)?;
            let probes = ctx.registry().probes();
            println!("{}", serde_json::to_string_pretty(&probes)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    Ok(config)
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

fn parse_range(since: Option<&str>, until: Option<&str>) -> Result<Option<TimeRange>> {
    let since = since.map(parse_date).transpose()?;
    let until = until.map(parse_date).transpose()?;
    let range = TimeRange::new(since, until);
    Ok((!range.is_unbounded()).then_some(range))
}

fn run_update(
    config: EngineConfig,
    uri: &str,
    entities: Vec<String>,
    since: Option<String>,
    until: Option<String>,
    force: bool,
    full: bool,
) -> Result<()> {
    let policy = match (parse_range(since.as_deref(), until.as_deref())?, force, full) {
        (_, _, true) => RangePolicy::None,
        (_, true, _) => RangePolicy::Force,
        (Some(range), _, _) => RangePolicy::Explicit(range),
        (None, false, false) => RangePolicy::Auto,
    };
    let entities = (!entities.is_empty()).then_some(entities);

    let ctx = Context::open(config)?;
    let summary = ctx.driver().run(uri, entities, &policy, &LogProgress);

    for (entity, err) in &summary.failures {
        eprintln!("Error for {entity}: {err}");
    }
    println!(
        "{}: {}/{} applied ({:?})",
        summary.uri, summary.applied, summary.total, summary.state
    );
    if summary.state != RunState::Done {
        bail!("update of {uri} did not complete: {:?}", summary.state);
    }
    if !summary.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_query(
    config: EngineConfig,
    uri: &str,
    entity: Option<&str>,
    range: Option<TimeRange>,
    fields: Vec<String>,
    readable: bool,
    output: Option<&Path>,
) -> Result<()> {
    let ctx = Context::open(config)?;
    let options = QueryOptions {
        fields: (!fields.is_empty()).then_some(fields),
        readable,
        ..QueryOptions::default()
    };
    let orchestrator = ctx.orchestrator();
    match orchestrator.query(uri, entity, range.as_ref(), &options) {
        Some(frame) => write_csv(&frame, output),
        None => match orchestrator.last_error() {
            Some(err) => bail!("query failed: {err}"),
            None => {
                eprintln!("No rows for {uri}");
                Ok(())
            }
        },
    }
}

fn run_ledger(config: EngineConfig, action: LedgerAction) -> Result<()> {
    let ctx = Context::open(config)?;
    let ledger = ctx.ledger();
    match action {
        LedgerAction::Status { prefix } => {
            let records: Vec<_> = ledger
                .status()
                .into_iter()
                .filter(|(tags, _)| prefix.as_deref().map_or(true, |p| tags.starts_with(p)))
                .collect();
            if records.is_empty() {
                println!("Ledger is empty");
                return Ok(());
            }
            let show = |d: Option<NaiveDate>| d.map_or_else(|| "-".to_string(), |d| d.to_string());
            println!("{:<40} {:<12} {:<12} {:<20}", "Tags", "Since", "Until", "Refreshed");
            println!("{}", "-".repeat(86));
            for (tags, rec) in &records {
                let refreshed = rec
                    .last_refreshed
                    .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
                println!(
                    "{:<40} {:<12} {:<12} {:<20}",
                    tags,
                    show(rec.since),
                    show(rec.until),
                    refreshed
                );
            }
            println!("{} records", records.len());
        }
        LedgerAction::Clear { tags, all } => match (tags, all) {
            (Some(tags), _) => {
                ledger.delete(&tags)?;
                println!("Deleted {tags}");
            }
            (None, true) => {
                ledger.clear()?;
                println!("Ledger cleared");
            }
            (None, false) => bail!("pass --tags <path> or --all"),
        },
        LedgerAction::Compact => {
            ledger.compact()?;
            println!("Ledger compacted: {} records", ledger.status().len());
        }
    }
    Ok(())
}

fn run_factors(config: EngineConfig, action: FactorAction) -> Result<()> {
    let ctx = Context::open(config)?;
    match action {
        FactorAction::List => {
            let graph = ctx.graph();
            if graph.is_empty() {
                println!("No factors registered");
                return Ok(());
            }
            for factor in graph.factors() {
                println!(
                    "{}  [{}] provides {} <- {}  {}",
                    &factor.id[..12.min(factor.id.len())],
                    factor.plugin,
                    factor.descriptor.provides.join(", "),
                    factor.descriptor.depends.join(", "),
                    factor.descriptor.comments
                );
            }
        }
        FactorAction::Resolve { names } => {
            let plan = ctx.graph().resolve(&names)?;
            let groups = ctx.catalog().fields_to_uri(&plan.raw_fields);
            println!("Raw fields:");
            for (uri, fields) in &groups {
                println!("  {uri}: {}", fields.join(", "));
            }
            println!("Factors (in order): {}", plan.factors.join(" -> "));
        }
        FactorAction::Eval {
            names,
            entity,
            since,
            until,
            no_sync,
            output,
        } => {
            let range = parse_range(since.as_deref(), until.as_deref())?.unwrap_or_default();
            let frame = ctx
                .evaluator()
                .evaluate(&names, entity.as_deref(), &range, !no_sync)?;
            write_csv(&frame, output.as_deref())?;
        }
    }
    Ok(())
}

fn write_csv(df: &TableFrame, output: Option<&Path>) -> Result<()> {
    let sink: Box<dyn Write> = match output {
        Some(path) => Box::new(
            std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut writer = csv::Writer::from_writer(sink);

    writer.write_record(frame::column_names(df))?;
    let columns = df
        .get_columns()
        .iter()
        .map(frame::text_values)
        .collect::<Result<Vec<_>, _>>()?;
    for row in 0..df.height() {
        writer.write_record(
            columns
                .iter()
                .map(|col| col[row].as_deref().unwrap_or("")),
        )?;
    }
    writer.flush()?;

    if let Some(path) = output {
        eprintln!("Wrote {} rows to {}", df.height(), path.display());
    }
    Ok(())
}
