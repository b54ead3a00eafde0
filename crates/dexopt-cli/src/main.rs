use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use dexopt_core::{
    BatchDexopter, CancellationSignal, Clock, Config, DexUseStore, Effects, StoreMode,
    SystemClock,
};
use dexopt_domain::PackageSnapshot;
use serde_json::{json, Value};

mod cli;
mod offline;

use cli::{Command, DexoptCli, DumpArgs, PlanArgs};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = DexoptCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let config = Config::from_env().map_err(|err| eyre!("{err:#}"))?;
    let report = match &cli.command {
        Command::Dump(args) => dump(&config, args),
        Command::Plan(args) => plan(&config, args),
    }
    .map_err(|err| eyre!("{err:#}"))?;

    emit_output(cli.json, &report)
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("dexopt={level},dexopt_core={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// What a command produced, in both renderings.
struct Report {
    message: String,
    human: String,
    details: Value,
}

fn emit_output(json: bool, report: &Report) -> Result<()> {
    if json {
        let payload = json!({
            "status": "ok",
            "message": report.message,
            "details": report.details,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", report.human.trim_end());
    }
    Ok(())
}

fn ledger_path(config: &Config, explicit: Option<&PathBuf>) -> PathBuf {
    explicit
        .cloned()
        .unwrap_or_else(|| config.dex_use().ledger_path.clone())
}

fn open_store(
    config: &Config,
    ledger: &Path,
    snapshot: PackageSnapshot,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<(Effects, Arc<DexUseStore>)> {
    let effects = offline::effects(ledger, snapshot, clock);
    let store = DexUseStore::new(config.dex_use().clone(), &effects, StoreMode::Staged)?;
    Ok((effects, Arc::new(store)))
}

fn dump(config: &Config, args: &DumpArgs) -> anyhow::Result<Report> {
    let ledger = ledger_path(config, args.ledger.as_ref());
    tracing::debug!(ledger = %ledger.display(), "loading dex use ledger");
    let (_, store) = open_store(
        config,
        &ledger,
        PackageSnapshot::default(),
        Arc::new(SystemClock),
    )?;
    let rendered = store.dump()?;
    let contents: Value =
        serde_json::from_str(&rendered).context("dex use ledger dump is not valid JSON")?;
    Ok(Report {
        message: format!("dex use ledger at {}", ledger.display()),
        human: rendered,
        details: json!({
            "ledger": ledger.display().to_string(),
            "dex_use": contents,
        }),
    })
}

fn plan(config: &Config, args: &PlanArgs) -> anyhow::Result<Report> {
    let raw = fs::read_to_string(&args.inventory)
        .with_context(|| format!("failed to read {}", args.inventory.display()))?;
    let snapshot = PackageSnapshot::from_json(&raw)
        .with_context(|| format!("invalid inventory {}", args.inventory.display()))?;
    let ledger = ledger_path(config, args.ledger.as_ref());
    let clock: Arc<dyn Clock> = match args.now_ms {
        Some(now) => Arc::new(offline::PinnedClock(now)),
        None => Arc::new(SystemClock),
    };

    let (effects, store) = open_store(config, &ledger, snapshot.clone(), clock)?;
    let batch = BatchDexopter::new(*config.batch(), &effects, store);
    let planned =
        batch.batch_dexopt_params(&snapshot, args.reason, &CancellationSignal::new(), None)?;
    let params = &planned.params;

    let mut human = String::new();
    writeln!(human, "reason: {}", params.reason)?;
    writeln!(human, "compiler filter: {}", params.compiler_filter)?;
    writeln!(human, "priority: {}", params.priority)?;
    if !params.package_filter_overrides.is_empty() {
        writeln!(human, "overrides:")?;
        for (package, filter) in &params.package_filter_overrides {
            writeln!(human, "  {package}: {filter}")?;
        }
    }
    writeln!(human, "packages ({}):", planned.packages.len())?;
    for (index, package) in planned.packages.iter().enumerate() {
        writeln!(human, "  {}. {package}", index + 1)?;
    }

    Ok(Report {
        message: format!(
            "{} packages selected for {}",
            planned.packages.len(),
            params.reason
        ),
        human,
        details: json!({
            "reason": params.reason,
            "packages": planned.packages,
            "params": serde_json::to_value(params)?,
        }),
    })
}
