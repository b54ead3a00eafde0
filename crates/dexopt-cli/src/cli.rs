use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use dexopt_domain::DexoptReason;
use strum::IntoEnumIterator;

pub const DEXOPT_BEFORE_HELP: &str = concat!(
    "dexopt ",
    env!("CARGO_PKG_VERSION"),
    " – offline inspection of dexopt state\n\n",
    "\x1b[1;36mCommands\x1b[0m\n",
    "  dump             Print the dex use ledger as the store would load it.\n",
    "  plan             Show the packages and parameters a batch run would use.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    disable_help_subcommand = true,
    before_help = DEXOPT_BEFORE_HELP
)]
pub struct DexoptCli {
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(
        about = "Print the dex use ledger.",
        override_usage = "dexopt dump [--ledger FILE]"
    )]
    Dump(DumpArgs),
    #[command(
        about = "Show the default packages and parameters for a dexopt reason.",
        override_usage = "dexopt plan --inventory FILE --reason REASON [--ledger FILE] [--now-ms N]",
        after_help = "Examples:\n  dexopt plan --inventory packages.json --reason bg-dexopt\n  dexopt plan --inventory packages.json --reason first-boot --json\n"
    )]
    Plan(PlanArgs),
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    #[arg(
        long,
        value_name = "FILE",
        help = "Ledger file (defaults to DEXOPT_DEX_USE_FILE or the system path)"
    )]
    pub ledger: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[arg(long, value_name = "FILE", help = "JSON package inventory")]
    pub inventory: PathBuf,
    #[arg(
        long,
        value_name = "FILE",
        help = "Ledger file (defaults to DEXOPT_DEX_USE_FILE or the system path)"
    )]
    pub ledger: Option<PathBuf>,
    #[arg(long, value_name = "REASON", value_parser = parse_reason)]
    pub reason: DexoptReason,
    #[arg(
        long,
        value_name = "N",
        help = "Treat this epoch millisecond as now instead of the wall clock"
    )]
    pub now_ms: Option<u64>,
}

fn parse_reason(raw: &str) -> Result<DexoptReason, String> {
    raw.parse().map_err(|_| {
        let known: Vec<String> = DexoptReason::iter().map(|r| r.to_string()).collect();
        format!("unknown reason '{raw}' (expected one of: {})", known.join(", "))
    })
}
