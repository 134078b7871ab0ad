#![forbid(unsafe_code)]

mod cmd;
mod output;

use std::env;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use output::{OutputMode, resolve_output_mode};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "weft: inspect, merge and stress-test replicated causal trees",
    long_about = None
)]
struct Cli {
    /// Tree options file (`weft.toml`); `WEFT_GC` overrides its GC switch.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(long, value_enum, global = true)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Create a new stored tree",
        after_help = "EXAMPLES:\n    # First replica of a document owns the root\n    weft init doc.json --site 1 --root\n\n    # A peer starts empty and merges later\n    weft init peer.json --site 2"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        about = "Apply entity events to a stored tree",
        after_help = "EXAMPLES:\n    weft apply doc.json events.json"
    )]
    Apply(cmd::apply::ApplyArgs),

    #[command(
        about = "Show a tree's entities, clock and version",
        after_help = "EXAMPLES:\n    weft inspect doc.json\n\n    # Include the weave, atom by atom\n    weft inspect doc.json --atoms --json"
    )]
    Inspect(cmd::inspect::InspectArgs),

    #[command(
        about = "Strictly validate stored trees",
        after_help = "EXAMPLES:\n    weft validate doc.json peer.json"
    )]
    Validate(cmd::validate::ValidateArgs),

    #[command(
        about = "Merge one replica into another",
        after_help = "EXAMPLES:\n    weft merge doc.json peer.json -o merged.json"
    )]
    Merge(cmd::merge::MergeArgs),

    #[command(about = "Deterministic simulation campaigns")]
    Sim(cmd::sim::SimArgs),
}

/// Install the tracing subscriber. Filter from `WEFT_LOG`, format from
/// `WEFT_LOG_FORMAT` (`compact` or `json`). Logs go to stderr so stdout stays
/// parseable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "weft=debug,info"
        } else {
            "weft=info,warn"
        })
    });

    let format = env::var("WEFT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let output = resolve_output_mode(cli.format, cli.json);
    let options = weft_core::config::resolve_tree_options(cli.config.as_deref())?;
    debug!(?options, ?output, "resolved options");

    match &cli.command {
        Commands::Init(args) => cmd::init::run_init(args, options, output),
        Commands::Apply(args) => cmd::apply::run_apply(args, options, output),
        Commands::Inspect(args) => cmd::inspect::run_inspect(args, options, output),
        Commands::Validate(args) => cmd::validate::run_validate(args, options, output),
        Commands::Merge(args) => cmd::merge::run_merge(args, options, output),
        Commands::Sim(args) => match &args.command {
            cmd::sim::SimCommand::Run(run) => cmd::sim::run_sim_run(run, output),
            cmd::sim::SimCommand::Replay(replay) => cmd::sim::run_sim_replay(replay, output),
        },
    }
}
