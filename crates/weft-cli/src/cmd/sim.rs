//! `weft sim`: deterministic simulation campaigns.
//!
//! `weft sim run` sweeps a seed range; `weft sim replay` reruns one seed and
//! prints its trace summary and oracle verdict.

use std::io::Write;
use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use weft_sim::campaign::{CampaignConfig, format_violation, load_campaign_config};
use weft_sim::network::FaultConfig;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

#[derive(Subcommand, Debug)]
pub enum SimCommand {
    #[command(
        about = "Run a simulation campaign across many seeds",
        after_help = "EXAMPLES:\n    # 100 seeds with defaults\n    weft sim run --seeds 100\n\n\
                      # Parameters from a file, heavier faults\n    weft sim run --campaign campaign.toml --faults 0.4\n\n\
                      # Machine-readable output\n    weft sim run --seeds 50 --json"
    )]
    Run(SimRunArgs),

    #[command(
        about = "Replay one seed with its oracle verdict",
        after_help = "EXAMPLES:\n    weft sim replay --seed 42 --replicas 5"
    )]
    Replay(SimReplayArgs),
}

/// Overrides applied on top of the defaults or `--campaign`.
#[derive(Args, Debug, Default)]
pub struct CampaignOverrides {
    /// Campaign config TOML; flags below override its values.
    #[arg(long = "campaign", value_name = "FILE")]
    pub campaign_file: Option<PathBuf>,

    /// Number of replicas per seed.
    #[arg(long)]
    pub replicas: Option<usize>,

    /// Rounds per seed.
    #[arg(long)]
    pub rounds: Option<u64>,

    /// Peers each replica sends its new atoms to per round.
    #[arg(long)]
    pub fanout: Option<usize>,

    /// Overall fault probability between 0.0 and 1.0; scales drop,
    /// duplicate, reorder and partition rates.
    #[arg(long)]
    pub faults: Option<f64>,
}

#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Number of seeds to run.
    #[arg(long)]
    pub seeds: Option<u64>,

    /// First seed.
    #[arg(long)]
    pub seed_start: Option<u64>,

    #[command(flatten)]
    pub campaign: CampaignOverrides,
}

#[derive(Args, Debug)]
pub struct SimReplayArgs {
    #[arg(long)]
    pub seed: u64,

    #[command(flatten)]
    pub campaign: CampaignOverrides,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    seeds_failed: usize,
    first_failure: Option<u64>,
    interesting_states_reached: usize,
    atoms_created: usize,
    all_passed: bool,
    failures: Vec<weft_sim::campaign::SeedFailure>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    replicas: usize,
    trace_events: usize,
    atoms_created: usize,
    interesting_state_reached: bool,
    oracle_passed: bool,
    violations: Vec<String>,
    hash: Option<String>,
}

/// Fault rates for an overall probability; drop and partition stay lighter
/// than reorder so runs still make progress.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scaled_faults(base: FaultConfig, faults: f64) -> FaultConfig {
    // Weights are at most 100, so the product fits a u8.
    let scale = |weight: f64| (faults.clamp(0.0, 1.0) * weight).round() as u8;
    FaultConfig {
        drop_rate_percent: scale(50.0),
        duplicate_rate_percent: scale(25.0),
        reorder_rate_percent: scale(100.0),
        partition_rate_percent: scale(25.0),
        ..base
    }
}

fn build_config(overrides: &CampaignOverrides) -> Result<CampaignConfig> {
    let mut config = match &overrides.campaign_file {
        Some(path) => load_campaign_config(path)?,
        None => CampaignConfig::default(),
    };
    if let Some(replicas) = overrides.replicas {
        config.replica_count = replicas;
    }
    if let Some(rounds) = overrides.rounds {
        config.rounds = rounds;
    }
    if let Some(fanout) = overrides.fanout {
        config.fanout = fanout;
    }
    if let Some(faults) = overrides.faults {
        config.fault = scaled_faults(config.fault, faults);
    }
    Ok(config)
}

pub fn run_sim_run(args: &SimRunArgs, output: OutputMode) -> Result<()> {
    let mut config = build_config(&args.campaign)?;
    let start = args.seed_start.unwrap_or(config.seed_range.start);
    let count = args
        .seeds
        .unwrap_or_else(|| config.seed_range.end.saturating_sub(config.seed_range.start));
    config.seed_range = start..start.saturating_add(count);

    let report = weft_sim::run_campaign(&config)?;
    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        seeds_failed: report.failures.len(),
        first_failure: report.first_failure,
        interesting_states_reached: report.interesting_states_reached,
        atoms_created: report.atoms_created,
        all_passed: report.all_passed(),
        failures: report.failures.clone(),
    };

    render_mode(
        output,
        &out,
        |o, w| {
            writeln!(
                w,
                "campaign seeds_run={} replicas={} rounds={}",
                o.seeds_run, config.replica_count, config.rounds
            )?;
            writeln!(
                w,
                "results passed={} failed={} interesting_states={} atoms={} all_passed={}",
                o.seeds_passed,
                o.seeds_failed,
                o.interesting_states_reached,
                o.atoms_created,
                o.all_passed
            )?;
            for failure in o.failures.iter().take(5) {
                writeln!(
                    w,
                    "failure seed={} violations={}",
                    failure.seed,
                    failure.violations.len()
                )?;
            }
            Ok(())
        },
        |o, w| {
            pretty_section(w, "Simulation Campaign")?;
            pretty_kv(w, "Seeds", o.seeds_run.to_string())?;
            pretty_kv(w, "Replicas", config.replica_count.to_string())?;
            pretty_kv(w, "Rounds", config.rounds.to_string())?;
            pretty_kv(
                w,
                "Results",
                format!(
                    "{} passed / {} failed ({} interesting)",
                    o.seeds_passed, o.seeds_failed, o.interesting_states_reached
                ),
            )?;
            match o.first_failure {
                None => pretty_kv(w, "Status", "all seeds passed")?,
                Some(seed) => {
                    pretty_kv(w, "Status", format!("first failure at seed {seed}"))?;
                    for failure in o.failures.iter().take(5) {
                        writeln!(w, "seed {}", failure.seed)?;
                        for violation in &failure.violations {
                            writeln!(w, "  - {violation}")?;
                        }
                    }
                    pretty_kv(
                        w,
                        "Replay",
                        format!(
                            "weft sim replay --seed {seed} --replicas {} --rounds {}",
                            config.replica_count, config.rounds
                        ),
                    )?;
                }
            }
            Ok(())
        },
    )?;

    // Non-zero exit for CI.
    if !report.all_passed() {
        process::exit(1);
    }
    Ok(())
}

pub fn run_sim_replay(args: &SimReplayArgs, output: OutputMode) -> Result<()> {
    let mut config = build_config(&args.campaign)?;
    config.seed_range = args.seed..args.seed.saturating_add(1);

    let trace = weft_sim::replay_seed(args.seed, &config)?;
    let out = ReplayOutput {
        seed: args.seed,
        replicas: trace.result.snapshots.len(),
        trace_events: trace.result.trace.len(),
        atoms_created: trace.result.authored.len(),
        interesting_state_reached: trace.result.interesting_state_reached,
        oracle_passed: trace.oracle.passed,
        violations: trace.oracle.violations.iter().map(format_violation).collect(),
        hash: trace
            .result
            .snapshots
            .first()
            .map(|snapshot| snapshot.version.hash.clone()),
    };

    render_mode(
        output,
        &out,
        |o, w| {
            writeln!(
                w,
                "replay seed={} replicas={} trace_events={} atoms={} interesting={} oracle_passed={}",
                o.seed,
                o.replicas,
                o.trace_events,
                o.atoms_created,
                o.interesting_state_reached,
                o.oracle_passed
            )?;
            for violation in &o.violations {
                writeln!(w, "violation={violation}")?;
            }
            Ok(())
        },
        |o, w| {
            pretty_section(w, &format!("Replay Seed {}", o.seed))?;
            pretty_kv(w, "Replicas", o.replicas.to_string())?;
            pretty_kv(w, "Trace events", o.trace_events.to_string())?;
            pretty_kv(w, "Atoms", o.atoms_created.to_string())?;
            pretty_kv(w, "Interesting", o.interesting_state_reached.to_string())?;
            pretty_kv(w, "Version", o.hash.as_deref().unwrap_or("-"))?;
            pretty_kv(w, "Oracle", if o.oracle_passed { "passed" } else { "FAILED" })?;
            for violation in &o.violations {
                writeln!(w, "  - {violation}")?;
            }
            Ok(())
        },
    )?;

    if !trace.oracle.passed {
        process::exit(1);
    }
    Ok(())
}
