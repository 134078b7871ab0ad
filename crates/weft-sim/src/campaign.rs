//! Campaign runner: many seeds, one report.
//!
//! Every seed runs twice, with and without garbage collection, so the oracle
//! can compare the two runs replica by replica. The first failing seed is
//! reported for replay.

use std::fs;
use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use weft_core::TreeOptions;

use crate::network::FaultConfig;
use crate::oracle::{ConvergenceOracle, InvariantViolation, OracleResult};
use crate::rng::DeterministicRng;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Salt for the oracle's RNG stream, independent of the simulation's.
const ORACLE_SALT: u64 = 0xDEAD;

/// Campaign parameters, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub seed_range: Range<u64>,
    pub replica_count: usize,
    pub rounds: u64,
    pub fanout: usize,
    pub edit_rate_percent: u8,
    pub fault: FaultConfig,
    pub buffer_orphans: bool,
    /// Shuffled-delivery replays per seed.
    pub commutativity_iterations: usize,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..100,
            replica_count: 4,
            rounds: 24,
            fanout: 2,
            edit_rate_percent: 70,
            fault: FaultConfig::default(),
            buffer_orphans: true,
            commutativity_iterations: 2,
        }
    }
}

impl CampaignConfig {
    /// Simulation parameters for `seed`, with garbage collection on or off.
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64, garbage_collection: bool) -> SimulationConfig {
        SimulationConfig {
            seed,
            replica_count: self.replica_count,
            rounds: self.rounds,
            fanout: self.fanout,
            edit_rate_percent: self.edit_rate_percent,
            fault: self.fault,
            tree: TreeOptions {
                garbage_collection,
                buffer_orphans: self.buffer_orphans,
            },
        }
    }

    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.replica_count == 0 {
            bail!("replica_count must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.edit_rate_percent > 100 {
            bail!("edit_rate_percent must be <= 100");
        }
        if !self.buffer_orphans {
            // Dropped orphans are gone for good, so replicas cannot converge.
            warn!("buffer_orphans = false: convergence violations are expected under reordering");
        }
        Ok(())
    }
}

/// Parse a campaign config from TOML text; missing keys keep their defaults.
///
/// # Errors
///
/// Returns an error if the TOML is malformed.
pub fn parse_campaign_config(content: &str) -> Result<CampaignConfig> {
    toml::from_str(content).context("Failed to parse campaign config TOML")
}

/// Load a campaign config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_campaign_config(path: &Path) -> Result<CampaignConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read campaign config {}", path.display()))?;
    parse_campaign_config(&content)
        .with_context(|| format!("Invalid campaign config {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate outcome of [`run_campaign`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// Lowest failing seed, for replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds whose run injected at least one fault or buffered an orphan.
    pub interesting_states_reached: usize,
    pub atoms_created: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything known about one seed after replay.
#[derive(Debug)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Run every seed in `config.seed_range`.
///
/// # Errors
///
/// Returns an error if the config is invalid or a run fails to start.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
        atoms_created: 0,
    };

    for seed in config.seed_range.clone() {
        let trace = replay_seed(seed, config)?;
        report.seeds_run += 1;
        report.atoms_created += trace.result.authored.len();
        if trace.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }

        if trace.oracle.passed {
            report.seeds_passed += 1;
        } else {
            warn!(seed, violations = trace.oracle.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: trace.oracle.violations.iter().map(format_violation).collect(),
            });
        }
    }

    info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign finished"
    );
    Ok(report)
}

/// Pass/fail for one seed.
///
/// # Errors
///
/// Returns an error when the simulation cannot run. The inner result
/// separates a pass from invariant violations.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let trace = replay_seed(seed, config)?;
    if trace.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(trace.oracle.violations))
    }
}

/// Run one seed with full detail for debugging.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    config.validate()?;

    let collected_config = config.sim_config_for_seed(seed, true);
    let mut result = Simulator::new(collected_config)?.run()?;
    let kept = Simulator::new(config.sim_config_for_seed(seed, false))?.run()?;

    let mut oracle_rng = DeterministicRng::new(seed).fork(ORACLE_SALT);
    let oracle = ConvergenceOracle::check_all(
        &mut result,
        Some(&kept.snapshots),
        collected_config.tree,
        &mut oracle_rng,
        config.commutativity_iterations,
    );

    Ok(DetailedTrace { result, oracle })
}

/// One-line description of a violation.
#[must_use]
pub fn format_violation(violation: &InvariantViolation) -> String {
    match violation {
        InvariantViolation::Convergence {
            replica_a,
            replica_b,
            only_in_a,
            only_in_b,
            state_differs,
        } => format!(
            "Convergence: replicas {replica_a} and {replica_b} diverge \
             (only_in_a={}, only_in_b={}, state_differs={state_differs})",
            only_in_a.len(),
            only_in_b.len()
        ),
        InvariantViolation::InvalidWeave { replica, reason } => {
            format!("InvalidWeave: replica {replica}: {reason}")
        }
        InvariantViolation::StuckOrphans { replica, pending } => {
            format!("StuckOrphans: replica {replica} still holds {pending} orphan atoms")
        }
        InvariantViolation::Idempotence {
            replica,
            added,
            time_before,
            time_after,
        } => format!(
            "Idempotence: re-delivery to replica {replica} added {added} atoms \
             (clock {time_before} -> {time_after})"
        ),
        InvariantViolation::Commutativity {
            permutation_index,
            expected_hash,
            actual_hash,
        } => format!(
            "Commutativity: permutation {permutation_index} produced {actual_hash}, \
             expected {expected_hash}"
        ),
        InvariantViolation::GcTransparency {
            replica,
            time_collected,
            time_kept,
            state_differs,
        } => format!(
            "GcTransparency: replica {replica} (clock {time_collected} vs {time_kept}, \
             state_differs={state_differs})"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn small(seeds: Range<u64>) -> CampaignConfig {
        CampaignConfig {
            seed_range: seeds,
            replica_count: 3,
            rounds: 12,
            ..CampaignConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(CampaignConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_seed_range_rejected() {
        assert!(small(5..5).validate().is_err());
    }

    #[test]
    fn zero_replicas_rejected() {
        let config = CampaignConfig {
            replica_count: 0,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn edit_rate_above_hundred_rejected() {
        let config = CampaignConfig {
            edit_rate_percent: 101,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sim_config_carries_seed_and_gc_switch() {
        let config = CampaignConfig::default();
        let sim = config.sim_config_for_seed(42, false);
        assert_eq!(sim.seed, 42);
        assert_eq!(sim.replica_count, config.replica_count);
        assert!(!sim.tree.garbage_collection);
        assert!(sim.tree.buffer_orphans);
    }

    #[test]
    fn reliable_seed_passes() {
        let config = CampaignConfig {
            fault: FaultConfig::reliable(),
            ..small(0..1)
        };
        let result = run_single_seed(0, &config).expect("sim should not error");
        assert!(result.is_ok(), "seed 0 should pass: {result:?}");
    }

    #[test]
    fn faulty_campaign_still_converges() {
        // Drops and partitions lose messages, but the final anti-entropy pass
        // delivers every authored atom.
        let config = CampaignConfig {
            fault: FaultConfig {
                max_delay_rounds: 3,
                drop_rate_percent: 20,
                duplicate_rate_percent: 15,
                reorder_rate_percent: 30,
                partition_rate_percent: 15,
            },
            ..small(0..20)
        };
        let report = run_campaign(&config).expect("campaign should not error");
        assert_eq!(report.seeds_run, 20);
        assert!(
            report.all_passed(),
            "campaign failed: {:?}",
            report.failures.first()
        );
        assert!(report.interesting_states_reached > 0);
        assert!(report.atoms_created > 0);
    }

    #[test]
    fn replay_is_deterministic() {
        let config = small(0..1);
        let a = replay_seed(7, &config).expect("replay 1");
        let b = replay_seed(7, &config).expect("replay 2");
        assert_eq!(a.result.trace, b.result.trace);
        assert_eq!(a.result.snapshots, b.result.snapshots);
        assert_eq!(a.oracle, b.oracle);
    }

    #[test]
    fn report_serializes_to_json() {
        let report = CampaignReport {
            seeds_run: 10,
            seeds_passed: 9,
            first_failure: Some(7),
            failures: vec![SeedFailure {
                seed: 7,
                violations: vec!["Convergence: replicas 0 and 1 diverge".into()],
            }],
            interesting_states_reached: 5,
            atoms_created: 120,
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"seeds_run\":10"));
        assert!(json.contains("\"first_failure\":7"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = parse_campaign_config(
            "rounds = 5\nseed_range = { start = 3, end = 9 }\n\n[fault]\ndrop_rate_percent = 0\n",
        )
        .expect("parse");
        assert_eq!(config.rounds, 5);
        assert_eq!(config.seed_range, 3..9);
        assert_eq!(config.fault.drop_rate_percent, 0);
        assert_eq!(config.fault.max_delay_rounds, FaultConfig::default().max_delay_rounds);
        assert_eq!(config.replica_count, CampaignConfig::default().replica_count);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = TempDir::new().expect("tempdir");
        let err = load_campaign_config(&dir.path().join("absent.toml")).expect_err("missing");
        assert!(format!("{err:#}").contains("absent.toml"));
    }

    #[test]
    fn load_reads_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("campaign.toml");
        fs::write(&path, "replica_count = 2\n").expect("write");
        assert_eq!(load_campaign_config(&path).expect("load").replica_count, 2);
    }

    #[test]
    fn violations_format_readably() {
        let text = format_violation(&InvariantViolation::Convergence {
            replica_a: 0,
            replica_b: 1,
            only_in_a: Vec::new(),
            only_in_b: Vec::new(),
            state_differs: true,
        });
        assert!(text.starts_with("Convergence"));
        assert!(text.contains("replicas 0 and 1"));
    }
}
