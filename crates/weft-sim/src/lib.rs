//! weft-sim: seeded multi-replica simulation of the weft causal tree.
//!
//! A [`Simulator`] drives N façade replicas through a scripted random
//! workload, ships each replica's authored atoms over a fault-injecting
//! [`network::SimulatedNetwork`], then runs a final anti-entropy pass so every
//! replica has seen every atom. The [`oracle`] checks the end states and the
//! [`campaign`] runner sweeps many seeds.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` for configuration and run failures;
//!   invariant breaches are data ([`oracle::InvariantViolation`]), not errors.
//! - **Logging**: `tracing` macros (`info!` per run, `debug!` per round).

pub mod agent;
pub mod campaign;
pub mod network;
pub mod oracle;
pub mod rng;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use weft_core::{Atom, AuxOp, TreeOptions};

use crate::agent::{ReplicaId, ReplicaSnapshot, ScriptedEdit, SimulatedReplica};
use crate::network::{FaultConfig, Message, SendOutcome, SimulatedNetwork};
use crate::rng::DeterministicRng;

pub use campaign::{CampaignConfig, CampaignReport, replay_seed, run_campaign};
pub use oracle::{ConvergenceOracle, InvariantViolation, OracleResult};

/// Parameters of one simulated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub replica_count: usize,
    pub rounds: u64,
    /// Peers each replica ships its new atoms to per round.
    pub fanout: usize,
    /// Chance per round that a replica performs an edit.
    pub edit_rate_percent: u8,
    pub fault: FaultConfig,
    pub tree: TreeOptions,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            replica_count: 3,
            rounds: 24,
            fanout: 2,
            edit_rate_percent: 70,
            fault: FaultConfig::default(),
            tree: TreeOptions::default(),
        }
    }
}

/// Something that happened during a run, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    Edit {
        replica: ReplicaId,
        edit: ScriptedEdit,
        atoms: usize,
    },
    Send {
        from: ReplicaId,
        to: ReplicaId,
        atoms: usize,
        outcome: SendOutcome,
    },
    Deliver {
        from: ReplicaId,
        to: ReplicaId,
        atoms: usize,
        added: usize,
        pending: usize,
    },
    Reorder {
        messages: usize,
    },
    Partition {
        replica: ReplicaId,
        isolated: bool,
    },
    /// Final anti-entropy transfer of everything `from` authored.
    Sync {
        from: ReplicaId,
        to: ReplicaId,
        added: usize,
    },
}

impl TraceEventKind {
    /// Whether this event exercised a fault path.
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        match self {
            Self::Send { outcome, .. } => outcome.dropped || outcome.duplicated,
            Self::Deliver { pending, .. } => *pending > 0,
            Self::Reorder { .. } | Self::Partition { .. } => true,
            Self::Edit { .. } | Self::Sync { .. } => false,
        }
    }
}

/// Output of [`Simulator::run`].
#[derive(Debug)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub snapshots: Vec<ReplicaSnapshot>,
    /// Every atom authored during the run, grouped by replica.
    pub authored: Vec<Atom<AuxOp>>,
    /// Live replicas, kept for checks that need to mutate them.
    pub replicas: Vec<SimulatedReplica>,
    /// At least one fault was injected or an orphan was buffered.
    pub interesting_state_reached: bool,
}

/// Deterministic driver for one seed.
pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    network: SimulatedNetwork,
    replicas: Vec<SimulatedReplica>,
    trace: Vec<TraceEvent>,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error when the config has no replicas or no rounds.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.replica_count == 0 {
            bail!("replica_count must be > 0");
        }
        if config.rounds == 0 {
            bail!("rounds must be > 0");
        }
        let replicas = (0..config.replica_count)
            .map(|id| SimulatedReplica::new(id, config.tree))
            .collect();
        Ok(Self {
            config,
            rng: DeterministicRng::new(config.seed),
            network: SimulatedNetwork::new(config.fault),
            replicas,
            trace: Vec::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> SimulationConfig {
        self.config
    }

    /// Run every round, drain the network and sync all replicas.
    ///
    /// # Errors
    ///
    /// Reserved for transport failures; the in-memory network cannot fail.
    pub fn run(mut self) -> Result<SimulationResult> {
        for round in 0..self.config.rounds {
            self.step(round);
        }
        self.settle();

        let interesting_state_reached = self.trace.iter().any(|e| e.kind.is_fault());
        let snapshots: Vec<ReplicaSnapshot> =
            self.replicas.iter_mut().map(SimulatedReplica::snapshot).collect();
        let authored = self
            .replicas
            .iter()
            .flat_map(|r| r.authored().iter().cloned())
            .collect::<Vec<_>>();

        info!(
            seed = self.config.seed,
            replicas = self.replicas.len(),
            atoms = authored.len(),
            trace_events = self.trace.len(),
            interesting = interesting_state_reached,
            "simulation finished"
        );

        Ok(SimulationResult {
            seed: self.config.seed,
            trace: self.trace,
            snapshots,
            authored,
            replicas: self.replicas,
            interesting_state_reached,
        })
    }

    fn step(&mut self, round: u64) {
        if self.replicas.len() > 1 && self.rng.percent(self.config.fault.partition_rate_percent) {
            let replica = self.rng.index(self.replicas.len());
            let isolated = !self.network.is_partitioned(replica);
            self.network.set_partitioned(replica, isolated);
            self.record(round, TraceEventKind::Partition { replica, isolated });
        }

        for id in 0..self.replicas.len() {
            if round == 0 && id == 0 {
                self.replicas[id].create_root();
                continue;
            }
            if self.rng.percent(self.config.edit_rate_percent) {
                let edit = ScriptedEdit::generate(&mut self.rng);
                let atoms = self.replicas[id].apply(&edit);
                self.record(round, TraceEventKind::Edit {
                    replica: id,
                    edit,
                    atoms,
                });
            }
        }

        for from in 0..self.replicas.len() {
            let fresh = self.replicas[from].take_unsent();
            if fresh.is_empty() {
                continue;
            }
            for to in self.pick_peers(from) {
                let atoms = fresh.len();
                let outcome = self.network.send(
                    Message {
                        from,
                        to,
                        atoms: fresh.clone(),
                    },
                    round,
                    &mut self.rng,
                );
                self.record(round, TraceEventKind::Send {
                    from,
                    to,
                    atoms,
                    outcome,
                });
            }
        }

        let outcome = self.network.deliver_ready(round, &mut self.rng);
        if outcome.reordered {
            self.record(round, TraceEventKind::Reorder {
                messages: outcome.delivered.len(),
            });
        }
        for message in outcome.delivered {
            self.deliver(round, message);
        }

        debug!(
            round,
            in_flight = self.network.in_flight_len(),
            "round complete"
        );
    }

    /// Heal partitions, flush the network, then give every replica every
    /// authored atom so convergence does not depend on lucky delivery.
    fn settle(&mut self) {
        let round = self.config.rounds;
        self.network.heal();
        for message in self.network.drain() {
            self.deliver(round, message);
        }

        let batches: Vec<Vec<Atom<AuxOp>>> = self
            .replicas
            .iter()
            .map(|r| r.authored().to_vec())
            .collect();
        let count = batches.len();
        for to in 0..count {
            // Each replica hears from its peers in a different order.
            for offset in 1..count {
                let from = (to + offset) % count;
                let added = self.replicas[to].receive(batches[from].clone());
                self.record(round, TraceEventKind::Sync { from, to, added });
            }
        }
    }

    fn deliver(&mut self, round: u64, message: Message) {
        let Message { from, to, atoms } = message;
        let count = atoms.len();
        let replica = &mut self.replicas[to];
        let added = replica.receive(atoms);
        let pending = replica.tree().weave().pending_len();
        self.record(round, TraceEventKind::Deliver {
            from,
            to,
            atoms: count,
            added,
            pending,
        });
    }

    fn pick_peers(&mut self, from: ReplicaId) -> Vec<ReplicaId> {
        let mut peers: Vec<ReplicaId> = (0..self.replicas.len()).filter(|&p| p != from).collect();
        self.rng.shuffle(&mut peers);
        peers.truncate(self.config.fanout);
        peers
    }

    fn record(&mut self, round: u64, kind: TraceEventKind) {
        self.trace.push(TraceEvent { round, kind });
    }
}
