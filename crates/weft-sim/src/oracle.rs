use std::collections::HashSet;

use weft_core::{Atom, AtomId, AuxCausalTree, AuxOp, SiteInfo, TreeOptions};

use crate::agent::{ReplicaId, ReplicaSnapshot, SimulatedReplica};
use crate::rng::DeterministicRng;

/// Site id of the throwaway observer replica used by the commutativity check.
const OBSERVER_SITE: u32 = u32::MAX;

/// Outcome of one or more invariant checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        self.passed &= other.passed;
        self.violations.extend(other.violations);
        self
    }
}

/// A broken invariant with enough context to start debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Two replicas hold different weaves or values after full delivery.
    Convergence {
        replica_a: ReplicaId,
        replica_b: ReplicaId,
        only_in_a: Vec<AtomId>,
        only_in_b: Vec<AtomId>,
        state_differs: bool,
    },
    /// The weave failed its structural check.
    InvalidWeave { replica: ReplicaId, reason: String },
    /// Atoms still waiting for a cause after every atom was delivered.
    StuckOrphans { replica: ReplicaId, pending: usize },
    /// Re-importing already delivered atoms changed something.
    Idempotence {
        replica: ReplicaId,
        added: usize,
        time_before: u64,
        time_after: u64,
    },
    /// A fresh replica fed the atoms in a shuffled order ended elsewhere.
    Commutativity {
        permutation_index: usize,
        expected_hash: String,
        actual_hash: String,
    },
    /// A garbage-collecting replica disagrees with its non-collecting twin.
    GcTransparency {
        replica: ReplicaId,
        time_collected: u64,
        time_kept: u64,
        state_differs: bool,
    },
}

/// Invariant checks over the end of a simulation run.
///
/// 1. **Convergence**: every replica holds the same weave and value.
/// 2. **Validity**: every weave passes its structural check with no orphans
///    left behind.
/// 3. **Idempotence**: re-delivering every atom is a no-op, clock included.
/// 4. **Commutativity**: any delivery order yields the same weave.
/// 5. **GC transparency**: collecting garbage never changes the value or
///    the clock.
pub struct ConvergenceOracle;

impl ConvergenceOracle {
    #[must_use]
    pub fn check_convergence(snapshots: &[ReplicaSnapshot]) -> OracleResult {
        let mut violations = Vec::new();
        for (i, a) in snapshots.iter().enumerate() {
            for b in &snapshots[i + 1..] {
                let state_differs = a.state != b.state;
                if a.version == b.version && !state_differs {
                    continue;
                }
                violations.push(InvariantViolation::Convergence {
                    replica_a: a.id,
                    replica_b: b.id,
                    only_in_a: missing_from(&a.atoms, &b.atoms),
                    only_in_b: missing_from(&b.atoms, &a.atoms),
                    state_differs,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_validity(snapshots: &[ReplicaSnapshot]) -> OracleResult {
        let mut violations = Vec::new();
        for snapshot in snapshots {
            if let Some(reason) = &snapshot.invalid {
                violations.push(InvariantViolation::InvalidWeave {
                    replica: snapshot.id,
                    reason: reason.clone(),
                });
            }
            if snapshot.pending > 0 {
                violations.push(InvariantViolation::StuckOrphans {
                    replica: snapshot.id,
                    pending: snapshot.pending,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Re-deliver `atoms` to every replica and require nothing to change.
    #[must_use]
    pub fn check_idempotence(
        replicas: &mut [SimulatedReplica],
        atoms: &[Atom<AuxOp>],
    ) -> OracleResult {
        let mut violations = Vec::new();
        for replica in replicas {
            let time_before = replica.tree().time();
            let version_before = replica.tree().version();
            let added = replica.receive(atoms.to_vec());
            let time_after = replica.tree().time();
            if added > 0 || time_after != time_before || replica.tree().version() != version_before
            {
                violations.push(InvariantViolation::Idempotence {
                    replica: replica.id(),
                    added,
                    time_before,
                    time_after,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Feed `atoms` to fresh replicas in `iterations` shuffled orders and
    /// compare each against `reference`.
    #[must_use]
    pub fn check_commutativity(
        reference: &ReplicaSnapshot,
        atoms: &[Atom<AuxOp>],
        options: TreeOptions,
        rng: &mut DeterministicRng,
        iterations: usize,
    ) -> OracleResult {
        let mut violations = Vec::new();
        for permutation_index in 0..iterations {
            let mut shuffled = atoms.to_vec();
            rng.shuffle(&mut shuffled);

            let mut observer = AuxCausalTree::new(SiteInfo::new(OBSERVER_SITE), options);
            // One atom per import so the shuffle also reorders orphan handling.
            for atom in shuffled {
                observer.import([atom]);
            }

            let actual = observer.version();
            if actual != reference.version || observer.state() != &reference.state {
                violations.push(InvariantViolation::Commutativity {
                    permutation_index,
                    expected_hash: reference.version.hash.clone(),
                    actual_hash: actual.hash,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Pairwise compare replicas of a collecting run with the same replicas of
    /// a non-collecting run of the same seed.
    #[must_use]
    pub fn check_gc_transparency(
        collected: &[ReplicaSnapshot],
        kept: &[ReplicaSnapshot],
    ) -> OracleResult {
        let violations = collected
            .iter()
            .zip(kept)
            .filter_map(|(with_gc, without_gc)| {
                let state_differs = with_gc.state != without_gc.state;
                (state_differs || with_gc.time != without_gc.time).then(|| {
                    InvariantViolation::GcTransparency {
                        replica: with_gc.id,
                        time_collected: with_gc.time,
                        time_kept: without_gc.time,
                        state_differs,
                    }
                })
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    /// Run every check that applies to one run. `kept` is the same seed run
    /// without garbage collection, when available.
    #[must_use]
    pub fn check_all(
        result: &mut crate::SimulationResult,
        kept: Option<&[ReplicaSnapshot]>,
        options: TreeOptions,
        rng: &mut DeterministicRng,
        iterations: usize,
    ) -> OracleResult {
        let convergence = Self::check_convergence(&result.snapshots);
        let validity = Self::check_validity(&result.snapshots);
        let commutativity = result.snapshots.first().map_or_else(OracleResult::pass, |first| {
            Self::check_commutativity(first, &result.authored, options, rng, iterations)
        });
        let idempotence = Self::check_idempotence(&mut result.replicas, &result.authored);
        let transparency = kept.map_or_else(OracleResult::pass, |kept| {
            Self::check_gc_transparency(&result.snapshots, kept)
        });

        convergence
            .merge(validity)
            .merge(commutativity)
            .merge(idempotence)
            .merge(transparency)
    }
}

/// Ids present in `ours` but not in `theirs`, sorted by site then time.
fn missing_from(ours: &[Atom<AuxOp>], theirs: &[Atom<AuxOp>]) -> Vec<AtomId> {
    let known: HashSet<AtomId> = theirs.iter().map(|atom| atom.id).collect();
    let mut ids: Vec<AtomId> = ours
        .iter()
        .map(|atom| atom.id)
        .filter(|id| !known.contains(id))
        .collect();
    ids.sort_by_key(|id| (id.site, id.timestamp));
    ids
}
