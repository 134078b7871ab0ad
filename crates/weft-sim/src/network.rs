use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use weft_core::{Atom, AuxOp};

use crate::agent::ReplicaId;
use crate::rng::DeterministicRng;

/// Fault injection knobs for the simulated transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of sends lost in transit.
    pub drop_rate_percent: u8,
    /// Percentage of sends delivered twice.
    pub duplicate_rate_percent: u8,
    /// Percentage chance of shuffling the messages that become ready in a round.
    pub reorder_rate_percent: u8,
    /// Percentage chance per round to isolate or reconnect a random replica.
    pub partition_rate_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 5,
            duplicate_rate_percent: 3,
            reorder_rate_percent: 10,
            partition_rate_percent: 2,
        }
    }
}

impl FaultConfig {
    /// A transport that delivers everything exactly once, in send order.
    #[must_use]
    pub const fn reliable() -> Self {
        Self {
            max_delay_rounds: 0,
            drop_rate_percent: 0,
            duplicate_rate_percent: 0,
            reorder_rate_percent: 0,
            partition_rate_percent: 0,
        }
    }
}

/// A batch of atoms in flight between two replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: ReplicaId,
    pub to: ReplicaId,
    pub atoms: Vec<Atom<AuxOp>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InFlight {
    deliver_at_round: u64,
    message: Message,
}

/// What happened to one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub dropped: bool,
    pub duplicated: bool,
    pub delay_rounds: u8,
}

impl SendOutcome {
    const DROPPED: Self = Self {
        dropped: true,
        duplicated: false,
        delay_rounds: 0,
    };
}

/// Messages released in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverOutcome {
    pub delivered: Vec<Message>,
    pub reordered: bool,
}

/// Deterministic lossy network between replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNetwork {
    in_flight: Vec<InFlight>,
    isolated: BTreeSet<ReplicaId>,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            in_flight: Vec::new(),
            isolated: BTreeSet::new(),
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    pub fn set_partitioned(&mut self, replica: ReplicaId, isolated: bool) {
        if isolated {
            self.isolated.insert(replica);
        } else {
            self.isolated.remove(&replica);
        }
    }

    #[must_use]
    pub fn is_partitioned(&self, replica: ReplicaId) -> bool {
        self.isolated.contains(&replica)
    }

    /// Reconnect every isolated replica.
    pub fn heal(&mut self) {
        self.isolated.clear();
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Queue `message`, subject to partitions and injected faults.
    pub fn send(
        &mut self,
        message: Message,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> SendOutcome {
        if self.is_partitioned(message.from) || self.is_partitioned(message.to) {
            return SendOutcome::DROPPED;
        }
        if rng.percent(self.fault.drop_rate_percent) {
            return SendOutcome::DROPPED;
        }

        let bound = u64::from(self.fault.max_delay_rounds) + 1;
        let delay = u8::try_from(rng.below(bound)).unwrap_or(self.fault.max_delay_rounds);
        let deliver_at_round = round.saturating_add(u64::from(delay));

        let duplicated = rng.percent(self.fault.duplicate_rate_percent);
        if duplicated {
            self.in_flight.push(InFlight {
                deliver_at_round,
                message: message.clone(),
            });
        }
        self.in_flight.push(InFlight {
            deliver_at_round,
            message,
        });

        SendOutcome {
            dropped: false,
            duplicated,
            delay_rounds: delay,
        }
    }

    /// Release every message due at or before `round`.
    pub fn deliver_ready(&mut self, round: u64, rng: &mut DeterministicRng) -> DeliverOutcome {
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|m| m.deliver_at_round <= round);
        self.in_flight = waiting;

        let mut delivered: Vec<Message> = ready.into_iter().map(|m| m.message).collect();
        let reordered = delivered.len() > 1 && rng.percent(self.fault.reorder_rate_percent);
        if reordered {
            rng.shuffle(&mut delivered);
        }
        DeliverOutcome {
            delivered,
            reordered,
        }
    }

    /// Release everything still in flight, ignoring delays.
    pub fn drain(&mut self) -> Vec<Message> {
        self.in_flight.drain(..).map(|m| m.message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: ReplicaId, to: ReplicaId) -> Message {
        Message {
            from,
            to,
            atoms: Vec::new(),
        }
    }

    #[test]
    fn reliable_network_delivers_in_order_the_same_round() {
        let mut net = SimulatedNetwork::new(FaultConfig::reliable());
        let mut rng = DeterministicRng::new(0);
        for to in 1..4 {
            let outcome = net.send(message(0, to), 5, &mut rng);
            assert!(!outcome.dropped);
            assert_eq!(outcome.delay_rounds, 0);
        }
        let out = net.deliver_ready(5, &mut rng);
        assert!(!out.reordered);
        let targets: Vec<_> = out.delivered.iter().map(|m| m.to).collect();
        assert_eq!(targets, vec![1, 2, 3]);
        assert_eq!(net.in_flight_len(), 0);
    }

    #[test]
    fn partitioned_replica_neither_sends_nor_receives() {
        let mut net = SimulatedNetwork::new(FaultConfig::reliable());
        let mut rng = DeterministicRng::new(0);
        net.set_partitioned(2, true);
        assert!(net.send(message(2, 0), 0, &mut rng).dropped);
        assert!(net.send(message(0, 2), 0, &mut rng).dropped);
        assert!(!net.send(message(0, 1), 0, &mut rng).dropped);

        net.heal();
        assert!(!net.is_partitioned(2));
    }

    #[test]
    fn delayed_messages_wait_for_their_round() {
        let fault = FaultConfig {
            max_delay_rounds: 3,
            ..FaultConfig::reliable()
        };
        let mut net = SimulatedNetwork::new(fault);
        let mut rng = DeterministicRng::new(9);
        let mut latest = 0;
        for _ in 0..20 {
            let outcome = net.send(message(0, 1), 0, &mut rng);
            latest = latest.max(outcome.delay_rounds);
        }
        let mut delivered = 0;
        for round in 0..=u64::from(latest) {
            delivered += net.deliver_ready(round, &mut rng).delivered.len();
        }
        assert_eq!(delivered, 20);
    }

    #[test]
    fn duplicates_are_delivered_twice() {
        let fault = FaultConfig {
            duplicate_rate_percent: 100,
            ..FaultConfig::reliable()
        };
        let mut net = SimulatedNetwork::new(fault);
        let mut rng = DeterministicRng::new(1);
        assert!(net.send(message(0, 1), 0, &mut rng).duplicated);
        assert_eq!(net.drain().len(), 2);
    }

    #[test]
    fn dropped_messages_never_arrive() {
        let fault = FaultConfig {
            drop_rate_percent: 100,
            ..FaultConfig::reliable()
        };
        let mut net = SimulatedNetwork::new(fault);
        let mut rng = DeterministicRng::new(1);
        assert!(net.send(message(0, 1), 0, &mut rng).dropped);
        assert!(net.drain().is_empty());
    }
}
