use serde::{Deserialize, Serialize};

use crate::rng::DeterministicRng;

/// Fault injection configuration for simulated gossip delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum delivery delay in steps.
    pub max_delay_steps: u8,
    /// Percentage of sends delivered twice.
    pub duplicate_rate_percent: u8,
    /// Percentage chance of shuffling the messages ready at a step.
    pub reorder_rate_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_steps: 8,
            duplicate_rate_percent: 5,
            reorder_rate_percent: 20,
        }
    }
}

/// One event in flight, by index into the generated graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub event: usize,
    /// Second copy produced by a duplicating fault.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingMessage {
    deliver_at: u64,
    message: GossipMessage,
}

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// Message was duplicated.
    pub duplicated: bool,
    /// Delay assigned for primary enqueue.
    pub delay_steps: u8,
}

/// Result of delivering all ready messages for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverOutcome {
    /// Messages delivered this step.
    pub delivered: Vec<GossipMessage>,
    /// Whether delivery order was shuffled.
    pub reordered: bool,
}

/// Deterministic fault-injecting gossip model. Nothing is ever lost: the
/// intake path must cope with late, early and repeated events, not missing
/// ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNetwork {
    pending: Vec<PendingMessage>,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            pending: Vec::new(),
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Number of queued in-flight messages.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Send event `event` at `step` with fault injection.
    pub fn send(&mut self, event: usize, step: u64, rng: &mut DeterministicRng) -> SendOutcome {
        let delay_bound = u64::from(self.fault.max_delay_steps).saturating_add(1);
        let delay = u8::try_from(rng.next_bounded(delay_bound)).unwrap_or(self.fault.max_delay_steps);
        self.pending.push(PendingMessage {
            deliver_at: step.saturating_add(u64::from(delay)),
            message: GossipMessage {
                event,
                duplicate: false,
            },
        });

        let duplicated = rng.hit_rate_percent(self.fault.duplicate_rate_percent);
        if duplicated {
            let extra = rng.next_bounded(delay_bound);
            self.pending.push(PendingMessage {
                deliver_at: step.saturating_add(extra),
                message: GossipMessage {
                    event,
                    duplicate: true,
                },
            });
        }

        SendOutcome {
            duplicated,
            delay_steps: delay,
        }
    }

    /// Deliver all messages whose delivery step has arrived.
    pub fn deliver_ready(&mut self, step: u64, rng: &mut DeterministicRng) -> DeliverOutcome {
        let (mut ready, future): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|pending| pending.deliver_at <= step);
        self.pending = future;
        ready.sort_by_key(|pending| pending.deliver_at);

        let mut delivered: Vec<GossipMessage> = ready.into_iter().map(|p| p.message).collect();
        let reordered =
            delivered.len() > 1 && rng.hit_rate_percent(self.fault.reorder_rate_percent);
        if reordered {
            rng.shuffle(&mut delivered);
        }

        DeliverOutcome {
            delivered,
            reordered,
        }
    }

    /// Send `count` events, one per step, and return the order they arrive
    /// in, including duplicates.
    pub fn schedule(&mut self, count: usize, rng: &mut DeterministicRng) -> Vec<GossipMessage> {
        let mut arrivals = Vec::with_capacity(count);
        let mut step = 0u64;
        for event in 0..count {
            let _ = self.send(event, step, rng);
            arrivals.extend(self.deliver_ready(step, rng).delivered);
            step += 1;
        }
        while self.pending_len() > 0 {
            arrivals.extend(self.deliver_ready(step, rng).delivered);
            step += 1;
        }
        arrivals
    }
}
