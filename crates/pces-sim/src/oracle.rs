use std::collections::HashSet;
use std::fmt;

use pces_core::event::{EventHash, PlatformEvent, Round};

// ── Core result types ─────────────────────────────────────────────────────────

/// An event released by intake, with the ancient threshold in force at the
/// moment of release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub event: PlatformEvent,
    pub ancient_threshold: Round,
}

/// Oracle result for an invariant check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

/// Which ordered stream a sequence check compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Events delivered by startup replay.
    Replay,
    /// Events read back from the log directory.
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A child was released before one of its non-ancient parents.
    ParentAfterChild {
        session: usize,
        child: EventHash,
        parent: EventHash,
    },
    /// The same event was released twice by live intake.
    DoubleRelease { hash: EventHash },
    /// An event was released although it was ancient at the time.
    AncientReleased {
        hash: EventHash,
        birth_round: Round,
        ancient_threshold: Round,
    },
    /// A non-ancient event was delivered but never released.
    MissingRelease { hash: EventHash, birth_round: Round },
    /// An ordered stream differs from what live intake released.
    SequenceDivergence {
        stream: Stream,
        index: usize,
        expected: Option<EventHash>,
        found: Option<EventHash>,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParentAfterChild {
                session,
                child,
                parent,
            } => write!(
                f,
                "ParentAfterChild: session {session} released {} before its parent {}",
                child.short(),
                parent.short()
            ),
            Self::DoubleRelease { hash } => {
                write!(f, "DoubleRelease: {} released twice", hash.short())
            }
            Self::AncientReleased {
                hash,
                birth_round,
                ancient_threshold,
            } => write!(
                f,
                "AncientReleased: {} (round {birth_round}) released at threshold {ancient_threshold}",
                hash.short()
            ),
            Self::MissingRelease { hash, birth_round } => write!(
                f,
                "MissingRelease: {} (round {birth_round}) never released",
                hash.short()
            ),
            Self::SequenceDivergence {
                stream,
                index,
                expected,
                found,
            } => write!(
                f,
                "SequenceDivergence: {stream:?} differs at {index} (expected={}, found={})",
                short(expected.as_ref()),
                short(found.as_ref())
            ),
        }
    }
}

fn short(hash: Option<&EventHash>) -> String {
    hash.map_or_else(|| "none".to_string(), EventHash::short)
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Checks the guarantees intake and the log make to consensus.
///
/// # Invariants checked
///
/// 1. **Causal order** (`check_causal_order`): within one process lifetime,
///    every parent is released before its child unless it is ancient.
/// 2. **At most once** (`check_at_most_once`): live intake never releases
///    an event twice, across restarts included.
/// 3. **Never ancient** (`check_never_ancient`): nothing ancient is
///    released.
/// 4. **Completeness** (`check_complete`): every delivered event that is
///    not ancient under the final window was released.
/// 5. **Sequence equality** (`check_sequence`): replay and the on-disk log
///    reproduce the live release order.
pub struct IntakeOracle;

impl IntakeOracle {
    #[must_use]
    pub fn check_causal_order(session: usize, releases: &[Release]) -> OracleResult {
        let mut released: HashSet<EventHash> = HashSet::with_capacity(releases.len());
        let mut violations = Vec::new();
        for release in releases {
            for parent in release.event.parents() {
                let satisfied = released.contains(&parent.hash)
                    || parent.birth_round <= release.ancient_threshold;
                if !satisfied {
                    violations.push(InvariantViolation::ParentAfterChild {
                        session,
                        child: release.event.hash(),
                        parent: parent.hash,
                    });
                }
            }
            released.insert(release.event.hash());
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_at_most_once(releases: &[Release]) -> OracleResult {
        let mut seen = HashSet::with_capacity(releases.len());
        let violations = releases
            .iter()
            .filter(|release| !seen.insert(release.event.hash()))
            .map(|release| InvariantViolation::DoubleRelease {
                hash: release.event.hash(),
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_never_ancient(releases: &[Release]) -> OracleResult {
        let violations = releases
            .iter()
            .filter(|release| release.event.birth_round() <= release.ancient_threshold)
            .map(|release| InvariantViolation::AncientReleased {
                hash: release.event.hash(),
                birth_round: release.event.birth_round(),
                ancient_threshold: release.ancient_threshold,
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_complete(
        graph: &[PlatformEvent],
        releases: &[Release],
        final_threshold: Round,
    ) -> OracleResult {
        let released: HashSet<EventHash> =
            releases.iter().map(|release| release.event.hash()).collect();
        let violations = graph
            .iter()
            .filter(|event| event.birth_round() > final_threshold)
            .filter(|event| !released.contains(&event.hash()))
            .map(|event| InvariantViolation::MissingRelease {
                hash: event.hash(),
                birth_round: event.birth_round(),
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    /// Compare two ordered hash streams. Reports the first divergence only;
    /// everything after it is usually noise.
    #[must_use]
    pub fn check_sequence(stream: Stream, expected: &[EventHash], found: &[EventHash]) -> OracleResult {
        let len = expected.len().max(found.len());
        let divergence = (0..len).find(|&i| expected.get(i) != found.get(i));
        let violations = divergence
            .map(|index| InvariantViolation::SequenceDivergence {
                stream,
                index,
                expected: expected.get(index).copied(),
                found: found.get(index).copied(),
            })
            .into_iter()
            .collect();
        OracleResult::from_violations(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{GraphConfig, generate};
    use crate::rng::DeterministicRng;

    fn graph() -> Vec<PlatformEvent> {
        let config = GraphConfig {
            events: 30,
            ..GraphConfig::default()
        };
        generate(&config, &mut DeterministicRng::new(2))
    }

    fn releases(events: &[PlatformEvent], threshold: Round) -> Vec<Release> {
        events
            .iter()
            .map(|event| Release {
                event: event.clone(),
                ancient_threshold: threshold,
            })
            .collect()
    }

    #[test]
    fn creation_order_passes_every_check() {
        let events = graph();
        let releases = releases(&events, 0);
        assert!(IntakeOracle::check_causal_order(0, &releases).passed);
        assert!(IntakeOracle::check_at_most_once(&releases).passed);
        assert!(IntakeOracle::check_never_ancient(&releases).passed);
        assert!(IntakeOracle::check_complete(&events, &releases, 0).passed);
    }

    #[test]
    fn reversed_order_breaks_causality() {
        let mut events = graph();
        events.reverse();
        let result = IntakeOracle::check_causal_order(0, &releases(&events, 0));
        assert!(!result.passed);
        assert!(matches!(
            result.violations[0],
            InvariantViolation::ParentAfterChild { .. }
        ));
    }

    #[test]
    fn duplicates_and_gaps_are_reported() {
        let events = graph();
        let mut doubled = releases(&events[..10], 0);
        doubled.push(doubled[3].clone());
        let result = IntakeOracle::check_at_most_once(&doubled)
            .merge(IntakeOracle::check_complete(&events, &doubled, 0));
        assert!(!result.passed);
        assert!(result
            .violations
            .iter()
            .any(|v| matches!(v, InvariantViolation::DoubleRelease { .. })));
        assert_eq!(
            result
                .violations
                .iter()
                .filter(|v| matches!(v, InvariantViolation::MissingRelease { .. }))
                .count(),
            events.len() - 10
        );
    }

    #[test]
    fn sequence_reports_first_divergence() {
        let events = graph();
        let expected: Vec<_> = events.iter().map(PlatformEvent::hash).collect();
        let found = &expected[..expected.len() - 1];
        let result = IntakeOracle::check_sequence(Stream::Log, &expected, found);
        assert_eq!(result.violations.len(), 1);
        let text = result.violations[0].to_string();
        assert!(text.starts_with("SequenceDivergence: Log differs at 29"));
    }
}
