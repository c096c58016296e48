//! Ancient and expired thresholds driven by consensus progress.
//!
//! A round is *ancient* when it is at or below `ancient_threshold`: events
//! from it are never buffered or released again. A round is *expired* when
//! it is at or below `expired_threshold`: persisted copies may be recycled.
//! Expired is always at or below ancient.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::event::{EventDescriptor, Round};

/// Errors from constructing or advancing an [`EventWindow`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("ancient threshold cannot move from {current} back to {proposed}")]
    Regression { current: Round, proposed: Round },

    #[error("expired threshold {expired} is above ancient threshold {ancient}")]
    ExpiredAboveAncient { expired: Round, ancient: Round },
}

impl WindowError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Regression { .. } => ErrorCode::WindowRegression,
            Self::ExpiredAboveAncient { .. } => ErrorCode::InvalidConfig,
        }
    }
}

/// Snapshot of the thresholds that decide whether an event still matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventWindow {
    latest_consensus_round: Round,
    ancient_threshold: Round,
    expired_threshold: Round,
}

impl EventWindow {
    /// Window before any round has reached consensus. Nothing is ancient.
    #[must_use]
    pub const fn genesis() -> Self {
        Self {
            latest_consensus_round: 0,
            ancient_threshold: 0,
            expired_threshold: 0,
        }
    }

    /// # Errors
    ///
    /// Returns [`WindowError::ExpiredAboveAncient`] if `expired_threshold`
    /// is above `ancient_threshold`.
    pub const fn new(
        latest_consensus_round: Round,
        ancient_threshold: Round,
        expired_threshold: Round,
    ) -> Result<Self, WindowError> {
        if expired_threshold > ancient_threshold {
            return Err(WindowError::ExpiredAboveAncient {
                expired: expired_threshold,
                ancient: ancient_threshold,
            });
        }
        Ok(Self {
            latest_consensus_round,
            ancient_threshold,
            expired_threshold,
        })
    }

    #[must_use]
    pub const fn latest_consensus_round(&self) -> Round {
        self.latest_consensus_round
    }

    #[must_use]
    pub const fn ancient_threshold(&self) -> Round {
        self.ancient_threshold
    }

    #[must_use]
    pub const fn expired_threshold(&self) -> Round {
        self.expired_threshold
    }

    /// Lowest round that is not ancient.
    #[must_use]
    pub const fn non_ancient_boundary(&self) -> Round {
        self.ancient_threshold.saturating_add(1)
    }

    #[must_use]
    pub const fn is_ancient(&self, round: Round) -> bool {
        round <= self.ancient_threshold
    }

    #[must_use]
    pub const fn is_ancient_descriptor(&self, descriptor: &EventDescriptor) -> bool {
        self.is_ancient(descriptor.birth_round)
    }

    #[must_use]
    pub const fn is_expired(&self, round: Round) -> bool {
        round <= self.expired_threshold
    }

    /// Check that `next` does not lower the ancient threshold.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::Regression`] if it does.
    pub const fn check_advance(&self, next: &Self) -> Result<(), WindowError> {
        if next.ancient_threshold < self.ancient_threshold {
            return Err(WindowError::Regression {
                current: self.ancient_threshold,
                proposed: next.ancient_threshold,
            });
        }
        Ok(())
    }
}

impl Default for EventWindow {
    fn default() -> Self {
        Self::genesis()
    }
}
