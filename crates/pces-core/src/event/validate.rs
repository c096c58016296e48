use std::collections::HashSet;

use super::{GossipEvent, NodeId, ROUND_FIRST, Round};
use crate::error::ErrorCode;

/// Reasons an event is rejected before it reaches the orphan buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("transaction {index} is empty")]
    EmptyTransaction { index: usize },

    #[error("transactions total {total} bytes, limit is {max}")]
    TransactionBytesExceeded { total: usize, max: usize },

    #[error("more than one parent from creator {0}")]
    DuplicateParentCreator(NodeId),

    #[error("birth round {birth_round} is below parent birth round {parent_round}")]
    BirthRoundBelowParent { birth_round: Round, parent_round: Round },

    #[error("birth round {0} precedes the first round")]
    UndefinedBirthRound(Round),
}

impl ValidationError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InvalidEvent
    }
}

/// Structural checks that need nothing but the event itself.
#[derive(Debug, Clone, Copy)]
pub struct EventValidator {
    max_transaction_bytes: usize,
}

impl EventValidator {
    #[must_use]
    pub const fn new(max_transaction_bytes: usize) -> Self {
        Self {
            max_transaction_bytes,
        }
    }

    /// Check `event`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self, event: &GossipEvent) -> Result<(), ValidationError> {
        if event.birth_round() < ROUND_FIRST {
            return Err(ValidationError::UndefinedBirthRound(event.birth_round()));
        }

        if let Some(index) = event.transactions.iter().position(Vec::is_empty) {
            return Err(ValidationError::EmptyTransaction { index });
        }

        let total = event.transaction_bytes();
        if total > self.max_transaction_bytes {
            return Err(ValidationError::TransactionBytesExceeded {
                total,
                max: self.max_transaction_bytes,
            });
        }

        let mut creators = HashSet::with_capacity(event.parents.len());
        for parent in &event.parents {
            if !creators.insert(parent.creator) {
                return Err(ValidationError::DuplicateParentCreator(parent.creator));
            }
            if parent.birth_round > event.birth_round() {
                return Err(ValidationError::BirthRoundBelowParent {
                    birth_round: event.birth_round(),
                    parent_round: parent.birth_round,
                });
            }
        }

        Ok(())
    }
}
