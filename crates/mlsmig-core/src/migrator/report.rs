//! Per-pass attempt records.

use crate::error::ConversationFailure;
use crate::model::{ConversationId, Protocol};

/// Result of advancing one conversation by one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The backend moved the conversation to the target protocol.
    Transitioned,
    /// The conversation already was on the target protocol.
    AlreadyAtTarget,
    /// The attempt failed; the pass carried on with the next conversation.
    Failed(ConversationFailure),
}

/// One conversation's attempt within a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationAttempt {
    /// Conversation that was attempted.
    pub conversation_id: ConversationId,
    /// What happened.
    pub outcome: AttemptOutcome,
}

/// Outcome of one migrate or finalise pass over a team's conversations.
///
/// A pass with failed attempts is still a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Protocol every attempt in this pass targeted.
    pub target: Protocol,
    /// Attempts, in listing order.
    pub attempts: Vec<ConversationAttempt>,
    /// Whether the pass stopped early because of cancellation.
    pub cancelled: bool,
}

impl PassReport {
    /// Creates an empty report for `target`.
    #[must_use]
    pub const fn new(target: Protocol) -> Self {
        Self {
            target,
            attempts: Vec::new(),
            cancelled: false,
        }
    }

    pub(crate) fn record(&mut self, conversation_id: ConversationId, outcome: AttemptOutcome) {
        self.attempts.push(ConversationAttempt {
            conversation_id,
            outcome,
        });
    }

    /// Number of conversations that changed protocol.
    #[must_use]
    pub fn transitioned(&self) -> usize {
        self.count(|outcome| matches!(outcome, AttemptOutcome::Transitioned))
    }

    /// Number of conversations already on the target protocol.
    #[must_use]
    pub fn already_at_target(&self) -> usize {
        self.count(|outcome| matches!(outcome, AttemptOutcome::AlreadyAtTarget))
    }

    /// Failed attempts.
    pub fn failures(&self) -> impl Iterator<Item = &ConversationFailure> {
        self.attempts.iter().filter_map(|attempt| match &attempt.outcome {
            AttemptOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    /// Returns the outcome recorded for `id`.
    #[must_use]
    pub fn outcome_of(&self, id: &ConversationId) -> Option<&AttemptOutcome> {
        self.attempts
            .iter()
            .find(|attempt| &attempt.conversation_id == id)
            .map(|attempt| &attempt.outcome)
    }

    fn count(&self, predicate: impl Fn(&AttemptOutcome) -> bool) -> usize {
        self.attempts
            .iter()
            .filter(|attempt| predicate(&attempt.outcome))
            .count()
    }
}
