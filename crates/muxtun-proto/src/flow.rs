//! Logical-connection phase tracking
//!
//! One explicit phase value per logical connection replaces the chains of
//! forwarding listeners the protocol grew out of. The transition table is
//! deliberately small: a flow only ever moves forward.

use crate::ProtoError;

/// Lifecycle phase of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// NEW received, destination connector still connecting (relay only).
    Opening,
    /// Data may flow.
    Open,
    /// Terminated gracefully.
    Closed,
    /// Terminated with an error.
    Failed,
}

impl Phase {
    /// Whether moving to `next` is allowed from this phase.
    pub fn allows(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Opening, Phase::Open)
                | (Phase::Opening, Phase::Closed)
                | (Phase::Opening, Phase::Failed)
                | (Phase::Open, Phase::Closed)
                | (Phase::Open, Phase::Failed)
        )
    }

    /// Move to `next`, rejecting transitions outside the table.
    pub fn transition(self, next: Phase) -> Result<Phase, ProtoError> {
        if self.allows(next) {
            Ok(next)
        } else {
            Err(ProtoError::BadTransition(self, next))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert_eq!(
            Phase::Opening.transition(Phase::Open).unwrap(),
            Phase::Open
        );
        assert_eq!(
            Phase::Open.transition(Phase::Closed).unwrap(),
            Phase::Closed
        );
        assert_eq!(
            Phase::Open.transition(Phase::Failed).unwrap(),
            Phase::Failed
        );
        assert_eq!(
            Phase::Opening.transition(Phase::Failed).unwrap(),
            Phase::Failed
        );
    }

    #[test]
    fn test_terminal_phases_reject_everything() {
        for terminal in [Phase::Closed, Phase::Failed] {
            assert!(terminal.is_terminal());
            for next in [Phase::Opening, Phase::Open, Phase::Closed, Phase::Failed] {
                assert!(terminal.transition(next).is_err());
            }
        }
    }

    #[test]
    fn test_no_reopening() {
        assert!(!Phase::Open.allows(Phase::Opening));
        assert!(!Phase::Closed.allows(Phase::Open));
    }
}
