use std::fmt;

/// Progress of a single transfer through the orchestrator.
///
/// Success: `Received → Validated → Locked → Applied → Committed`.
/// Insufficient funds: `… → Locked → InsufficientFunds → Failed → Committed`.
/// Any state may end in `Aborted` on an infrastructure error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Received,
    Validated,
    Locked,
    Applied,
    InsufficientFunds,
    Failed,
    Committed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Committed | TransferState::Aborted)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (_, Aborted) => !self.is_terminal(),
            (Received, Validated)
            | (Validated, Locked)
            | (Locked, Applied)
            | (Locked, InsufficientFunds)
            | (InsufficientFunds, Failed)
            | (Applied, Committed)
            | (Failed, Committed) => true,
            // Idempotent replay commits straight after the lookup.
            (Validated, Committed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Received => "received",
            TransferState::Validated => "validated",
            TransferState::Locked => "locked",
            TransferState::Applied => "applied",
            TransferState::InsufficientFunds => "insufficient_funds",
            TransferState::Failed => "failed",
            TransferState::Committed => "committed",
            TransferState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransferState::*;

    #[test]
    fn success_path_is_legal() {
        let path = [Received, Validated, Locked, Applied, Committed];
        assert!(path.windows(2).all(|w| w[0].can_advance_to(w[1])));
    }

    #[test]
    fn insufficient_funds_path_is_legal() {
        let path = [Received, Validated, Locked, InsufficientFunds, Failed, Committed];
        assert!(path.windows(2).all(|w| w[0].can_advance_to(w[1])));
    }

    #[test]
    fn cannot_skip_locking_or_leave_terminal_states() {
        assert!(!Validated.can_advance_to(Applied));
        assert!(!Committed.can_advance_to(Aborted));
        assert!(!Aborted.can_advance_to(Committed));
        assert!(Locked.can_advance_to(Aborted));
    }
}
