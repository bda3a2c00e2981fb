//! Session status state machine

/// Status of a session, observed by the scheduler to decide dispatch
///
/// Stored as an atomic word on the session; transitions follow the statement
/// and transaction lifecycle. `ExclusiveMode` is never stored: it is derived
/// when another session holds the database exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    /// No transaction has been started
    TransactionNotStart = 0,
    /// A transaction is open and not yet committed
    TransactionNotCommit = 1,
    /// A statement is currently executing
    StatementRunning = 2,
    /// The last statement finished
    StatementCompleted = 3,
    /// Blocked on a lock held elsewhere
    Waiting = 4,
    /// The commit log flush is in flight
    TransactionCommitting = 5,
    /// Retrying after a replication conflict; no result goes to the client
    Retrying = 6,
    /// Retrying after a replication conflict; the result must still be sent
    RetryingReturnResult = 7,
    /// Another session holds the database exclusively
    ExclusiveMode = 8,
}

impl SessionStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::TransactionNotStart,
            1 => SessionStatus::TransactionNotCommit,
            2 => SessionStatus::StatementRunning,
            3 => SessionStatus::StatementCompleted,
            4 => SessionStatus::Waiting,
            5 => SessionStatus::TransactionCommitting,
            6 => SessionStatus::Retrying,
            7 => SessionStatus::RetryingReturnResult,
            _ => SessionStatus::ExclusiveMode,
        }
    }

    /// Whether the scheduler may dispatch a session in this status
    pub fn is_dispatchable(self) -> bool {
        !matches!(
            self,
            SessionStatus::Waiting
                | SessionStatus::TransactionCommitting
                | SessionStatus::ExclusiveMode
                | SessionStatus::StatementRunning
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatchable_statuses() {
        assert!(SessionStatus::TransactionNotStart.is_dispatchable());
        assert!(SessionStatus::TransactionNotCommit.is_dispatchable());
        assert!(SessionStatus::StatementCompleted.is_dispatchable());
        assert!(SessionStatus::Retrying.is_dispatchable());
        assert!(SessionStatus::RetryingReturnResult.is_dispatchable());

        assert!(!SessionStatus::Waiting.is_dispatchable());
        assert!(!SessionStatus::TransactionCommitting.is_dispatchable());
        assert!(!SessionStatus::ExclusiveMode.is_dispatchable());
        assert!(!SessionStatus::StatementRunning.is_dispatchable());
    }

    #[test]
    fn test_from_u8_roundtrip() {
        for status in [
            SessionStatus::TransactionNotStart,
            SessionStatus::TransactionNotCommit,
            SessionStatus::StatementRunning,
            SessionStatus::StatementCompleted,
            SessionStatus::Waiting,
            SessionStatus::TransactionCommitting,
            SessionStatus::Retrying,
            SessionStatus::RetryingReturnResult,
            SessionStatus::ExclusiveMode,
        ] {
            assert_eq!(SessionStatus::from_u8(status as u8), status);
        }
    }
}
