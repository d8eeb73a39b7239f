use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL standard transaction isolation levels supported by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Prevents dirty reads; non-repeatable reads and phantoms allowed.
    ReadCommitted,
    /// Prevents dirty and non-repeatable reads; phantoms allowed unless
    /// predicate or table locks are taken explicitly.
    RepeatableRead,
    /// Prevents all phenomena via commit-time validation.
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

impl IsolationLevel {
    /// True if the snapshot is re-taken at each statement rather than fixed
    /// at transaction start.
    pub fn snapshot_per_statement(self) -> bool {
        matches!(self, IsolationLevel::ReadCommitted)
    }

    pub fn prevents_non_repeatable_reads(self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }

    pub fn prevents_phantom_reads(self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }

    /// How long an implicit read lock is retained, per the policy table.
    pub fn read_lock_duration(self) -> LockDuration {
        match self {
            IsolationLevel::ReadCommitted => LockDuration::Statement,
            IsolationLevel::RepeatableRead => LockDuration::Commit,
            // Serializable reads go through the read-set instead of locks.
            IsolationLevel::Serializable => LockDuration::None,
        }
    }

    /// Serializable transactions track read/write sets and must pass
    /// commit-time validation; pessimistic levels resolve conflicts by
    /// blocking and always commit once their locks are held.
    pub fn validates_at_commit(self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }
}

/// Retention policy for an implicitly acquired lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDuration {
    /// No implicit lock is taken.
    None,
    /// Released when the statement that took it completes.
    Statement,
    /// Held until the transaction commits or aborts (strict 2PL).
    Commit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_table() {
        assert!(IsolationLevel::ReadCommitted.snapshot_per_statement());
        assert!(!IsolationLevel::RepeatableRead.snapshot_per_statement());
        assert!(!IsolationLevel::Serializable.snapshot_per_statement());

        assert!(!IsolationLevel::ReadCommitted.prevents_non_repeatable_reads());
        assert!(IsolationLevel::RepeatableRead.prevents_non_repeatable_reads());

        assert!(!IsolationLevel::RepeatableRead.prevents_phantom_reads());
        assert!(IsolationLevel::Serializable.prevents_phantom_reads());
    }

    #[test]
    fn test_read_lock_duration() {
        assert_eq!(
            IsolationLevel::ReadCommitted.read_lock_duration(),
            LockDuration::Statement
        );
        assert_eq!(
            IsolationLevel::RepeatableRead.read_lock_duration(),
            LockDuration::Commit
        );
        assert_eq!(
            IsolationLevel::Serializable.read_lock_duration(),
            LockDuration::None
        );
    }

    #[test]
    fn test_only_serializable_validates() {
        assert!(!IsolationLevel::ReadCommitted.validates_at_commit());
        assert!(!IsolationLevel::RepeatableRead.validates_at_commit());
        assert!(IsolationLevel::Serializable.validates_at_commit());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", IsolationLevel::ReadCommitted), "READ COMMITTED");
        assert_eq!(format!("{}", IsolationLevel::RepeatableRead), "REPEATABLE READ");
        assert_eq!(format!("{}", IsolationLevel::Serializable), "SERIALIZABLE");
    }
}
