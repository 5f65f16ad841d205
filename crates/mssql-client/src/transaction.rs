//! Explicit transactions.
//!
//! Opening a transaction is a plain batch; the server answers with a BEGIN
//! TRANSACTION ENVCHANGE whose 8-byte descriptor every later request must
//! carry in its ALL_HEADERS block. COMMIT and ROLLBACK clear it again.

/// Isolation level for [`Client::begin_transaction`](crate::Client::begin_transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Server default.
    #[default]
    ReadCommitted,
    /// Rows read stay unchanged until the transaction ends.
    RepeatableRead,
    /// Full isolation.
    Serializable,
    /// Row versioning; must be enabled on the database.
    Snapshot,
}

impl IsolationLevel {
    /// Level name as written after `SET TRANSACTION ISOLATION LEVEL`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn begin_batch(level: IsolationLevel) -> String {
    format!("SET TRANSACTION ISOLATION LEVEL {level}; BEGIN TRANSACTION")
}

// No-ops when the server already ended the transaction.
pub(crate) const COMMIT: &str = "IF @@TRANCOUNT > 0 COMMIT TRANSACTION";
pub(crate) const ROLLBACK: &str = "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION";
