use crate::audit::AuditEntry;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence for audit trails.
///
/// The runner forwards every entry an automaton appends, in sequence order. An
/// implementation must reject an entry whose `seq` does not continue the stored
/// trail for that session; the trail stays append-only across backends.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one entry and return its sequence number.
    async fn append(&self, session_id: Uuid, entry: &AuditEntry) -> Result<u64>;

    /// Entries with `seq >= from_seq`, in order.
    async fn read(&self, session_id: Uuid, from_seq: u64) -> Result<Vec<AuditEntry>>;

    /// Sessions with at least one stored entry.
    async fn sessions(&self) -> Result<Vec<Uuid>>;
}
