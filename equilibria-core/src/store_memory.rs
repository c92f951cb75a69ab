use crate::audit::AuditEntry;
use crate::store::AuditStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// In-memory AuditStore for tests and the harness.
#[derive(Default)]
pub struct MemoryAuditStore {
    inner: RwLock<HashMap<Uuid, Vec<AuditEntry>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, session_id: Uuid, entry: &AuditEntry) -> Result<u64> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let trail = store.entry(session_id).or_default();

        let expected = trail.len() as u64;
        if entry.seq != expected {
            return Err(anyhow!(
                "audit entry for session {} out of order: expected seq {}, got {}",
                session_id,
                expected,
                entry.seq
            ));
        }

        trail.push(entry.clone());
        Ok(expected)
    }

    async fn read(&self, session_id: Uuid, from_seq: u64) -> Result<Vec<AuditEntry>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store
            .get(&session_id)
            .map(|trail| {
                trail
                    .iter()
                    .filter(|e| e.seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn sessions(&self) -> Result<Vec<Uuid>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut ids: Vec<Uuid> = store
            .iter()
            .filter(|(_, trail)| !trail.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
