//! Query archive
//!
//! Every finished run is kept with its final state snapshot so it can be
//! inspected later. The snapshot hash detects tampering with archived state.

use crate::config::DEFAULT_ARCHIVE_CAPACITY;
use crate::models::QueryResponse;
use crate::state::ExecutionState;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub audit_id: Uuid,
    pub query: String,
    pub state: Arc<ExecutionState>,
    pub response: Arc<QueryResponse>,
    pub state_hash: String,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

impl QueryRecord {
    pub fn new(state: ExecutionState, response: QueryResponse, execution_time_ms: u64) -> Self {
        let state_hash = compute_state_hash(&state);
        Self {
            audit_id: Uuid::new_v4(),
            query: state.query().to_string(),
            state: Arc::new(state),
            response: Arc::new(response),
            state_hash,
            created_at: Utc::now(),
            execution_time_ms,
        }
    }
}

/// In-memory archive of finished runs, bounded to `capacity` records
pub struct QueryArchive {
    records: Arc<RwLock<HashMap<Uuid, QueryRecord>>>,
    capacity: usize,
}

impl QueryArchive {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ARCHIVE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a record, evicting the oldest ones once the archive is full
    pub async fn record(&self, record: QueryRecord) -> Result<Uuid> {
        let audit_id = record.audit_id;
        let mut records = self.records.write().await;
        records.insert(audit_id, record);

        while records.len() > self.capacity {
            let oldest = records
                .values()
                .min_by_key(|r| r.created_at)
                .map(|r| r.audit_id);
            match oldest {
                Some(id) => {
                    records.remove(&id);
                    debug!(audit_id = %id, "Evicted oldest archived query");
                }
                None => break,
            }
        }

        Ok(audit_id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, audit_id: Uuid) -> Result<Option<QueryRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&audit_id).cloned())
    }

    /// All audit IDs, oldest first
    pub async fn list(&self) -> Result<Vec<Uuid>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .iter()
            .map(|(id, record)| (*id, record.created_at))
            .collect();
        items.sort_by_key(|(_, created_at)| *created_at);

        Ok(items.into_iter().map(|(id, _)| id).collect())
    }

    /// Recompute the snapshot hash and compare it with the stored one
    pub async fn verify_integrity(&self, audit_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;

        Ok(records
            .get(&audit_id)
            .map(|record| compute_state_hash(&record.state) == record.state_hash)
            .unwrap_or(false))
    }
}

impl Default for QueryArchive {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA256 of the serialized state, streamed straight into the hasher
pub fn compute_state_hash(state: &ExecutionState) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), state).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
