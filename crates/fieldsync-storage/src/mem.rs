use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use fieldsync_types::{AuditEvent, FieldsyncError, NodeConfig};

use crate::traits::{AuditLog, ConfigStorage};

// ---------------------------------------------------------------------------
// MemConfigStorage
// ---------------------------------------------------------------------------

/// In-memory `ConfigStorage`.
///
/// Intended for unit tests; not persisted across restarts. Clones share the
/// same record, which lets a test "reboot" an agent on the same storage.
#[derive(Clone)]
pub struct MemConfigStorage {
    record: Arc<RwLock<Option<NodeConfig>>>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

impl MemConfigStorage {
    pub fn new() -> Self {
        MemConfigStorage {
            record: Arc::new(RwLock::new(None)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Storage that already holds `config`, as after a previous boot.
    pub fn with_record(config: NodeConfig) -> Self {
        MemConfigStorage { record: Arc::new(RwLock::new(Some(config))), ..Self::new() }
    }

    /// Make every following `persist` fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `persist` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Default for MemConfigStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStorage for MemConfigStorage {
    async fn load(&self) -> Result<Option<NodeConfig>, FieldsyncError> {
        Ok(self.record.read().await.clone())
    }

    async fn persist(&self, config: &NodeConfig) -> Result<(), FieldsyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FieldsyncError::Storage("injected write failure".into()));
        }
        *self.record.write().await = Some(config.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemAuditLog
// ---------------------------------------------------------------------------

/// In-memory `AuditLog` backed by a `Vec`; the index is the sequence number.
#[derive(Clone, Default)]
pub struct MemAuditLog {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record so far.
    pub async fn entries(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

impl AuditLog for MemAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<u64, FieldsyncError> {
        let mut g = self.events.write().await;
        g.push(event);
        Ok(g.len() as u64 - 1)
    }

    async fn read(&self, from: u64, limit: usize) -> Result<Vec<(u64, AuditEvent)>, FieldsyncError> {
        let g = self.events.read().await;
        let take = if limit == 0 { usize::MAX } else { limit };
        Ok(g.iter()
            .enumerate()
            .skip(from as usize)
            .take(take)
            .map(|(i, e)| (i as u64, e.clone()))
            .collect())
    }
}
