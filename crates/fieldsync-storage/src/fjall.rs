use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fieldsync_types::{AuditEvent, ConfigKey, ConfigValue, FieldsyncError, NodeConfig};

use crate::keys::{audit_key, parse_value_key, value_key, LAST_APPLIED_KEY, VALUE_PREFIX};
use crate::traits::{AuditLog, ConfigStorage};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, FieldsyncError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| FieldsyncError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, FieldsyncError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| FieldsyncError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> FieldsyncError {
    FieldsyncError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> FieldsyncError {
    FieldsyncError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore — shared handle wrapping both keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// Both keyspaces live in one fjall `Database` so a config write batch and
/// the durability flush that follows it cover the same journal.
pub struct FjallStore {
    pub db: fjall::Database,
    /// Applied configuration: `value/<key>` → bincode(ConfigValue),
    /// `meta/last_applied_patch_id` → bincode(u64)
    pub config: fjall::Keyspace,
    /// Audit records: `seq(8)` → bincode(AuditEvent)
    pub audit: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, FieldsyncError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let config =
            db.keyspace("config", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let audit =
            db.keyspace("audit", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, config, audit }))
    }
}

// ---------------------------------------------------------------------------
// FjallConfigStorage
// ---------------------------------------------------------------------------

/// `ConfigStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallConfigStorage(pub Arc<FjallStore>);

impl ConfigStorage for FjallConfigStorage {
    async fn load(&self) -> Result<Option<NodeConfig>, FieldsyncError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<NodeConfig>, FieldsyncError> {
            let last_applied = match store.config.get(LAST_APPLIED_KEY).map_err(fjall_err)? {
                Some(b) => Some(decode::<u64>(&b)?),
                None => None,
            };

            let mut entries: Vec<(ConfigKey, ConfigValue)> = Vec::new();
            for guard in store.config.prefix(VALUE_PREFIX) {
                let (k, v) = guard.into_inner().map_err(fjall_err)?;
                let Some(name) = parse_value_key(&k) else { continue };
                match name.parse::<ConfigKey>() {
                    Ok(key) => entries.push((key, decode::<ConfigValue>(&v)?)),
                    Err(_) => tracing::warn!(key = name, "stored key not in schema; ignored"),
                }
            }

            if entries.is_empty() && last_applied.is_none() {
                return Ok(None);
            }

            let (config, discarded) = NodeConfig::restore(entries, last_applied);
            for key in discarded {
                tracing::warn!(%key, "stored value outside schema domain; default used");
            }
            Ok(Some(config))
        })
        .await
        .map_err(join_err)?
    }

    async fn persist(&self, config: &NodeConfig) -> Result<(), FieldsyncError> {
        let store = self.0.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || -> Result<(), FieldsyncError> {
            let mut batch = store.db.batch();
            for (key, value) in config.values() {
                batch.insert(&store.config, value_key(*key), encode(value)?);
            }
            match config.last_applied_patch_id() {
                Some(id) => batch.insert(&store.config, LAST_APPLIED_KEY.to_vec(), encode(&id)?),
                None => batch.remove(&store.config, LAST_APPLIED_KEY.to_vec()),
            }
            batch.commit().map_err(fjall_err)?;
            store.db.persist(fjall::PersistMode::SyncAll).map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// FjallAuditLog
// ---------------------------------------------------------------------------

/// `AuditLog` backed by fjall. Sequence numbers continue across restarts.
pub struct FjallAuditLog {
    store: Arc<FjallStore>,
    next_seq: AtomicU64,
}

impl FjallAuditLog {
    pub fn open(store: Arc<FjallStore>) -> Result<Self, FieldsyncError> {
        let last = store
            .audit
            .range(audit_key(0).to_vec()..=audit_key(u64::MAX).to_vec())
            .next_back();
        let next_seq = match last {
            None => 0,
            Some(guard) => {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                let seq_bytes: [u8; 8] = k[..]
                    .try_into()
                    .map_err(|_| FieldsyncError::Storage("malformed audit key".into()))?;
                u64::from_be_bytes(seq_bytes) + 1
            }
        };
        Ok(FjallAuditLog { store, next_seq: AtomicU64::new(next_seq) })
    }

    /// Most recent record, if any.
    pub async fn last_event(&self) -> Result<Option<(u64, AuditEvent)>, FieldsyncError> {
        let from = match self.next_seq.load(Ordering::SeqCst) {
            0 => return Ok(None),
            next => next - 1,
        };
        Ok(self.read(from, 1).await?.pop())
    }
}

impl AuditLog for FjallAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<u64, FieldsyncError> {
        let store = self.store.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        tokio::task::spawn_blocking(move || -> Result<u64, FieldsyncError> {
            store.audit.insert(audit_key(seq).to_vec(), encode(&event)?).map_err(fjall_err)?;
            Ok(seq)
        })
        .await
        .map_err(join_err)?
    }

    async fn read(&self, from: u64, limit: usize) -> Result<Vec<(u64, AuditEvent)>, FieldsyncError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(u64, AuditEvent)>, FieldsyncError> {
            let take = if limit == 0 { usize::MAX } else { limit };
            store
                .audit
                .range(audit_key(from).to_vec()..=audit_key(u64::MAX).to_vec())
                .take(take)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let seq = u64::from_be_bytes(k[..].try_into().map_err(|_| {
                            FieldsyncError::Storage("malformed audit key".into())
                        })?);
                        Ok((seq, decode::<AuditEvent>(&v)?))
                    })
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
