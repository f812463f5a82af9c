use std::future::Future;

use fieldsync_types::{AuditEvent, FieldsyncError, NodeConfig};

/// Non-volatile home of a node's applied configuration.
///
/// Methods use RPITIT (`-> impl Future + Send`) so implementations can be
/// plain `async fn`s without an `async-trait` dependency.
pub trait ConfigStorage: Send + Sync + 'static {
    /// Return the persisted record, or `None` on first boot.
    fn load(&self) -> impl Future<Output = Result<Option<NodeConfig>, FieldsyncError>> + Send;

    /// Replace the persisted record with `config` as one atomic write.
    /// Resolves only once the record is on stable storage.
    fn persist(&self, config: &NodeConfig)
        -> impl Future<Output = Result<(), FieldsyncError>> + Send;
}

/// Append-only record of patch attempts and outcomes.
///
/// No update or delete; retention is handled outside the process.
pub trait AuditLog: Send + Sync + 'static {
    /// Append `event`, returning its sequence number.
    fn record(&self, event: AuditEvent)
        -> impl Future<Output = Result<u64, FieldsyncError>> + Send;

    /// Return up to `limit` records with sequence `>= from`, oldest first.
    /// `limit == 0` means everything.
    fn read(&self, from: u64, limit: usize)
        -> impl Future<Output = Result<Vec<(u64, AuditEvent)>, FieldsyncError>> + Send;
}
