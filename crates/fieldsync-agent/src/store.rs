use std::sync::Arc;

use tokio::sync::watch;

use fieldsync_types::{NodeConfig, PatchId};

use crate::validator::ValidatedSet;

/// Build the successor of `current`: a full copy with only the validated
/// fields overlaid. Pure; the live config is not touched.
pub fn apply(current: &NodeConfig, validated: &ValidatedSet, patch_id: PatchId) -> NodeConfig {
    current.overlay(validated.fields(), patch_id)
}

/// Single-writer cell holding the node's live configuration.
///
/// Each swap publishes a whole `NodeConfig` at once; readers holding a
/// `ConfigHandle` see either the old or the new value, never a mix.
pub struct LiveConfig {
    tx: watch::Sender<Arc<NodeConfig>>,
}

impl LiveConfig {
    pub fn new(initial: NodeConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        LiveConfig { tx }
    }

    pub fn current(&self) -> Arc<NodeConfig> {
        self.tx.borrow().clone()
    }

    /// Replace the live config, returning the one it replaced.
    pub fn swap(&self, next: NodeConfig) -> Arc<NodeConfig> {
        self.tx.send_replace(Arc::new(next))
    }

    pub fn handle(&self) -> ConfigHandle {
        ConfigHandle { rx: self.tx.subscribe() }
    }
}

/// Read-only view of the live configuration for other node subsystems.
///
/// Call `current()` at each use instead of keeping the returned value around.
#[derive(Clone)]
pub struct ConfigHandle {
    rx: watch::Receiver<Arc<NodeConfig>>,
}

impl ConfigHandle {
    pub fn current(&self) -> Arc<NodeConfig> {
        self.rx.borrow().clone()
    }

    /// Wait for the next swap. Returns `None` once the agent is gone.
    pub async fn changed(&mut self) -> Option<Arc<NodeConfig>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use fieldsync_types::{ConfigKey, ConfigValue};

    use super::*;
    use crate::validator::validate;

    #[test]
    fn apply_overlays_only_validated_fields() {
        let current = NodeConfig::defaults();
        let set = validate(&[("maxRetries".to_string(), ConfigValue::Int(5))]).unwrap();
        let next = apply(&current, &set, 9);

        assert_eq!(next.max_retries(), 5);
        assert_eq!(next.last_applied_patch_id(), Some(9));
        for key in ConfigKey::ALL.iter().filter(|k| **k != ConfigKey::MaxRetries) {
            assert_eq!(next.get(*key), current.get(*key));
        }
    }

    #[tokio::test]
    async fn handles_see_whole_swaps() {
        let live = LiveConfig::new(NodeConfig::defaults());
        let mut handle = live.handle();
        let reader = handle.clone();

        let next = NodeConfig::defaults().overlay(
            &[
                (ConfigKey::HeartbeatInterval, ConfigValue::UInt(45_000)),
                (ConfigKey::MaxRetries, ConfigValue::Int(5)),
            ],
            1,
        );
        let previous = live.swap(next.clone());
        assert_eq!(*previous, NodeConfig::defaults());

        let seen = handle.changed().await.unwrap();
        assert_eq!(*seen, next);
        assert_eq!(*reader.current(), next);
        assert_eq!(*live.current(), next);
    }

    #[tokio::test]
    async fn changed_ends_when_writer_drops() {
        let live = LiveConfig::new(NodeConfig::defaults());
        let mut handle = live.handle();
        drop(live);
        assert!(handle.changed().await.is_none());
    }
}
