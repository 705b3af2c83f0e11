//! The authoritative instrument settings.

use shared_wasm::event::TargetPositions;
use shared_wasm::{InstrumentSettings, ScopeEvent, SettingsPatch};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::events::EventBroadcaster;

/// Process-wide [`InstrumentSettings`] behind one writer lock.
///
/// Every mutation is broadcast while the write lock is still held, so
/// clients observe updates in the order they were applied.
pub struct SettingsStore {
    inner: RwLock<InstrumentSettings>,
    events: Arc<EventBroadcaster>,
}

impl SettingsStore {
    pub fn new(initial: InstrumentSettings, events: Arc<EventBroadcaster>) -> Self {
        Self {
            inner: RwLock::new(initial),
            events,
        }
    }

    pub async fn snapshot(&self) -> InstrumentSettings {
        self.inner.read().await.clone()
    }

    /// Full `settings_update` sent to newly connected clients.
    pub async fn snapshot_event(&self) -> ScopeEvent {
        ScopeEvent::SettingsUpdate(self.inner.read().await.to_patch())
    }

    /// Apply `patch` and broadcast it as an incremental `settings_update`.
    ///
    /// Empty patches change nothing and are not broadcast.
    pub async fn apply(&self, patch: SettingsPatch) -> InstrumentSettings {
        let mut settings = self.inner.write().await;
        if patch.is_empty() {
            return settings.clone();
        }
        settings.apply_patch(&patch);
        self.events.publish(ScopeEvent::SettingsUpdate(patch));
        settings.clone()
    }

    /// Snap the stored targets to where the stage actually is.
    ///
    /// Announced as `target_positions_update` rather than `settings_update`
    /// so clients can tell reconciliation apart from user edits.
    pub async fn reconcile_targets(&self, positions_mm: [f64; 3]) {
        let mut settings = self.inner.write().await;
        let [x, y, z] = positions_mm;
        settings.x_target = x;
        settings.y_target = y;
        settings.z_target = z;
        self.events
            .publish(ScopeEvent::TargetPositionsUpdate(TargetPositions {
                x_target: x,
                y_target: y,
                z_target: z,
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (SettingsStore, tokio::sync::broadcast::Receiver<ScopeEvent>) {
        let events = Arc::new(EventBroadcaster::new(16));
        let rx = events.subscribe();
        (SettingsStore::new(InstrumentSettings::default(), events), rx)
    }

    #[tokio::test]
    async fn test_apply_broadcasts_patch() {
        let (store, mut rx) = store();
        let patch = SettingsPatch {
            exposure_value: Some(12.0),
            ..Default::default()
        };

        let updated = store.apply(patch.clone()).await;
        assert_eq!(updated.exposure_ms, 12.0);
        assert_eq!(rx.recv().await.unwrap(), ScopeEvent::SettingsUpdate(patch));
    }

    #[tokio::test]
    async fn test_same_patch_twice_is_idempotent() {
        let (store, _rx) = store();
        let patch = SettingsPatch::led(shared_wasm::LedChannel::Transmitted, 30.0);
        let first = store.apply(patch.clone()).await;
        let second = store.apply(patch).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_patch_not_broadcast() {
        let (store, mut rx) = store();
        store.apply(SettingsPatch::default()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconcile_emits_target_update() {
        let (store, mut rx) = store();
        store.reconcile_targets([1.0, -0.5, 0.05]).await;

        assert_eq!(store.snapshot().await.z_target, 0.05);
        match rx.recv().await.unwrap() {
            ScopeEvent::TargetPositionsUpdate(t) => assert_eq!(t.y_target, -0.5),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
