//! Exclusive use of the main camera.
//!
//! Jobs that move the stage or change the illumination, and recordings,
//! need frames that nothing else is disturbing. They hold a [`LeaseGuard`]
//! for their whole run; analysis-only jobs read frames without one.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Camera is busy: {holder} in progress")]
pub struct CameraBusy {
    pub holder: String,
}

#[derive(Debug, Default)]
pub struct CameraLease {
    holder: Mutex<Option<String>>,
}

impl CameraLease {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lease for `holder`, failing with the current holder's name
    /// if somebody else has it.
    pub fn try_acquire(self: &Arc<Self>, holder: impl Into<String>) -> Result<LeaseGuard, CameraBusy> {
        let mut current = self.holder.lock().unwrap();
        if let Some(existing) = current.as_ref() {
            return Err(CameraBusy {
                holder: existing.clone(),
            });
        }
        let holder = holder.into();
        tracing::debug!("Camera lease taken by {holder}");
        *current = Some(holder);
        Ok(LeaseGuard {
            lease: self.clone(),
        })
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().unwrap().clone()
    }
}

/// Releases the lease on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    lease: Arc<CameraLease>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(holder) = self.lease.holder.lock().unwrap().take() {
            tracing::debug!("Camera lease released by {holder}");
        }
    }
}
