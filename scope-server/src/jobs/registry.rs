//! Single-flight bookkeeping for image-processing jobs.

use shared_wasm::event::{JobRecord, JobsStatus};
use shared_wasm::{JobKind, JobState, LedChannel, ScopeEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::events::EventBroadcaster;

/// Jobs are keyed by kind; auto-brightness additionally by LED channel.
pub type JobKey = (JobKind, Option<LedChannel>);

/// Human-readable job name used in status messages and errors.
pub fn job_label(kind: &JobKind, channel: &Option<LedChannel>) -> String {
    let name = match kind {
        JobKind::Stitch => "Image stitching",
        JobKind::FocusStack => "Focus stacking",
        JobKind::CellCount => "Cell counting",
        JobKind::AutoBrightness => "Auto-brightness",
        JobKind::Calibration => "Calibration",
        JobKind::FastFocus => "Fast focus",
    };
    match channel {
        Some(channel) => format!("{name} ({channel})"),
        None => name.to_string(),
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{} is already running", job_label(.kind, .channel))]
pub struct AlreadyRunning {
    pub kind: JobKind,
    pub channel: Option<LedChannel>,
}

/// Table of every job that has run since startup.
///
/// A kind moves `idle -> running -> completed | failed`; a finished job can
/// be started again right away.
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobKey, JobRecord>>,
    events: Arc<EventBroadcaster>,
}

impl JobRegistry {
    pub fn new(events: Arc<EventBroadcaster>) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Mark `(kind, channel)` running, unless it already is.
    pub fn try_start(
        self: &Arc<Self>,
        kind: JobKind,
        channel: Option<LedChannel>,
        total: u32,
    ) -> Result<JobGuard, AlreadyRunning> {
        let key = (kind, channel);
        {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs
                .get(&key)
                .is_some_and(|job| job.state == JobState::Running)
            {
                return Err(AlreadyRunning { kind, channel });
            }
            jobs.insert(
                key,
                JobRecord {
                    kind,
                    channel,
                    state: JobState::Running,
                    current: 0,
                    total,
                    error: None,
                },
            );
        }
        tracing::info!("{} started", job_label(&kind, &channel));
        self.publish();
        Ok(JobGuard {
            registry: self.clone(),
            key,
            finished: false,
        })
    }

    pub fn state(&self, kind: JobKind, channel: Option<LedChannel>) -> JobState {
        self.jobs
            .lock()
            .unwrap()
            .get(&(kind, channel))
            .map(|job| job.state)
            .unwrap_or_default()
    }

    /// Every known job, in a stable order.
    pub fn snapshot(&self) -> JobsStatus {
        let mut jobs: Vec<JobRecord> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by_key(|job| (job.kind.as_str(), job.channel.map(LedChannel::index)));
        JobsStatus { jobs }
    }

    fn publish(&self) {
        self.events.publish(ScopeEvent::JobsStatus(self.snapshot()));
    }

    fn set_progress(&self, key: JobKey, current: u32, total: u32) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&key) {
            job.current = current;
            job.total = total;
        }
    }

    fn finish(&self, key: JobKey, state: JobState, error: Option<String>) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&key) {
            job.state = state;
            job.error = error;
            if state == JobState::Completed {
                job.current = job.total;
            }
        }
        self.publish();
    }
}

/// Running job. Dropping it without [`complete`](Self::complete) or
/// [`fail`](Self::fail) marks the job failed.
pub struct JobGuard {
    registry: Arc<JobRegistry>,
    key: JobKey,
    finished: bool,
}

impl JobGuard {
    pub fn kind(&self) -> JobKind {
        self.key.0
    }

    pub fn channel(&self) -> Option<LedChannel> {
        self.key.1
    }

    pub fn progress(&self, current: u32, total: u32) {
        self.registry.set_progress(self.key, current, total);
    }

    /// Handle for reporting progress from other tasks or threads.
    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            registry: self.registry.clone(),
            key: self.key,
        }
    }

    pub fn complete(mut self) {
        self.finished = true;
        tracing::info!("{} completed", job_label(&self.key.0, &self.key.1));
        self.registry.finish(self.key, JobState::Completed, None);
    }

    pub fn fail(mut self, error: &dyn std::fmt::Display) {
        self.finished = true;
        tracing::warn!("{} failed: {error}", job_label(&self.key.0, &self.key.1));
        self.registry
            .finish(self.key, JobState::Failed, Some(error.to_string()));
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    registry: Arc<JobRegistry>,
    key: JobKey,
}

impl ProgressReporter {
    pub fn progress(&self, current: u32, total: u32) {
        self.registry.set_progress(self.key, current, total);
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.registry
                .finish(self.key, JobState::Failed, Some("job aborted".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<JobRegistry> {
        JobRegistry::new(Arc::new(EventBroadcaster::new(16)))
    }

    #[test]
    fn test_same_kind_rejected_while_running() {
        let jobs = registry();
        let guard = jobs.try_start(JobKind::Stitch, None, 9).unwrap();

        let Err(err) = jobs.try_start(JobKind::Stitch, None, 9) else {
            panic!("second stitch started");
        };
        assert_eq!(err.to_string(), "Image stitching is already running");

        // Other kinds are independent
        let other = jobs.try_start(JobKind::CellCount, None, 1).unwrap();
        other.complete();
        guard.complete();
        assert_eq!(jobs.state(JobKind::Stitch, None), JobState::Completed);
    }

    #[test]
    fn test_brightness_channels_are_separate() {
        let jobs = registry();
        let _reflected = jobs
            .try_start(JobKind::AutoBrightness, Some(LedChannel::Reflected), 6)
            .unwrap();
        assert!(jobs
            .try_start(JobKind::AutoBrightness, Some(LedChannel::Transmitted), 6)
            .is_ok());
        assert!(jobs
            .try_start(JobKind::AutoBrightness, Some(LedChannel::Reflected), 6)
            .is_err());
    }

    #[test]
    fn test_failed_job_is_retryable() {
        let jobs = registry();
        let guard = jobs.try_start(JobKind::Calibration, None, 1).unwrap();
        guard.fail(&"no dots");

        let snapshot = jobs.snapshot();
        assert_eq!(snapshot.jobs[0].state, JobState::Failed);
        assert_eq!(snapshot.jobs[0].error.as_deref(), Some("no dots"));
        assert!(jobs.try_start(JobKind::Calibration, None, 1).is_ok());
    }

    #[test]
    fn test_dropped_guard_marks_failure() {
        let jobs = registry();
        let guard = jobs.try_start(JobKind::FocusStack, None, 5).unwrap();
        guard.progress(2, 5);
        drop(guard);

        let job = &jobs.snapshot().jobs[0];
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.current, 2);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let events = Arc::new(EventBroadcaster::new(16));
        let mut rx = events.subscribe();
        let jobs = JobRegistry::new(events);

        jobs.try_start(JobKind::FastFocus, None, 20).unwrap().complete();

        let states: Vec<JobState> = [rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|event| match event {
                ScopeEvent::JobsStatus(status) => status.jobs[0].state,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(states, vec![JobState::Running, JobState::Completed]);
    }
}
