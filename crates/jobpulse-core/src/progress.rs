use crate::normalize::JobEvent;
use crate::{JobSnapshot, JobStatus};

/// Per-job state machine: `idle -> queued -> processing -> complete | error`.
///
/// Progress never moves backwards while a job is tracked; a late event that
/// reports a lower percentage still updates the stage and message.
#[derive(Debug, Clone, Default)]
pub struct ProgressAggregator {
    snapshot: JobSnapshot,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &JobSnapshot {
        &self.snapshot
    }

    pub fn job_id(&self) -> Option<&str> {
        self.snapshot.id.as_deref()
    }

    /// Starts tracking `job_id`, optimistically marking it queued before the
    /// producer has said anything.
    pub fn start(&mut self, job_id: impl Into<String>) {
        self.snapshot = JobSnapshot {
            id: Some(job_id.into()),
            status: JobStatus::Queued,
            ..JobSnapshot::default()
        };
    }

    pub fn reset(&mut self) {
        self.snapshot = JobSnapshot::default();
    }

    /// Applies one normalized event and reports whether the snapshot changed.
    pub fn apply(&mut self, event: &JobEvent) -> bool {
        let Some(tracked) = self.snapshot.id.as_deref() else {
            return false;
        };
        if let Some(job_id) = event.job_id() {
            if job_id != tracked {
                return false;
            }
        }
        if self.snapshot.status.is_terminal() {
            return false;
        }

        let before = self.snapshot.clone();
        match event {
            JobEvent::Progress {
                progress,
                status,
                message,
                ..
            } => {
                if let Some(progress) = progress {
                    self.snapshot.progress = self.snapshot.progress.max(*progress);
                }
                let label = status.as_deref().map(JobStatus::from_label);
                self.snapshot.status = match (self.snapshot.status, label) {
                    (JobStatus::Queued, Some(JobStatus::Queued)) => JobStatus::Queued,
                    _ => JobStatus::Processing,
                };
                if let Some(status) = status {
                    self.snapshot.stage = Some(status.clone());
                }
                if let Some(message) = message {
                    self.snapshot.message = Some(message.clone());
                }
            }
            JobEvent::Complete { result, .. } => {
                self.snapshot.status = JobStatus::Complete;
                self.snapshot.progress = 100;
                self.snapshot.result = Some(result.clone());
                self.snapshot.error = None;
            }
            JobEvent::Failed {
                error,
                retries_left,
                ..
            } => {
                self.snapshot.status = JobStatus::Error;
                self.snapshot.error = Some(error.clone());
                self.snapshot.retries_left = *retries_left;
            }
        }
        self.snapshot != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, CanonicalEvent};
    use serde_json::{json, Value};

    fn job_event(name: &str, payload: Value) -> JobEvent {
        match normalize(name, &payload) {
            Some(CanonicalEvent::Job(event)) => event,
            other => panic!("expected job event, got {other:?}"),
        }
    }

    #[test]
    fn start_marks_job_queued() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.start("J1");
        assert_eq!(aggregator.snapshot().status, JobStatus::Queued);
        assert_eq!(aggregator.job_id(), Some("J1"));
        assert_eq!(aggregator.snapshot().progress, 0);
    }

    #[test]
    fn progress_then_complete_scenario() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.start("J1");
        assert!(aggregator.apply(&job_event(
            "job-progress",
            json!({"jobId": "J1", "progress": 40, "status": "processing"})
        )));
        assert_eq!(aggregator.snapshot().status, JobStatus::Processing);
        assert_eq!(aggregator.snapshot().progress, 40);

        assert!(aggregator.apply(&job_event(
            "job-complete",
            json!({"jobId": "J1", "result": {"url": "x"}})
        )));
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.status, JobStatus::Complete);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.result, Some(json!({"url": "x"})));
    }

    #[test]
    fn foreign_job_ids_are_ignored() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.start("B");
        let before = aggregator.snapshot().clone();
        assert!(!aggregator.apply(&job_event("job-progress", json!({"jobId": "A", "progress": 90}))));
        assert!(!aggregator.apply(&job_event("job-failed", json!({"jobId": "A", "error": "x"}))));
        assert_eq!(aggregator.snapshot(), &before);
    }

    #[test]
    fn events_without_id_apply_to_tracked_job() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.start("J2");
        assert!(aggregator.apply(&job_event("generation-progress", json!({"progress": 10}))));
        assert_eq!(aggregator.snapshot().progress, 10);
    }

    #[test]
    fn idle_aggregator_ignores_events() {
        let mut aggregator = ProgressAggregator::new();
        assert!(!aggregator.apply(&job_event("job-progress", json!({"progress": 10}))));
        assert_eq!(aggregator.snapshot(), &JobSnapshot::default());
    }

    #[test]
    fn queued_label_keeps_job_queued() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.start("J3");
        aggregator.apply(&job_event("job-progress", json!({"status": "waiting", "message": "in line"})));
        assert_eq!(aggregator.snapshot().status, JobStatus::Queued);
        assert_eq!(aggregator.snapshot().message.as_deref(), Some("in line"));

        aggregator.apply(&job_event("job-progress", json!({"status": "rendering"})));
        assert_eq!(aggregator.snapshot().status, JobStatus::Processing);
        assert_eq!(aggregator.snapshot().stage.as_deref(), Some("rendering"));

        aggregator.apply(&job_event("job-progress", json!({"status": "pending"})));
        assert_eq!(aggregator.snapshot().status, JobStatus::Processing);
    }

    #[test]
    fn progress_does_not_regress() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.start("J4");
        aggregator.apply(&job_event("job-progress", json!({"progress": 60})));
        aggregator.apply(&job_event("job-progress", json!({"progress": 30, "message": "late"})));
        assert_eq!(aggregator.snapshot().progress, 60);
        assert_eq!(aggregator.snapshot().message.as_deref(), Some("late"));
    }

    #[test]
    fn terminal_states_ignore_further_events() {
        let mut aggregator = ProgressAggregator::new();
        aggregator.start("J5");
        aggregator.apply(&job_event("job-failed", json!({"error": "gpu lost", "retriesLeft": 0})));
        assert_eq!(aggregator.snapshot().status, JobStatus::Error);
        assert_eq!(aggregator.snapshot().error.as_deref(), Some("gpu lost"));
        assert_eq!(aggregator.snapshot().retries_left, Some(0));

        assert!(!aggregator.apply(&job_event("job-complete", json!({"result": 1}))));
        assert_eq!(aggregator.snapshot().status, JobStatus::Error);
        assert_eq!(aggregator.snapshot().result, None);
    }

    #[test]
    fn reset_is_idempotent_from_every_state() {
        let setups: Vec<Box<dyn Fn(&mut ProgressAggregator)>> = vec![
            Box::new(|_| {}),
            Box::new(|agg| agg.start("J")),
            Box::new(|agg| {
                agg.start("J");
                agg.apply(&job_event("job-progress", json!({"progress": 20})));
            }),
            Box::new(|agg| {
                agg.start("J");
                agg.apply(&job_event("job-complete", json!({"result": {"ok": true}})));
            }),
            Box::new(|agg| {
                agg.start("J");
                agg.apply(&job_event("job-failed", json!({"error": "nope"})));
            }),
        ];

        for setup in setups {
            let mut aggregator = ProgressAggregator::new();
            setup(&mut aggregator);
            aggregator.reset();
            assert_eq!(aggregator.snapshot(), &JobSnapshot::default());
            aggregator.reset();
            assert_eq!(aggregator.snapshot().status, JobStatus::Idle);
            assert_eq!(aggregator.job_id(), None);
        }
    }
}
