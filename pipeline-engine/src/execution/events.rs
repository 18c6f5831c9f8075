// Execution Events
// Progress reporting for matrix runs

use crate::execution::environment::SECRET_MASK;
use crate::model::{Issue, JobStatus, StepStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while running job instances.
///
/// `job` is always the instance name, e.g. `Linux (python.version=3.8)`.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        total_jobs: usize,
    },

    RunCompleted {
        success: bool,
        duration: Duration,
    },

    JobStarted {
        job: String,
        total_steps: usize,
    },

    JobCompleted {
        job: String,
        status: JobStatus,
        duration: Duration,
    },

    StepStarted {
        job: String,
        step_index: usize,
        display_name: String,
    },

    /// Captured stdout/stderr, one event per stream
    StepOutput {
        job: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    StepCompleted {
        job: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step was skipped (guard false, disabled, or the job timed out)
    StepSkipped {
        job: String,
        step_index: usize,
        display_name: String,
        reason: String,
    },

    /// Set via `##vso[task.setvariable]`; secret values are masked
    VariableSet {
        job: String,
        name: String,
        value: String,
        is_secret: bool,
    },

    /// Logged via `##vso[task.logissue]`
    Issue {
        job: String,
        step_index: usize,
        issue: Issue,
    },
}

impl ExecutionEvent {
    pub fn run_started(total_jobs: usize) -> Self {
        Self::RunStarted { total_jobs }
    }

    pub fn run_completed(success: bool, duration: Duration) -> Self {
        Self::RunCompleted { success, duration }
    }

    pub fn job_started(job: impl Into<String>, total_steps: usize) -> Self {
        Self::JobStarted {
            job: job.into(),
            total_steps,
        }
    }

    pub fn job_completed(job: impl Into<String>, status: JobStatus, duration: Duration) -> Self {
        Self::JobCompleted {
            job: job.into(),
            status,
            duration,
        }
    }

    pub fn step_started(
        job: impl Into<String>,
        step_index: usize,
        display_name: impl Into<String>,
    ) -> Self {
        Self::StepStarted {
            job: job.into(),
            step_index,
            display_name: display_name.into(),
        }
    }

    pub fn step_output(
        job: impl Into<String>,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            job: job.into(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    pub fn step_completed(
        job: impl Into<String>,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StepCompleted {
            job: job.into(),
            step_index,
            status,
            duration,
            exit_code,
        }
    }

    pub fn step_skipped(
        job: impl Into<String>,
        step_index: usize,
        display_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepSkipped {
            job: job.into(),
            step_index,
            display_name: display_name.into(),
            reason: reason.into(),
        }
    }

    pub fn variable_set(
        job: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
        is_secret: bool,
    ) -> Self {
        let value = if is_secret {
            SECRET_MASK.to_string()
        } else {
            value.into()
        };
        Self::VariableSet {
            job: job.into(),
            name: name.into(),
            value,
            is_secret,
        }
    }

    pub fn issue(job: impl Into<String>, step_index: usize, issue: Issue) -> Self {
        Self::Issue {
            job: job.into(),
            step_index,
            issue,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::run_started(2));
        tx.send_event(ExecutionEvent::job_started("Linux (python.version=3.8)", 3));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::RunStarted { total_jobs: 2 }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, ExecutionEvent::JobStarted { .. }));
    }

    #[test]
    fn test_secret_values_are_masked() {
        let event = ExecutionEvent::variable_set("Linux", "token", "hunter2", true);
        let ExecutionEvent::VariableSet { value, .. } = event else {
            panic!("wrong event type");
        };
        assert_eq!(value, "***");
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::run_started(0));
    }

    #[tokio::test]
    async fn test_closed_receiver_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::run_completed(true, Duration::ZERO));
    }
}
