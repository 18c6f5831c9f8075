// Matrix Scheduler
// Runs job instances concurrently under global and per-template parallelism limits

use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::runner::StepRunner;
use crate::model::{JobInstance, JobResult, RunReport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info};

pub struct MatrixScheduler {
    runner: Arc<StepRunner>,
}

impl MatrixScheduler {
    pub fn new(runner: StepRunner) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }

    /// Run every instance and return their results in input order.
    ///
    /// Each instance runs in its own task. A task that panics becomes a
    /// failed result for that instance only.
    pub async fn run_all(&self, instances: Vec<JobInstance>) -> RunReport {
        let start = Instant::now();
        let events = self.runner.progress();
        let global = self
            .runner
            .config()
            .max_parallel
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        // Keyed by template identity
        let mut per_template: HashMap<usize, Arc<Semaphore>> = HashMap::new();

        info!(
            jobs = instances.len(),
            max_parallel = ?self.runner.config().max_parallel,
            "starting run"
        );
        events.send_event(ExecutionEvent::run_started(instances.len()));

        let mut handles = Vec::with_capacity(instances.len());
        for instance in instances {
            let local = instance.template.max_parallel.map(|limit| {
                per_template
                    .entry(Arc::as_ptr(&instance.template) as usize)
                    .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1))))
                    .clone()
            });
            let global = global.clone();
            let runner = Arc::clone(&self.runner);
            let placeholder = instance.clone();

            let handle = tokio::spawn(async move {
                // Template permit first, so a waiting instance never holds a global slot
                let _local = match local {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let _global = match global {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                runner.run(&instance).await
            });

            handles.push((placeholder, handle));
        }

        let mut jobs = Vec::with_capacity(handles.len());
        for (instance, handle) in handles {
            match handle.await {
                Ok(result) => jobs.push(result),
                Err(err) => {
                    let reason = panic_message(err);
                    error!(job = %instance.name, %reason, "job task aborted");
                    jobs.push(JobResult::aborted(&instance, reason));
                }
            }
        }

        let report = RunReport {
            jobs,
            duration: start.elapsed(),
        };

        info!(
            passed = report.passed(),
            failed = report.failed(),
            duration = ?report.duration,
            "run finished"
        );
        events.send_event(ExecutionEvent::run_completed(
            report.success(),
            report.duration,
        ));

        report
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("job task was cancelled: {}", err);
    }

    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", message)
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use crate::execution::environment::StaticEnv;
    use crate::execution::matrix::{MatrixAxis, MatrixExpander};
    use crate::execution::runner::RunnerConfig;
    use crate::model::{JobStatus, JobTemplate, StepSpec, StepStatus};
    use crate::runners::{CommandExecutor, CommandOutput, CommandRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Tracks peak concurrency; panics on `panic`, fails on `exit 1`
    #[derive(Default)]
    struct ConcurrencyTracker {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CommandExecutor for ConcurrencyTracker {
        async fn execute(&self, request: CommandRequest<'_>) -> Result<CommandOutput, ExecError> {
            if request.script == "panic" {
                panic!("executor exploded");
            }

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let exit_code = if request.script == "exit 1" { 1 } else { 0 };
            Ok(CommandOutput {
                exit_code: Some(exit_code),
                ..Default::default()
            })
        }
    }

    fn instances(template: JobTemplate, values: &[&str]) -> Vec<JobInstance> {
        let axes = vec![MatrixAxis::scalar("python.version", values.iter().copied())];
        MatrixExpander::expand(&Arc::new(template), &axes).unwrap()
    }

    fn scheduler(tracker: &Arc<ConcurrencyTracker>, max_parallel: Option<usize>) -> MatrixScheduler {
        let config = RunnerConfig {
            max_parallel,
            ..RunnerConfig::default()
        };
        MatrixScheduler::new(
            StepRunner::new(tracker.clone())
                .with_ambient(Arc::new(StaticEnv::new()))
                .with_config(config),
        )
    }

    #[tokio::test]
    async fn test_results_in_matrix_order() {
        let tracker = Arc::new(ConcurrencyTracker::default());
        let template = JobTemplate::new("Linux").with_step(StepSpec::script("test", "true"));

        let report = scheduler(&tracker, None)
            .run_all(instances(template, &["3.8", "3.9", "3.10"]))
            .await;

        let names: Vec<&str> = report.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Linux (python.version=3.8)",
                "Linux (python.version=3.9)",
                "Linux (python.version=3.10)"
            ]
        );
        assert!(report.success());
    }

    #[tokio::test]
    async fn test_global_limit_bounds_concurrency() {
        let tracker = Arc::new(ConcurrencyTracker::default());
        let template = JobTemplate::new("Linux").with_step(StepSpec::script("test", "true"));

        scheduler(&tracker, Some(2))
            .run_all(instances(template, &["1", "2", "3", "4", "5"]))
            .await;

        assert!(tracker.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_template_limit_bounds_concurrency() {
        let tracker = Arc::new(ConcurrencyTracker::default());
        let template = JobTemplate::new("Linux")
            .with_max_parallel(1)
            .with_step(StepSpec::script("test", "true"));

        scheduler(&tracker, None)
            .run_all(instances(template, &["1", "2", "3"]))
            .await;

        assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_instances_are_independent() {
        let tracker = Arc::new(ConcurrencyTracker::default());
        let failing = instances(
            JobTemplate::new("Broken").with_step(StepSpec::script("test", "exit 1")),
            &["3.8"],
        );
        let passing = instances(
            JobTemplate::new("Linux").with_step(StepSpec::script("test", "true")),
            &["3.8"],
        );

        let report = scheduler(&tracker, None)
            .run_all(failing.into_iter().chain(passing).collect())
            .await;

        assert_eq!(report.jobs[0].status(), JobStatus::Failed);
        assert_eq!(report.jobs[1].status(), JobStatus::Passed);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn test_panicking_instance_becomes_failed_result() {
        let tracker = Arc::new(ConcurrencyTracker::default());
        let template = JobTemplate::new("Linux").with_step(StepSpec::script("boom", "panic"));

        let report = scheduler(&tracker, None)
            .run_all(instances(template, &["3.8"]))
            .await;

        let job = &report.jobs[0];
        assert_eq!(job.name, "Linux (python.version=3.8)");
        assert_eq!(job.steps[0].status, StepStatus::Failed);
        assert!(job.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("executor exploded"));
    }
}
