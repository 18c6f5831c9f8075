// Step Runner
// Runs the ordered steps of one job instance under the job's wall-clock timeout

use crate::error::ExecError;
use crate::execution::commands::{parse_output, LoggingCommand, TaskResult};
use crate::execution::environment::{EnvLookup, JobEnvironment, ProcessEnv, DEFAULT_AMBIENT_VARIABLES};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::expression::evaluate;
use crate::model::{
    IssueKind, JobInstance, JobResult, StepResult, StepSpec, StepStatus,
};
use crate::runners::{CommandExecutor, CommandOutput, CommandRequest};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runtime knobs shared by every job in a run
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory steps run in; `workingDirectory` is resolved against it
    pub working_dir: PathBuf,
    /// Undeclared variables exported to every step from the ambient environment
    pub ambient_variables: Vec<String>,
    /// Replaces each template's job timeout when set
    pub job_timeout: Option<Duration>,
    /// Cap on concurrently running instances across all templates (None = unlimited)
    pub max_parallel: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            ambient_variables: DEFAULT_AMBIENT_VARIABLES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            job_timeout: None,
            max_parallel: None,
        }
    }
}

/// Executes job instances step by step.
///
/// Holds no per-job state, so one runner can serve many concurrent instances.
pub struct StepRunner {
    executor: Arc<dyn CommandExecutor>,
    ambient: Arc<dyn EnvLookup>,
    config: RunnerConfig,
    event_tx: Option<ProgressSender>,
}

impl StepRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            ambient: Arc::new(ProcessEnv),
            config: RunnerConfig::default(),
            event_tx: None,
        }
    }

    pub fn with_ambient(mut self, ambient: Arc<dyn EnvLookup>) -> Self {
        self.ambient = ambient;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub(crate) fn progress(&self) -> Option<ProgressSender> {
        self.event_tx.clone()
    }

    /// Run every step of `instance` and collect one result per step
    pub async fn run(&self, instance: &JobInstance) -> JobResult {
        let template = &instance.template;
        let timeout = self.config.job_timeout.unwrap_or(template.timeout);
        let deadline = deadline_after(timeout);
        let start = Instant::now();

        let mut env = JobEnvironment::new(instance.variables.clone(), Arc::clone(&self.ambient));
        let mut steps = Vec::with_capacity(template.steps.len());
        let mut timed_out = false;

        info!(job = %instance.name, steps = template.steps.len(), "starting job");
        self.event_tx.send_event(ExecutionEvent::job_started(
            &instance.name,
            template.steps.len(),
        ));

        for (index, step) in template.steps.iter().enumerate() {
            let result = if timed_out {
                self.skip(instance, index, step, "job timed out")
            } else if !step.enabled {
                self.skip(instance, index, step, "step is disabled")
            } else if !evaluate(step.guard.as_ref(), &env) {
                let reason = match &step.guard {
                    Some(guard) => format!("condition '{}' was false", guard),
                    None => "a previous step failed".to_string(),
                };
                self.skip(instance, index, step, reason)
            } else {
                let result = self
                    .execute_step(instance, index, step, &mut env, deadline, timeout)
                    .await;

                match result.status {
                    StepStatus::TimedOut => {
                        timed_out = true;
                        env.mark_failed();
                    }
                    StepStatus::Failed => env.mark_failed(),
                    _ => {}
                }
                result
            };

            steps.push(result);
        }

        let result = JobResult {
            name: instance.name.clone(),
            job: template.name.clone(),
            index: instance.index,
            bindings: instance.bindings.clone(),
            steps,
            duration: start.elapsed(),
        };

        let status = result.status();
        if result.success() {
            info!(job = %instance.name, ?status, duration = ?result.duration, "job finished");
        } else {
            warn!(job = %instance.name, ?status, duration = ?result.duration, "job finished");
        }
        self.event_tx.send_event(ExecutionEvent::job_completed(
            &instance.name,
            status,
            result.duration,
        ));

        result
    }

    fn skip(
        &self,
        instance: &JobInstance,
        index: usize,
        step: &StepSpec,
        reason: impl Into<String>,
    ) -> StepResult {
        let reason = reason.into();
        debug!(job = %instance.name, step = %step.display_name, %reason, "skipping step");
        self.event_tx.send_event(ExecutionEvent::step_skipped(
            &instance.name,
            index,
            &step.display_name,
            &reason,
        ));
        StepResult::skipped(step, reason)
    }

    async fn execute_step(
        &self,
        instance: &JobInstance,
        index: usize,
        step: &StepSpec,
        env: &mut JobEnvironment,
        job_deadline: tokio::time::Instant,
        job_timeout: Duration,
    ) -> StepResult {
        let start = Instant::now();

        debug!(job = %instance.name, step = %step.display_name, "starting step");
        self.event_tx.send_event(ExecutionEvent::step_started(
            &instance.name,
            index,
            &step.display_name,
        ));

        let script = env.expand(&step.body);
        let process_env = env.process_env(&self.config.ambient_variables, &step.env);
        let working_dir = match &step.working_directory {
            Some(dir) => self.config.working_dir.join(dir),
            None => self.config.working_dir.clone(),
        };

        let step_deadline = step
            .timeout
            .map(deadline_after)
            .filter(|deadline| *deadline < job_deadline);

        let request = CommandRequest {
            shell: step.shell,
            script: &script,
            env: &process_env,
            working_dir: &working_dir,
        };

        let outcome = tokio::time::timeout_at(
            step_deadline.unwrap_or(job_deadline),
            self.executor.execute(request),
        )
        .await;

        let mut result = match outcome {
            Ok(Ok(output)) => self.complete(instance, index, step, output, env),
            Ok(Err(err)) => self.failed(step, err),
            Err(_) if step_deadline.is_some() => {
                let limit = step.timeout.unwrap_or_default();
                self.failed(step, ExecError::StepTimeout(limit))
            }
            Err(_) => {
                warn!(job = %instance.name, step = %step.display_name, timeout = ?job_timeout, "job timed out");
                let mut result = StepResult::new(step, StepStatus::TimedOut);
                result.error = Some(ExecError::JobTimeout(job_timeout).to_string());
                result
            }
        };

        result.duration = start.elapsed();

        match result.status {
            StepStatus::Failed => {
                warn!(job = %instance.name, step = %step.display_name, error = ?result.error, "step failed")
            }
            StepStatus::Warning => {
                warn!(job = %instance.name, step = %step.display_name, error = ?result.error, "step failed, continuing")
            }
            status => debug!(job = %instance.name, step = %step.display_name, ?status, "step finished"),
        }

        self.event_tx.send_event(ExecutionEvent::step_completed(
            &instance.name,
            index,
            result.status,
            result.duration,
            result.exit_code,
        ));

        result
    }

    /// A step whose command did not complete
    fn failed(&self, step: &StepSpec, err: ExecError) -> StepResult {
        let mut result = StepResult::new(step, step.failure_policy.failure_status());
        result.error = Some(err.to_string());
        result
    }

    /// A step whose command ran to completion: apply logging commands, then the exit status
    fn complete(
        &self,
        instance: &JobInstance,
        index: usize,
        step: &StepSpec,
        output: CommandOutput,
        env: &mut JobEnvironment,
    ) -> StepResult {
        let mut issues = Vec::new();
        let mut reported = None;

        for command in parse_output(&output.stdout) {
            match command {
                LoggingCommand::SetVariable {
                    name,
                    value,
                    is_secret,
                    ..
                } => {
                    debug!(job = %instance.name, variable = %name, "variable set by step");
                    if is_secret {
                        env.add_secret(value.as_str());
                    }
                    self.event_tx.send_event(ExecutionEvent::variable_set(
                        &instance.name,
                        &name,
                        &value,
                        is_secret,
                    ));
                    env.set_variable(&name, value);
                }
                LoggingCommand::PrependPath(path) => env.prepend_path(path),
                LoggingCommand::LogIssue(mut issue) => {
                    issue.message = env.mask(&issue.message);
                    match issue.kind {
                        IssueKind::Warning => {
                            warn!(job = %instance.name, step = %step.display_name, "{}", issue.message)
                        }
                        IssueKind::Error => {
                            tracing::error!(job = %instance.name, step = %step.display_name, "{}", issue.message)
                        }
                    }
                    self.event_tx.send_event(ExecutionEvent::issue(
                        &instance.name,
                        index,
                        issue.clone(),
                    ));
                    issues.push(issue);
                }
                LoggingCommand::Complete(result) => reported = Some(result),
            }
        }

        let stdout = env.mask(&output.stdout);
        let stderr = env.mask(&output.stderr);
        if !stdout.is_empty() {
            self.event_tx.send_event(ExecutionEvent::step_output(
                &instance.name,
                index,
                &stdout,
                false,
            ));
        }
        if !stderr.is_empty() {
            self.event_tx.send_event(ExecutionEvent::step_output(
                &instance.name,
                index,
                &stderr,
                true,
            ));
        }

        let error = match output.exit_code {
            Some(0) if reported == Some(TaskResult::Failed) => Some(ExecError::ReportedFailure),
            Some(0) => None,
            Some(code) => Some(ExecError::NonZeroExit(code)),
            None => Some(ExecError::Terminated),
        };

        let status = match &error {
            Some(_) => step.failure_policy.failure_status(),
            None if reported == Some(TaskResult::SucceededWithIssues) => StepStatus::Warning,
            None => StepStatus::Passed,
        };

        let mut result = StepResult::new(step, status);
        result.exit_code = output.exit_code;
        result.stdout = stdout;
        result.stderr = stderr;
        result.error = error.map(|e| e.to_string());
        result.issues = issues;
        result
    }
}

/// Deadline `timeout` from now; a timeout past the clock's range never expires
fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

/// About thirty years
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::environment::StaticEnv;
    use crate::execution::events::progress_channel;
    use crate::expression::Condition;
    use crate::model::{FailurePolicy, JobTemplate};
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Interprets a tiny script language: `exit N`, `sleep MS`, `echo TEXT`
    #[derive(Default)]
    struct FakeExecutor {
        calls: AtomicUsize,
        scripts: Mutex<Vec<String>>,
        envs: Mutex<Vec<std::collections::HashMap<String, String>>>,
    }

    #[async_trait]
    impl CommandExecutor for FakeExecutor {
        async fn execute(&self, request: CommandRequest<'_>) -> Result<CommandOutput, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.scripts.lock().unwrap().push(request.script.to_string());
            self.envs.lock().unwrap().push(request.env.clone());

            let mut output = CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            };
            for line in request.script.lines() {
                if let Some(code) = line.strip_prefix("exit ") {
                    output.exit_code = Some(code.trim().parse().unwrap());
                } else if let Some(ms) = line.strip_prefix("sleep ") {
                    tokio::time::sleep(Duration::from_millis(ms.trim().parse().unwrap())).await;
                } else if let Some(text) = line.strip_prefix("echo ") {
                    if !output.stdout.is_empty() {
                        output.stdout.push('\n');
                    }
                    output.stdout.push_str(text);
                }
            }
            Ok(output)
        }
    }

    fn instance(template: JobTemplate) -> JobInstance {
        let variables = template.variables.clone();
        JobInstance {
            name: template.name.clone(),
            index: 0,
            template: Arc::new(template),
            bindings: IndexMap::new(),
            variables,
        }
    }

    fn runner(executor: &Arc<FakeExecutor>) -> StepRunner {
        StepRunner::new(executor.clone()).with_ambient(Arc::new(StaticEnv::new()))
    }

    fn statuses(result: &JobResult) -> Vec<StepStatus> {
        result.steps.iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn test_false_guard_skips_without_executing() {
        let executor = Arc::new(FakeExecutor::default());
        let template = JobTemplate::new("Linux")
            .with_step(StepSpec::script("one", "echo 1"))
            .with_step(
                StepSpec::script("xvfb", "echo 2")
                    .with_guard(Condition::parse(r#"TEST_WITH_XVFB == "1""#).unwrap()),
            )
            .with_step(StepSpec::script("three", "echo 3"));

        let result = runner(&executor).run(&instance(template)).await;

        assert_eq!(
            statuses(&result),
            vec![StepStatus::Passed, StepStatus::Skipped, StepStatus::Passed]
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_failure_skips_later_steps_by_default() {
        let executor = Arc::new(FakeExecutor::default());
        let template = JobTemplate::new("Linux")
            .with_step(StepSpec::script("fails", "exit 1"))
            .with_step(StepSpec::script("after", "echo x"))
            .with_step(
                StepSpec::script("cleanup", "echo c")
                    .with_guard(Condition::parse("always()").unwrap()),
            );

        let result = runner(&executor).run(&instance(template)).await;

        assert_eq!(
            statuses(&result),
            vec![StepStatus::Failed, StepStatus::Skipped, StepStatus::Passed]
        );
        assert!(!result.success());
        assert_eq!(
            result.steps[0].error.as_deref(),
            Some("process exited with code 1")
        );
    }

    #[tokio::test]
    async fn test_warn_policy_keeps_job_passing() {
        let executor = Arc::new(FakeExecutor::default());
        let template = JobTemplate::new("Linux")
            .with_step(StepSpec::script("flaky", "exit 2").with_policy(FailurePolicy::Warn))
            .with_step(StepSpec::script("next", "echo ok"));

        let result = runner(&executor).run(&instance(template)).await;

        assert_eq!(statuses(&result), vec![StepStatus::Warning, StepStatus::Passed]);
        assert!(result.success());
        assert!(result.has_warnings());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_yields_one_timed_out_then_skips() {
        let executor = Arc::new(FakeExecutor::default());
        let template = JobTemplate::new("Linux")
            .with_timeout(Duration::from_secs(1))
            .with_step(StepSpec::script("quick", "echo fast"))
            .with_step(StepSpec::script("slow", "sleep 5000"))
            .with_step(
                StepSpec::script("cleanup", "echo c")
                    .with_guard(Condition::parse("always()").unwrap()),
            );

        let result = runner(&executor).run(&instance(template)).await;

        assert_eq!(
            statuses(&result),
            vec![StepStatus::Passed, StepStatus::TimedOut, StepStatus::Skipped]
        );
        assert!(!result.success());
        assert!(result.timed_out());
        assert_eq!(result.steps[2].skip_reason.as_deref(), Some("job timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_applies_failure_policy() {
        let executor = Arc::new(FakeExecutor::default());
        let template = JobTemplate::new("Linux")
            .with_step(
                StepSpec::script("slow", "sleep 5000")
                    .with_timeout(Duration::from_millis(100))
                    .with_policy(FailurePolicy::Warn),
            )
            .with_step(StepSpec::script("next", "echo ok"));

        let result = runner(&executor).run(&instance(template)).await;

        assert_eq!(statuses(&result), vec![StepStatus::Warning, StepStatus::Passed]);
        assert!(result.steps[0].error.as_deref().unwrap().contains("step timed out"));
    }

    #[tokio::test]
    async fn test_disabled_step_is_skipped() {
        let executor = Arc::new(FakeExecutor::default());
        let mut disabled = StepSpec::script("off", "exit 1");
        disabled.enabled = false;
        let template = JobTemplate::new("Linux").with_step(disabled);

        let result = runner(&executor).run(&instance(template)).await;

        assert_eq!(statuses(&result), vec![StepStatus::Skipped]);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logging_commands_thread_to_later_steps() {
        let executor = Arc::new(FakeExecutor::default());
        let template = JobTemplate::new("Linux")
            .with_step(StepSpec::script(
                "set",
                "echo ##vso[task.setvariable variable=RUN_SLOW]yes\necho ##vso[task.prependpath]/opt/bin",
            ))
            .with_step(
                StepSpec::script("use", "echo $(RUN_SLOW)")
                    .with_guard(Condition::parse("eq(variables.RUN_SLOW, 'YES')").unwrap()),
            );

        let result = runner(&executor).run(&instance(template)).await;

        assert_eq!(statuses(&result), vec![StepStatus::Passed, StepStatus::Passed]);
        assert_eq!(executor.scripts.lock().unwrap()[1], "echo yes");
        let envs = executor.envs.lock().unwrap();
        assert_eq!(envs[1]["RUN_SLOW"], "yes");
        assert!(envs[1]["PATH"].starts_with("/opt/bin"));
    }

    #[tokio::test]
    async fn test_task_complete_overrides_outcome() {
        let executor = Arc::new(FakeExecutor::default());
        let template = JobTemplate::new("Linux")
            .with_step(StepSpec::script(
                "issues",
                "echo ##vso[task.logissue type=warning]deprecated API\necho ##vso[task.complete result=SucceededWithIssues]",
            ))
            .with_step(StepSpec::script(
                "reports failure",
                "echo ##vso[task.complete result=Failed]",
            ));

        let result = runner(&executor).run(&instance(template)).await;

        assert_eq!(statuses(&result), vec![StepStatus::Warning, StepStatus::Failed]);
        assert_eq!(result.steps[0].issues.len(), 1);
        assert_eq!(result.steps[0].issues[0].kind, IssueKind::Warning);
    }

    #[tokio::test]
    async fn test_ambient_and_matrix_variables_exported() {
        let executor = Arc::new(FakeExecutor::default());
        let template = JobTemplate::new("Linux")
            .with_variable("python.version", "3.9")
            .with_step(StepSpec::script("env", "echo x"));

        let result = StepRunner::new(executor.clone())
            .with_ambient(Arc::new(StaticEnv::new().with("CONDA", "/opt/conda")))
            .run(&instance(template))
            .await;

        assert!(result.success());
        let envs = executor.envs.lock().unwrap();
        assert_eq!(envs[0]["PYTHON_VERSION"], "3.9");
        assert_eq!(envs[0]["CONDA"], "/opt/conda");
        assert_eq!(envs[0]["TEST_WITH_XVFB"], "");
    }

    #[tokio::test]
    async fn test_secret_values_never_reported() {
        let executor = Arc::new(FakeExecutor::default());
        let (tx, mut rx) = progress_channel();
        let template = JobTemplate::new("Linux")
            .with_step(StepSpec::script(
                "login",
                "echo ##vso[task.setvariable variable=token;issecret=true]hunter2",
            ))
            .with_step(StepSpec::script("use", "echo using $(token)"));

        let result = runner(&executor)
            .with_progress(tx)
            .run(&instance(template))
            .await;

        assert!(result.success());
        assert_eq!(executor.scripts.lock().unwrap()[1], "echo using hunter2");
        assert!(result.steps.iter().all(|s| !s.stdout.contains("hunter2")));
        assert_eq!(result.steps[1].stdout, "using ***");

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(format!("{:?}", event));
        }
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| !e.contains("hunter2")), "{:?}", events);
    }

    #[tokio::test]
    async fn test_emits_progress_events() {
        let executor = Arc::new(FakeExecutor::default());
        let (tx, mut rx) = progress_channel();
        let template = JobTemplate::new("Linux").with_step(StepSpec::script("one", "echo hi"));

        runner(&executor)
            .with_progress(tx)
            .run(&instance(template))
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(matches!(events.first(), Some(ExecutionEvent::JobStarted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::StepOutput { output, .. } if output == "hi")));
        assert!(matches!(events.last(), Some(ExecutionEvent::JobCompleted { .. })));
    }
}
