// Engine Domain Model
// Job templates, matrix-bound job instances and their execution results

use crate::expression::Condition;
use crate::runners::Shell;

use indexmap::IndexMap;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Job timeout when the pipeline does not set `timeoutInMinutes`
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Job timeout used for `timeoutInMinutes: 0`
pub const MAX_JOB_TIMEOUT: Duration = Duration::from_secs(360 * 60);

/// A parameterized job definition.
///
/// Immutable once loaded; every matrix instance shares it through an `Arc`.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub name: String,
    pub display_name: Option<String>,
    pub vm_image: Option<String>,
    pub steps: Vec<StepSpec>,
    pub variables: IndexMap<String, String>,
    pub timeout: Duration,
    /// Upper bound on concurrently running instances of this template
    pub max_parallel: Option<usize>,
}

impl JobTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            vm_image: None,
            steps: Vec::new(),
            variables: IndexMap::new(),
            timeout: DEFAULT_JOB_TIMEOUT,
            max_parallel: None,
        }
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    /// Name shown to users
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// What a failing step does to its job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record `Failed` and fail the job
    #[default]
    Fail,
    /// Record `Warning`; the job continues as if the step passed
    Warn,
}

impl FailurePolicy {
    /// Status recorded for a step that did not succeed
    pub fn failure_status(self) -> StepStatus {
        match self {
            FailurePolicy::Fail => StepStatus::Failed,
            FailurePolicy::Warn => StepStatus::Warning,
        }
    }
}

/// A single unit of work inside a job
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: Option<String>,
    pub display_name: String,
    pub shell: Shell,
    /// Shell body, may contain `$(VAR)` macros
    pub body: String,
    pub guard: Option<Condition>,
    /// Optional component tag for reporting
    pub component: Option<String>,
    pub failure_policy: FailurePolicy,
    pub env: IndexMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub enabled: bool,
    pub timeout: Option<Duration>,
}

impl StepSpec {
    pub fn new(shell: Shell, display_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: None,
            display_name: display_name.into(),
            shell,
            body: body.into(),
            guard: None,
            component: None,
            failure_policy: FailurePolicy::Fail,
            env: IndexMap::new(),
            working_directory: None,
            enabled: true,
            timeout: None,
        }
    }

    /// `script:` step, run by `sh`
    pub fn script(display_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Shell::Sh, display_name, body)
    }

    /// `bash:` step
    pub fn bash(display_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Shell::Bash, display_name, body)
    }

    pub fn with_guard(mut self, guard: Condition) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A template bound to one matrix cell
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Unique display name, e.g. `Linux (python.version=3.8)`
    pub name: String,
    /// Row-major position within its template's expansion
    pub index: usize,
    pub template: Arc<JobTemplate>,
    /// Axis variables chosen for this cell, in axis order
    pub bindings: IndexMap<String, String>,
    /// Template variables overlaid with `bindings`
    pub variables: IndexMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Warning,
    Skipped,
    TimedOut,
}

impl StepStatus {
    /// Whether this status fails the enclosing job
    pub fn is_failure(self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::TimedOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Warning,
    Error,
}

/// A `##vso[task.logissue]` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
}

/// Outcome of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: Option<String>,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
    #[serde(serialize_with = "serialize_seconds")]
    pub duration: Duration,
}

impl StepResult {
    pub fn new(step: &StepSpec, status: StepStatus) -> Self {
        Self {
            name: step.name.clone(),
            display_name: step.display_name.clone(),
            component: step.component.clone(),
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            skip_reason: None,
            issues: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn skipped(step: &StepSpec, reason: impl Into<String>) -> Self {
        let mut result = Self::new(step, StepStatus::Skipped);
        result.skip_reason = Some(reason.into());
        result
    }
}

/// Aggregate status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Passed,
    Failed,
}

impl JobStatus {
    /// `Failed` if any step failed or timed out. Warnings and skips do not fail a job.
    pub fn from_steps(steps: &[StepResult]) -> Self {
        if steps.iter().any(|s| s.status.is_failure()) {
            JobStatus::Failed
        } else {
            JobStatus::Passed
        }
    }
}

/// Outcome of one job instance.
///
/// The job status is always derived from the step statuses, never stored.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub name: String,
    /// Name of the template the instance came from
    pub job: String,
    pub index: usize,
    pub bindings: IndexMap<String, String>,
    pub steps: Vec<StepResult>,
    pub duration: Duration,
}

impl JobResult {
    /// Result for an instance whose task died before producing step results
    pub fn aborted(instance: &JobInstance, reason: impl Into<String>) -> Self {
        let step = StepResult {
            name: None,
            display_name: "job aborted".to_string(),
            component: None,
            status: StepStatus::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(reason.into()),
            skip_reason: None,
            issues: Vec::new(),
            duration: Duration::ZERO,
        };

        Self {
            name: instance.name.clone(),
            job: instance.template.name.clone(),
            index: instance.index,
            bindings: instance.bindings.clone(),
            steps: vec![step],
            duration: Duration::ZERO,
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_steps(&self.steps)
    }

    pub fn success(&self) -> bool {
        self.status() == JobStatus::Passed
    }

    pub fn has_warnings(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Warning)
    }

    pub fn timed_out(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::TimedOut)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

impl Serialize for JobResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("JobResult", 7)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("job", &self.job)?;
        state.serialize_field("index", &self.index)?;
        state.serialize_field("bindings", &self.bindings)?;
        state.serialize_field("status", &self.status())?;
        state.serialize_field("duration", &self.duration.as_secs_f64())?;
        state.serialize_field("steps", &self.steps)?;
        state.end()
    }
}

/// Results of every job instance in a run, in expansion order
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub jobs: Vec<JobResult>,
    pub duration: Duration,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.jobs.iter().all(JobResult::success)
    }

    pub fn passed(&self) -> usize {
        self.jobs.iter().filter(|j| j.success()).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.len() - self.passed()
    }

    pub fn job(&self, name: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

impl Serialize for RunReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("RunReport", 5)?;
        state.serialize_field("success", &self.success())?;
        state.serialize_field("passed", &self.passed())?;
        state.serialize_field("failed", &self.failed())?;
        state.serialize_field("duration", &self.duration.as_secs_f64())?;
        state.serialize_field("jobs", &self.jobs)?;
        state.end()
    }
}

fn serialize_seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
