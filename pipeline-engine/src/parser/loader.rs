// Pipeline Loader
// Reads a pipeline file, resolves its job templates and builds a plan of templates and matrix axes

use crate::error::{ConfigError, EngineResult};
use crate::execution::matrix::{MatrixAxis, MatrixExpander};
use crate::expression::Condition;
use crate::model::{
    FailurePolicy, JobInstance, JobTemplate, StepSpec, DEFAULT_JOB_TIMEOUT, MAX_JOB_TIMEOUT,
};
use crate::parser::error::ParseError;
use crate::parser::models::{Job, JobEntry, PipelineFile, ScalarValue, Step, StepAction};
use crate::parser::template::TemplateEngine;
use crate::runners::Shell;

use indexmap::IndexMap;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Name given to the job of a pipeline that only lists top-level `steps:`
const SHORTHAND_JOB_NAME: &str = "Job";

/// One job of the pipeline, ready for matrix expansion
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub template: Arc<JobTemplate>,
    pub axes: Vec<MatrixAxis>,
}

impl PlannedJob {
    pub fn expand(&self) -> EngineResult<Vec<JobInstance>> {
        MatrixExpander::expand(&self.template, &self.axes)
    }
}

/// A loaded pipeline: every job template with its matrix, nothing run yet
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub name: Option<String>,
    pub jobs: Vec<PlannedJob>,
}

impl PipelinePlan {
    /// Expand every job. Any configuration error aborts the whole plan.
    pub fn expand(&self) -> EngineResult<Vec<JobInstance>> {
        let mut instances = Vec::new();
        let mut names = HashSet::new();
        for job in &self.jobs {
            for instance in job.expand()? {
                if !names.insert(instance.name.clone()) {
                    return Err(ConfigError::DuplicateInstance {
                        job: job.template.name.clone(),
                        name: instance.name,
                    });
                }
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    /// Keep only the named jobs; an unknown name is an error
    pub fn retain_jobs(&mut self, names: &[String]) -> EngineResult<()> {
        if names.is_empty() {
            return Ok(());
        }

        if let Some(missing) = names
            .iter()
            .find(|name| !self.jobs.iter().any(|job| &job.template.name == *name))
        {
            return Err(ConfigError::invalid_job(
                missing.as_str(),
                "no such job in pipeline",
            ));
        }

        self.jobs
            .retain(|job| names.iter().any(|name| name == &job.template.name));
        Ok(())
    }

    pub fn job(&self, name: &str) -> Option<&PlannedJob> {
        self.jobs.iter().find(|job| job.template.name == name)
    }
}

pub struct PipelineLoader;

impl PipelineLoader {
    /// Load a pipeline file; template paths resolve against its directory
    pub fn load_file(path: impl AsRef<Path>) -> EngineResult<PipelinePlan> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::parse(&content, &base_dir)
            .map_err(|err| attach_file(err, &path.display().to_string()))
    }

    /// Load pipeline YAML held in memory
    pub fn load_str(content: &str, base_dir: impl AsRef<Path>) -> EngineResult<PipelinePlan> {
        Self::parse(content, base_dir.as_ref())
    }

    fn parse(content: &str, base_dir: &Path) -> EngineResult<PipelinePlan> {
        let mut file: PipelineFile = serde_yaml::from_str(content)
            .map_err(|e| ParseError::from_yaml_error(&e, content))?;
        let name = file.name.take();
        let root_variables = std::mem::take(&mut file.variables);

        let templates = TemplateEngine::new(base_dir);
        let jobs = Self::collect_jobs(file, &templates)?;

        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(jobs.len());
        for job in jobs {
            if !seen.insert(job.job.clone()) {
                return Err(ConfigError::invalid_job(
                    job.job.as_str(),
                    "job name is defined more than once",
                ));
            }
            planned.push(build_job(job, &root_variables)?);
        }

        info!(
            pipeline = name.as_deref().unwrap_or("<unnamed>"),
            jobs = planned.len(),
            "loaded pipeline"
        );

        Ok(PipelinePlan {
            name,
            jobs: planned,
        })
    }

    fn collect_jobs(file: PipelineFile, templates: &TemplateEngine) -> EngineResult<Vec<Job>> {
        match (file.jobs.is_empty(), file.steps.is_empty()) {
            (false, false) => {
                Err(ParseError::new("a pipeline cannot define both 'jobs' and 'steps'", 0, 0)
                    .with_suggestion("move the top-level steps into a job under 'jobs:'")
                    .into())
            }
            (true, true) => Err(ParseError::new("pipeline defines no jobs", 0, 0)
                .with_suggestion("add a 'jobs:' list or top-level 'steps:'")
                .into()),
            (true, false) => Ok(vec![Job {
                job: SHORTHAND_JOB_NAME.to_string(),
                display_name: None,
                pool: file.pool,
                variables: IndexMap::new(),
                strategy: file.strategy,
                timeout_in_minutes: file.timeout_in_minutes,
                steps: file.steps,
            }]),
            (false, true) => {
                let mut jobs = Vec::new();
                for entry in file.jobs {
                    match entry {
                        JobEntry::Job(job) => jobs.push(*job),
                        JobEntry::Template(reference) => {
                            debug!(template = %reference.template, "expanding job template");
                            jobs.extend(
                                templates
                                    .expand_job_template(&reference.template, &reference.parameters)?,
                            );
                        }
                    }
                }
                Ok(jobs)
            }
        }
    }
}

fn attach_file(err: ConfigError, file: &str) -> ConfigError {
    match err {
        ConfigError::Parse(parse) if parse.file.is_none() => {
            ConfigError::Parse(parse.with_file(file))
        }
        other => other,
    }
}

/// Convert a deserialized job into a template plus its matrix axes
fn build_job(job: Job, root_variables: &IndexMap<String, String>) -> EngineResult<PlannedJob> {
    if job.steps.is_empty() {
        return Err(ConfigError::invalid_job(job.job.as_str(), "job has no steps"));
    }

    let mut variables = root_variables.clone();
    variables.extend(job.variables);

    let mut seen_names = HashSet::new();
    let mut steps = Vec::with_capacity(job.steps.len());
    for step in job.steps {
        if let Some(name) = &step.name {
            if !seen_names.insert(name.clone()) {
                return Err(ConfigError::invalid_job(
                    job.job.as_str(),
                    format!("step name '{}' is used more than once", name),
                ));
            }
        }
        steps.push(build_step(&job.job, step)?);
    }

    let strategy = job.strategy.unwrap_or_default();
    let mut axes = Vec::new();
    if !strategy.matrix.is_empty() {
        axes.push(MatrixAxis::cells(
            strategy
                .matrix
                .into_iter()
                .map(|(cell, bindings)| (cell, to_strings(bindings)))
                .collect(),
        ));
    }
    for (name, values) in strategy.axes {
        axes.push(MatrixAxis::scalar(
            name,
            values.into_iter().map(ScalarValue::into_string),
        ));
    }

    let timeout = match job.timeout_in_minutes {
        None => DEFAULT_JOB_TIMEOUT,
        Some(0) => MAX_JOB_TIMEOUT,
        Some(minutes) => minutes_to_duration(minutes).ok_or_else(|| {
            ConfigError::invalid_job(
                job.job.as_str(),
                format!("timeoutInMinutes {} is out of range", minutes),
            )
        })?,
    };

    let template = JobTemplate {
        name: job.job,
        display_name: job.display_name,
        vm_image: job.pool.as_ref().and_then(|p| p.vm_image()).map(str::to_string),
        steps,
        variables,
        timeout,
        max_parallel: strategy.max_parallel.filter(|limit| *limit > 0),
    };

    Ok(PlannedJob {
        template: Arc::new(template),
        axes,
    })
}

fn build_step(job: &str, step: Step) -> EngineResult<StepSpec> {
    let shell = match &step.action {
        StepAction::Script(_) => Shell::Sh,
        StepAction::Bash(_) => Shell::Bash,
    };
    let body = step.action.body().to_string();
    let display_name = step
        .display_name
        .clone()
        .or_else(|| step.name.clone())
        .unwrap_or_else(|| default_display_name(shell, &body));

    let guard = step
        .condition
        .as_deref()
        .map(|source| {
            Condition::parse(source).map_err(|e| ConfigError::InvalidCondition {
                step: display_name.clone(),
                condition: source.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()?;

    let mut spec = StepSpec::new(shell, display_name, body);
    spec.name = step.name;
    spec.guard = guard;
    spec.component = step.component;
    spec.failure_policy = if step.continue_on_error {
        FailurePolicy::Warn
    } else {
        FailurePolicy::Fail
    };
    spec.env = to_strings(step.env);
    spec.working_directory = step.action.working_directory().map(PathBuf::from);
    spec.enabled = step.enabled;
    spec.timeout = match step.timeout_in_minutes {
        None | Some(0) => None,
        Some(minutes) => Some(minutes_to_duration(minutes).ok_or_else(|| {
            ConfigError::invalid_job(
                job,
                format!(
                    "step '{}' has timeoutInMinutes {} out of range",
                    spec.display_name, minutes
                ),
            )
        })?),
    };

    Ok(spec)
}

fn minutes_to_duration(minutes: u64) -> Option<Duration> {
    minutes.checked_mul(60).map(Duration::from_secs)
}

/// `Bash: <first line>` style label for steps without a display name
fn default_display_name(shell: Shell, body: &str) -> String {
    let first_line = body.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let label = match shell {
        Shell::Sh => "CmdLine",
        Shell::Bash => "Bash",
    };
    if first_line.is_empty() {
        label.to_string()
    } else {
        format!("{}: {}", label, first_line)
    }
}

fn to_strings(values: IndexMap<String, ScalarValue>) -> IndexMap<String, String> {
    values
        .into_iter()
        .map(|(key, value)| (key, value.into_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::NAMED_CELLS_AXIS;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_files(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            let mut file = fs::File::create(&path).unwrap();
            file.write_all(content.as_bytes()).unwrap();
        }
        dir
    }

    const ROOT: &str = r#"
name: dipy-ci
variables:
  DEPENDS: cython numpy
  VENV_ARGS: --python=python3
jobs:
- template: ci/linux.yml
  parameters:
    name: Linux
    vmImage: ubuntu-latest
    matrix:
      Python38:
        python.version: '3.8'
      Python39-full:
        python.version: '3.9'
        TEST_WITH_XVFB: '1'
"#;

    const LINUX: &str = r#"
parameters:
  name: ''
  vmImage: ''
  matrix: []

jobs:
- job: ${{ parameters.name }}
  timeoutInMinutes: 120
  pool:
    vmImage: ${{ parameters.vmImage }}
  variables:
    TEST_DIR: tmp_for_test
  strategy:
    maxParallel: 2
    matrix:
      ${{ insert }}: ${{ parameters.matrix }}
  steps:
  - script: python -m pip install $(DEPENDS)
    displayName: 'Install dependencies'
  - bash: xvfb-run pytest
    displayName: 'Run tests under xvfb'
    condition: eq(variables['TEST_WITH_XVFB'], '1')
  - script: pytest
    continueOnError: true
"#;

    #[test]
    fn test_load_file_resolves_template() {
        let dir = write_files(&[("azure-pipelines.yml", ROOT), ("ci/linux.yml", LINUX)]);
        let plan = PipelineLoader::load_file(dir.path().join("azure-pipelines.yml")).unwrap();

        assert_eq!(plan.name.as_deref(), Some("dipy-ci"));
        assert_eq!(plan.jobs.len(), 1);

        let job = &plan.jobs[0];
        let template = &job.template;
        assert_eq!(template.name, "Linux");
        assert_eq!(template.vm_image.as_deref(), Some("ubuntu-latest"));
        assert_eq!(template.timeout, Duration::from_secs(120 * 60));
        assert_eq!(template.max_parallel, Some(2));
        assert_eq!(template.variables["DEPENDS"], "cython numpy");
        assert_eq!(template.variables["TEST_DIR"], "tmp_for_test");

        assert_eq!(template.steps.len(), 3);
        assert_eq!(template.steps[0].shell, Shell::Sh);
        assert_eq!(template.steps[1].shell, Shell::Bash);
        assert!(template.steps[1].guard.is_some());
        assert_eq!(template.steps[2].failure_policy, FailurePolicy::Warn);
        assert_eq!(template.steps[2].display_name, "CmdLine: pytest");

        assert_eq!(job.axes.len(), 1);
        assert_eq!(job.axes[0].name, NAMED_CELLS_AXIS);
    }

    #[test]
    fn test_plan_expands_named_cells() {
        let dir = write_files(&[("azure-pipelines.yml", ROOT), ("ci/linux.yml", LINUX)]);
        let plan = PipelineLoader::load_file(dir.path().join("azure-pipelines.yml")).unwrap();

        let instances = plan.expand().unwrap();
        let names: Vec<&str> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Linux (Python38)", "Linux (Python39-full)"]);
        assert_eq!(instances[1].variables["TEST_WITH_XVFB"], "1");
        assert_eq!(instances[0].variables["python.version"], "3.8");
    }

    #[test]
    fn test_shorthand_steps_with_axes() {
        let yaml = r#"
strategy:
  axes:
    python.version: [3.8, 3.9]
    os: [linux]
steps:
- script: echo $(python.version)
"#;
        let plan = PipelineLoader::load_str(yaml, ".").unwrap();

        assert_eq!(plan.jobs[0].template.name, SHORTHAND_JOB_NAME);
        let instances = plan.expand().unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].name, "Job (python.version=3.8, os=linux)");
    }

    #[test]
    fn test_invalid_condition_is_config_error() {
        let yaml = r#"
jobs:
- job: Linux
  steps:
  - script: 'true'
    displayName: Broken
    condition: eq(variables['A'],
"#;
        let err = PipelineLoader::load_str(yaml, ".").unwrap_err();
        match err {
            ConfigError::InvalidCondition { step, .. } => assert_eq!(step, "Broken"),
            other => panic!("expected InvalidCondition, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_job_names_rejected() {
        let yaml = r#"
jobs:
- job: Linux
  steps: [{ script: 'true' }]
- job: Linux
  steps: [{ script: 'true' }]
"#;
        let err = PipelineLoader::load_str(yaml, ".").unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_yaml_syntax_error_has_location() {
        let dir = write_files(&[("bad.yml", "jobs:\n  - job: [unclosed\n")]);
        let err = PipelineLoader::load_file(dir.path().join("bad.yml")).unwrap_err();
        match err {
            ConfigError::Parse(parse) => {
                assert!(parse.line > 0);
                assert!(parse.file.as_deref().unwrap().ends_with("bad.yml"));
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_axis_fails_expansion() {
        let yaml = r#"
jobs:
- job: Linux
  strategy:
    axes:
      python.version: []
  steps:
  - script: 'true'
"#;
        let plan = PipelineLoader::load_str(yaml, ".").unwrap();
        assert!(matches!(
            plan.expand().unwrap_err(),
            ConfigError::EmptyAxis { .. }
        ));
    }

    #[test]
    fn test_timeout_zero_means_maximum() {
        let yaml = "jobs:\n- job: Long\n  timeoutInMinutes: 0\n  steps:\n  - script: 'true'\n";
        let plan = PipelineLoader::load_str(yaml, ".").unwrap();
        assert_eq!(plan.jobs[0].template.timeout, MAX_JOB_TIMEOUT);
    }

    #[test]
    fn test_out_of_range_timeout_is_config_error() {
        let yaml = "jobs:\n- job: Long\n  timeoutInMinutes: 400000000000000000\n  steps:\n  - script: 'true'\n";
        let err = PipelineLoader::load_str(yaml, ".").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJob { ref job, .. } if job == "Long"));

        let yaml = "jobs:\n- job: Long\n  steps:\n  - script: 'true'\n    timeoutInMinutes: 400000000000000000\n";
        let err = PipelineLoader::load_str(yaml, ".").unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_instance_names_unique_across_jobs() {
        let yaml = r#"
jobs:
- job: Linux (py38)
  steps: [{ script: 'true' }]
- job: Linux
  strategy:
    matrix:
      py38:
        python.version: '3.8'
  steps: [{ script: 'true' }]
"#;
        let plan = PipelineLoader::load_str(yaml, ".").unwrap();
        match plan.expand().unwrap_err() {
            ConfigError::DuplicateInstance { job, name } => {
                assert_eq!(job, "Linux");
                assert_eq!(name, "Linux (py38)");
            }
            other => panic!("expected DuplicateInstance, got {:?}", other),
        }
    }

    #[test]
    fn test_retain_jobs() {
        let yaml = r#"
jobs:
- job: Linux
  steps: [{ script: 'true' }]
- job: Mac
  steps: [{ script: 'true' }]
"#;
        let mut plan = PipelineLoader::load_str(yaml, ".").unwrap();
        plan.retain_jobs(&["Mac".to_string()]).unwrap();
        assert_eq!(plan.jobs.len(), 1);
        assert!(plan.job("Mac").is_some());

        assert!(plan.retain_jobs(&["Windows".to_string()]).is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = PipelineLoader::load_file(dir.path().join("nope.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
