use super::load_plan;
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use pipeline_engine::execution::DEFAULT_AMBIENT_VARIABLES;
use pipeline_engine::{
    progress_channel, ExecutionEvent, JobStatus, LayeredEnv, MatrixScheduler, ProcessEnv,
    RunReport, RunnerConfig, ShellExecutor, StaticEnv, StepRunner, StepStatus,
};

/// Run a pipeline's matrix jobs locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Set an ambient variable (can be repeated, format: NAME=VALUE)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Run only the named job (can be repeated)
    #[arg(long, value_name = "JOB")]
    pub job: Vec<String>,

    /// Maximum number of job instances running at once
    #[arg(long, env = "CIRUN_MAX_PARALLEL", value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Override every job's timeout
    #[arg(long, value_name = "MINUTES")]
    pub timeout: Option<u64>,

    /// Working directory for execution
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Extra ambient variable exported to every step (can be repeated)
    #[arg(long = "ambient", value_name = "NAME")]
    pub ambient: Vec<String>,

    /// Print the run report as JSON instead of progress
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    // Parse variables from --var flags
    let mut overrides = StaticEnv::new();
    for var_str in &args.variables {
        match var_str.split_once('=') {
            Some((name, value)) if !name.is_empty() => overrides.insert(name, value),
            _ => bail!("Invalid variable format '{}'. Expected NAME=VALUE", var_str),
        }
    }

    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    let plan = load_plan(&args.pipeline, &args.job)?;
    let instances = match plan.expand() {
        Ok(instances) => instances,
        Err(err) => {
            output::error(&err.to_string());
            std::process::exit(1);
        }
    };

    let mut ambient_variables: Vec<String> = DEFAULT_AMBIENT_VARIABLES
        .iter()
        .map(|name| name.to_string())
        .collect();
    for name in args.ambient {
        if !ambient_variables.contains(&name) {
            ambient_variables.push(name);
        }
    }

    let job_timeout = match args.timeout {
        Some(minutes) => match minutes.checked_mul(60) {
            Some(secs) => Some(Duration::from_secs(secs)),
            None => bail!("--timeout {} is out of range", minutes),
        },
        None => None,
    };

    let config = RunnerConfig {
        working_dir,
        ambient_variables,
        job_timeout,
        max_parallel: args.max_parallel,
    };

    if !args.json {
        let name = plan.name.clone().unwrap_or_else(|| {
            args.pipeline
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("pipeline")
                .to_string()
        });
        output::info(&format!(
            "Pipeline '{}': {} jobs, {} instances",
            name,
            plan.jobs.len(),
            instances.len()
        ));
    }

    // --var values shadow the process environment
    let ambient = LayeredEnv::new()
        .layer(Arc::new(overrides))
        .layer(Arc::new(ProcessEnv));

    let (tx, mut rx) = progress_channel();
    let runner = StepRunner::new(Arc::new(ShellExecutor::new()))
        .with_ambient(Arc::new(ambient))
        .with_config(config)
        .with_progress(tx);
    let scheduler = MatrixScheduler::new(runner);

    // Spawn execution in background
    let run_handle = tokio::spawn(async move { scheduler.run_all(instances).await });

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        if !args.json {
            print_event(&event);
        }
    }

    let report = run_handle.await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if !report.success() {
        std::process::exit(1);
    }

    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { total_jobs } => {
            println!();
            output::header(&format!("Running {} job instance(s)", total_jobs));
        }

        ExecutionEvent::RunCompleted { success, duration } => {
            println!();
            if *success {
                output::success(&format!(
                    "Run completed successfully in {:.2}s",
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!(
                    "Run failed after {:.2}s",
                    duration.as_secs_f64()
                ));
            }
        }

        ExecutionEvent::JobStarted { job, total_steps } => {
            output::job_header(job, *total_steps);
        }

        ExecutionEvent::JobCompleted {
            job,
            status,
            duration,
        } => {
            let line = format!(
                "  Job '{}' {} ({:.2}s)",
                job,
                if *status == JobStatus::Passed { "OK" } else { "FAIL" },
                duration.as_secs_f64()
            );
            if *status == JobStatus::Passed {
                output::dim_success(&line);
            } else {
                output::dim_failure(&line);
            }
        }

        ExecutionEvent::StepStarted {
            job,
            step_index,
            display_name,
        } => {
            output::status(&format!("[{}]", step_index + 1), &format!("{} :: {}", job, display_name));
        }

        ExecutionEvent::StepOutput {
            job,
            output: text,
            is_error,
            ..
        } => {
            for line in text.lines() {
                if *is_error {
                    output::step_error(job, line);
                } else {
                    output::step_output(job, line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            job,
            step_index,
            status,
            duration,
            exit_code,
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "      {} step {} {} ({:.2}s){}",
                job,
                step_index + 1,
                status_label(*status),
                duration.as_secs_f64(),
                exit_info
            );
            match status {
                StepStatus::Passed => output::dim_success(&line),
                StepStatus::Warning => output::dim_warning(&line),
                StepStatus::Skipped => output::dim(&line),
                StepStatus::Failed | StepStatus::TimedOut => output::dim_failure(&line),
            }
        }

        ExecutionEvent::StepSkipped {
            job,
            display_name,
            reason,
            ..
        } => {
            output::dim(&format!("      {} :: {} skipped: {}", job, display_name, reason));
        }

        ExecutionEvent::VariableSet {
            job, name, value, ..
        } => {
            output::dim(&format!("      [{}] [var] {} = {}", job, name, value));
        }

        ExecutionEvent::Issue { job, issue, .. } => {
            output::warning(&format!("[{}] {:?}: {}", job, issue.kind, issue.message));
        }
    }
}

fn print_summary(report: &RunReport) {
    println!();
    output::header("Summary");
    for job in &report.jobs {
        let counts = format!(
            "{} passed, {} warning, {} skipped, {} failed",
            job.count(StepStatus::Passed),
            job.count(StepStatus::Warning),
            job.count(StepStatus::Skipped),
            job.count(StepStatus::Failed) + job.count(StepStatus::TimedOut),
        );
        let line = format!("{} ({}) in {:.2}s", job.name, counts, job.duration.as_secs_f64());
        if !job.success() {
            output::failure(&line);
        } else if job.has_warnings() {
            output::warning(&line);
        } else {
            output::check(&line);
        }

        for step in job.steps.iter().filter(|s| s.status.is_failure()) {
            if let Some(error) = &step.error {
                output::dim_failure(&format!("      {}: {}", step.display_name, error));
            }
        }
    }

    println!(
        "\n{} passed, {} failed",
        report.passed(),
        report.failed()
    );
}

fn status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Passed => "OK",
        StepStatus::Failed => "FAIL",
        StepStatus::Warning => "WARN",
        StepStatus::Skipped => "SKIP",
        StepStatus::TimedOut => "TIMEOUT",
    }
}
