use super::load_plan;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

/// Check that a pipeline loads and every matrix expands
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let plan = load_plan(&args.pipeline, &[])?;
    output::check("YAML syntax and templates valid");

    let steps: usize = plan.jobs.iter().map(|j| j.template.steps.len()).sum();
    output::check(&format!(
        "Structure: {} jobs, {} steps",
        plan.jobs.len(),
        steps
    ));

    let mut errors = 0;
    for job in &plan.jobs {
        match job.expand() {
            Ok(instances) => output::check(&format!(
                "Job '{}' expands to {} instance(s)",
                job.template.label(),
                instances.len()
            )),
            Err(err) => {
                output::error(&err.to_string());
                errors += 1;
            }
        }
    }

    if errors > 0 {
        output::failure(&format!("{} job(s) failed to expand", errors));
        std::process::exit(1);
    }

    println!();
    output::success("Pipeline is valid");

    Ok(())
}
