// CLI subcommands

pub mod matrix;
pub mod run;
pub mod validate;

use crate::output;

use std::path::Path;

use color_eyre::eyre::bail;
use color_eyre::Result;

use pipeline_engine::{PipelineLoader, PipelinePlan};

/// Load a pipeline and narrow it to `jobs` (all jobs when empty).
///
/// Configuration errors are printed with their location and suggestion,
/// then the process exits with status 1.
pub fn load_plan(path: &Path, jobs: &[String]) -> Result<PipelinePlan> {
    if !path.exists() {
        bail!("Pipeline file not found: {}", path.display());
    }

    output::status("Loading", &path.display().to_string());

    let loaded = PipelineLoader::load_file(path).and_then(|mut plan| {
        plan.retain_jobs(jobs)?;
        Ok(plan)
    });

    match loaded {
        Ok(plan) => Ok(plan),
        Err(err) => {
            output::error(&err.to_string());
            std::process::exit(1);
        }
    }
}
