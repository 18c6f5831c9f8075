use super::load_plan;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use serde_json::json;

/// List the job instances a pipeline expands to
#[derive(Args, Debug)]
pub struct MatrixArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Only expand the named job (can be repeated)
    #[arg(long, value_name = "JOB")]
    pub job: Vec<String>,

    /// Print the instances as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: MatrixArgs) -> Result<()> {
    let plan = load_plan(&args.pipeline, &args.job)?;

    let instances = match plan.expand() {
        Ok(instances) => instances,
        Err(err) => {
            output::error(&err.to_string());
            std::process::exit(1);
        }
    };

    if args.json {
        let listing: Vec<_> = instances
            .iter()
            .map(|instance| {
                json!({
                    "name": instance.name,
                    "job": instance.template.name,
                    "index": instance.index,
                    "bindings": instance.bindings,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    output::header(&format!("{} job instance(s)", instances.len()));
    for instance in &instances {
        println!("  {}", instance.name);
        for (name, value) in &instance.bindings {
            output::dim(&format!("      {} = {}", name, value));
        }
    }

    Ok(())
}
