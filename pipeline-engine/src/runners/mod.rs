// Runners Module
// The command-executor seam between the step runner and the processes it starts

pub mod shell;

pub use shell::{Shell, ShellExecutor};

use crate::error::ExecError;

use std::collections::HashMap;
use std::path::Path;

/// One step body ready to run
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    pub shell: Shell,
    /// Body with macros already expanded
    pub script: &'a str,
    pub env: &'a HashMap<String, String>,
    pub working_dir: &'a Path,
}

/// What a finished command produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs step bodies. Implementations must be cancel-safe: dropping the
/// returned future must stop the underlying work.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: CommandRequest<'_>) -> Result<CommandOutput, ExecError>;
}
