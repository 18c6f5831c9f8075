// Pipeline Engine Library
// Loads Azure-style matrix job templates, expands them and runs their steps

pub mod error;
pub mod execution;
pub mod expression;
pub mod model;
pub mod parser;
pub mod runners;

// Re-export commonly used types
pub use error::{ConfigError, EngineResult, ExecError};

pub use model::{
    FailurePolicy, Issue, IssueKind, JobInstance, JobResult, JobStatus, JobTemplate, RunReport,
    StepResult, StepSpec, StepStatus,
};

// Re-export parser types
pub use parser::{ParseError, ParseErrorKind, PipelineLoader, PipelinePlan, PlannedJob};

// Re-export expression types
pub use expression::{Condition, ConditionEnv, JobState};

// Re-export execution types
pub use execution::{
    progress_channel, EnvLookup, ExecutionEvent, LayeredEnv, MatrixAxis, MatrixExpander,
    MatrixScheduler, ProcessEnv, ProgressReceiver, ProgressSender, RunnerConfig, StaticEnv,
    StepRunner,
};

// Re-export runner types
pub use runners::{CommandExecutor, CommandOutput, CommandRequest, Shell, ShellExecutor};
