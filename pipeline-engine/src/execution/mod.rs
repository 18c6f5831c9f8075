// Execution Engine Module
// Matrix expansion, per-job step running and concurrent scheduling of job instances

pub mod commands;
pub mod environment;
pub mod events;
pub mod matrix;
pub mod runner;
pub mod scheduler;

pub use commands::{LoggingCommand, TaskResult};
pub use environment::{
    env_var_name, EnvLookup, JobEnvironment, LayeredEnv, ProcessEnv, StaticEnv,
    DEFAULT_AMBIENT_VARIABLES,
};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use matrix::{AxisValue, MatrixAxis, MatrixExpander};
pub use runner::{RunnerConfig, StepRunner};
pub use scheduler::MatrixScheduler;
