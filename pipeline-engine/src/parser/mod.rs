// Parser module for pipeline files
// YAML schema, template parameter resolution and loading into job templates

pub mod error;
pub mod loader;
pub mod models;
pub mod template;

pub use error::{ParseError, ParseErrorKind, ParseResult};
pub use loader::{PipelineLoader, PipelinePlan, PlannedJob};
pub use models::{Job, JobEntry, PipelineFile, Pool, ScalarValue, Step, StepAction, Strategy};
pub use template::{Parameter, ParameterType, TemplateEngine};
