// Pipeline File Models
// The subset of the Azure Pipelines YAML schema needed for matrix job templates

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};

/// Root pipeline file, after template parameters are resolved
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineFile {
    pub name: Option<String>,

    /// Pipeline-level variables, visible to every job
    #[serde(default, deserialize_with = "deserialize_variables")]
    pub variables: IndexMap<String, String>,

    #[serde(default)]
    pub jobs: Vec<JobEntry>,

    /// Shorthand: a single job given by top-level steps
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Default pool for the shorthand job
    pub pool: Option<Pool>,

    pub strategy: Option<Strategy>,

    pub timeout_in_minutes: Option<u64>,
}

/// A job template file: `parameters:` is consumed during resolution
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TemplateFile {
    #[serde(default)]
    pub jobs: Vec<Job>,
}

/// An entry under `jobs:`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JobEntry {
    /// `- template: ci/linux.yml` with `parameters:`
    Template(TemplateReference),
    /// `- job: Linux`
    Job(Box<Job>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateReference {
    pub template: String,
    #[serde(default)]
    pub parameters: IndexMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job: String,

    pub display_name: Option<String>,

    pub pool: Option<Pool>,

    #[serde(default, deserialize_with = "deserialize_variables")]
    pub variables: IndexMap<String, String>,

    pub strategy: Option<Strategy>,

    pub timeout_in_minutes: Option<u64>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Pool {
    /// `pool: my-pool`
    Name(String),
    /// `pool: { vmImage: ubuntu-latest }`
    Spec(PoolSpec),
}

impl Pool {
    pub fn vm_image(&self) -> Option<&str> {
        match self {
            Pool::Name(name) => Some(name),
            Pool::Spec(spec) => spec.vm_image.as_deref().or(spec.name.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    pub name: Option<String>,
    pub vm_image: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    /// Named cells: `matrix: { py38: { python.version: '3.8' } }`
    #[serde(default, deserialize_with = "deserialize_matrix")]
    pub matrix: IndexMap<String, IndexMap<String, ScalarValue>>,

    /// Scalar axes: `axes: { python.version: ['3.8', '3.9'] }`
    #[serde(default)]
    pub axes: IndexMap<String, Vec<ScalarValue>>,

    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Reference name
    pub name: Option<String>,

    pub display_name: Option<String>,

    pub condition: Option<String>,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub timeout_in_minutes: Option<u64>,

    #[serde(default)]
    pub env: IndexMap<String, ScalarValue>,

    /// Component tag for reporting
    pub component: Option<String>,

    #[serde(flatten)]
    pub action: StepAction,
}

fn default_true() -> bool {
    true
}

/// What a step runs
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StepAction {
    /// `- script: ...` (sh)
    Script(ScriptStep),
    /// `- bash: ...`
    Bash(BashStep),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptStep {
    pub script: String,
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashStep {
    pub bash: String,
    pub working_directory: Option<String>,
}

impl StepAction {
    pub fn body(&self) -> &str {
        match self {
            StepAction::Script(step) => &step.script,
            StepAction::Bash(step) => &step.bash,
        }
    }

    pub fn working_directory(&self) -> Option<&str> {
        match self {
            StepAction::Script(step) => step.working_directory.as_deref(),
            StepAction::Bash(step) => step.working_directory.as_deref(),
        }
    }
}

/// A YAML scalar read as text. Unquoted `3.10` stays `3.10`; booleans become `True`/`False`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarValue(pub String);

impl ScalarValue {
    pub fn into_string(self) -> String {
        self.0
    }
}

impl<'de> Deserialize<'de> for ScalarValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        scalar_to_string(&value)
            .map(ScalarValue)
            .ok_or_else(|| serde::de::Error::custom("expected a scalar value"))
    }
}

/// Text form of a YAML scalar, `None` for mappings and sequences
pub fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(true) => Some("True".to_string()),
        serde_yaml::Value::Bool(false) => Some("False".to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => None,
    }
}

/// `variables:` as a map or as a list of `{ name, value }` entries
fn deserialize_variables<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{MapAccess, SeqAccess, Visitor};

    #[derive(Deserialize)]
    struct NamedVariable {
        name: String,
        #[serde(default)]
        value: Option<ScalarValue>,
    }

    struct VariablesVisitor;

    impl<'de> Visitor<'de> for VariablesVisitor {
        type Value = IndexMap<String, String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a map of variables or a list of { name, value } entries")
        }

        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(IndexMap::new())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut vars = IndexMap::new();
            while let Some(var) = seq.next_element::<NamedVariable>()? {
                vars.insert(var.name, var.value.map(ScalarValue::into_string).unwrap_or_default());
            }
            Ok(vars)
        }

        fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut vars = IndexMap::new();
            while let Some((key, value)) = map.next_entry::<String, ScalarValue>()? {
                vars.insert(key, value.0);
            }
            Ok(vars)
        }
    }

    deserializer.deserialize_any(VariablesVisitor)
}

/// `matrix:` as named cells. An empty list or null means no matrix, which is
/// what an unset `${{ parameters.matrix }}` with a `[]` default produces.
fn deserialize_matrix<'de, D>(
    deserializer: D,
) -> Result<IndexMap<String, IndexMap<String, ScalarValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MatrixForm {
        Cells(IndexMap<String, IndexMap<String, ScalarValue>>),
        Empty(Vec<serde_yaml::Value>),
    }

    match Option::<MatrixForm>::deserialize(deserializer)? {
        Some(MatrixForm::Cells(cells)) => Ok(cells),
        Some(MatrixForm::Empty(items)) if items.is_empty() => Ok(IndexMap::new()),
        Some(MatrixForm::Empty(_)) => Err(serde::de::Error::custom(
            "matrix must be a mapping of named cells",
        )),
        None => Ok(IndexMap::new()),
    }
}
