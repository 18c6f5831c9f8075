// Template Resolution Engine
// Loads job templates and substitutes ${{ parameters.X }} and ${{ insert }} before deserialization

use crate::error::{ConfigError, EngineResult};
use crate::parser::error::ParseError;
use crate::parser::models::{scalar_to_string, Job, TemplateFile};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// A declared template parameter
#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParameterType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    StepList,
}

impl ParameterType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParameterType::String => {
                value.is_string() || value.is_number() || value.is_bool() || value.is_null()
            }
            ParameterType::Number => {
                value.is_number()
                    || value
                        .as_str()
                        .map(|s| s.parse::<f64>().is_ok())
                        .unwrap_or(false)
            }
            ParameterType::Boolean => {
                value.is_bool()
                    || value
                        .as_str()
                        .map(|s| s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false"))
                        .unwrap_or(false)
            }
            ParameterType::Object => true,
            ParameterType::StepList => value.is_sequence(),
        }
    }
}

/// Piece of a string split around `${{ ... }}`
#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Expression(&'a str),
}

/// Resolves `template:` job references relative to the including file.
///
/// Resolution happens on the raw YAML tree so a whole-value parameter
/// reference can produce a mapping or a sequence, not just text.
pub struct TemplateEngine {
    base_dir: PathBuf,
}

impl TemplateEngine {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Load `template_ref`, bind `provided` parameters and return its jobs
    pub fn expand_job_template(
        &self,
        template_ref: &str,
        provided: &IndexMap<String, Value>,
    ) -> EngineResult<Vec<Job>> {
        let path = self.resolve_template_path(template_ref)?;
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let raw: Value = serde_yaml::from_str(&content).map_err(|e| {
            ParseError::from_yaml_error(&e, &content).with_file(path.display().to_string())
        })?;
        let mapping = raw
            .as_mapping()
            .ok_or_else(|| ConfigError::template(template_ref, "template must be a YAML mapping"))?;

        let declared = match mapping.get("parameters") {
            Some(value) => parse_template_parameters(value, template_ref)?,
            None => Vec::new(),
        };
        let params = resolve_parameters(&declared, provided, template_ref)?;
        debug!(template = template_ref, parameters = params.len(), "resolving template");

        let mut body = mapping.clone();
        body.remove("parameters");
        let processed = process_template_expressions(&Value::Mapping(body), &params, template_ref)?;
        reject_nested_templates(&processed, template_ref)?;

        let file: TemplateFile = serde_yaml::from_value(processed).map_err(|e| {
            ConfigError::from(ParseError::from_schema_error(&e).with_file(template_ref))
        })?;
        if file.jobs.is_empty() {
            return Err(ConfigError::template(template_ref, "template defines no jobs"));
        }

        Ok(file.jobs)
    }

    fn resolve_template_path(&self, template_ref: &str) -> EngineResult<PathBuf> {
        if template_ref.contains('@') {
            return Err(ConfigError::template(
                template_ref,
                "templates from other repositories are not supported",
            ));
        }

        let full_path = self.base_dir.join(template_ref);
        if full_path.exists() {
            return Ok(full_path);
        }

        Err(ConfigError::template(
            template_ref,
            format!("not found (looked in {})", full_path.display()),
        ))
    }
}

/// Parameters in the list form (`- name: x`) or the mapping form (`x: default`)
fn parse_template_parameters(value: &Value, template_ref: &str) -> EngineResult<Vec<Parameter>> {
    match value {
        Value::Sequence(seq) => seq
            .iter()
            .map(|item| {
                serde_yaml::from_value::<Parameter>(item.clone()).map_err(|e| {
                    ConfigError::template(template_ref, format!("invalid parameter definition: {}", e))
                })
            })
            .collect(),
        Value::Mapping(map) => {
            let mut params = Vec::new();
            for (key, default) in map {
                let name = key.as_str().ok_or_else(|| {
                    ConfigError::template(template_ref, "parameter names must be strings")
                })?;
                params.push(Parameter {
                    name: name.to_string(),
                    param_type: ParameterType::Object,
                    default: Some(default.clone()),
                });
            }
            Ok(params)
        }
        Value::Null => Ok(Vec::new()),
        _ => Err(ConfigError::template(
            template_ref,
            "parameters must be a list or mapping",
        )),
    }
}

/// Bind provided values to declared parameters, falling back to defaults
fn resolve_parameters(
    declared: &[Parameter],
    provided: &IndexMap<String, Value>,
    template_ref: &str,
) -> EngineResult<IndexMap<String, Value>> {
    if let Some(unknown) = provided
        .keys()
        .find(|name| !declared.iter().any(|p| &p.name == *name))
    {
        return Err(ConfigError::template(
            template_ref,
            format!("unexpected parameter '{}'", unknown),
        ));
    }

    let mut resolved = IndexMap::new();
    for param in declared {
        let value = match (provided.get(&param.name), &param.default) {
            (Some(value), _) => {
                if !param.param_type.accepts(value) {
                    return Err(ConfigError::template(
                        template_ref,
                        format!(
                            "parameter '{}' expected type {:?} but got {:?}",
                            param.name, param.param_type, value
                        ),
                    ));
                }
                value.clone()
            }
            (None, Some(default)) => default.clone(),
            (None, None) => {
                return Err(ConfigError::template(
                    template_ref,
                    format!("required parameter '{}' not provided", param.name),
                ))
            }
        };
        resolved.insert(param.name.clone(), value);
    }

    Ok(resolved)
}

/// Walk the tree substituting compile-time expressions
fn process_template_expressions(
    value: &Value,
    params: &IndexMap<String, Value>,
    template_ref: &str,
) -> EngineResult<Value> {
    match value {
        Value::Sequence(seq) => {
            let mut result = Vec::with_capacity(seq.len());
            for item in seq {
                // `- ${{ parameters.steps }}` splices a list parameter in place
                match item.as_str().and_then(whole_expression) {
                    Some(expr) => match lookup_parameter(expr, params, template_ref)? {
                        Value::Sequence(items) => result.extend(items.iter().cloned()),
                        other => result.push(other.clone()),
                    },
                    None => result.push(process_template_expressions(item, params, template_ref)?),
                }
            }
            Ok(Value::Sequence(result))
        }
        Value::Mapping(map) => {
            let mut result = Mapping::new();
            for (key, val) in map {
                if key.as_str().and_then(whole_expression) == Some("insert") {
                    match process_template_expressions(val, params, template_ref)? {
                        Value::Mapping(inserted) => result.extend(inserted),
                        Value::Null => {}
                        Value::Sequence(items) if items.is_empty() => {}
                        _ => {
                            return Err(ConfigError::template(
                                template_ref,
                                "${{ insert }} requires a mapping value",
                            ))
                        }
                    }
                    continue;
                }

                let key = process_template_expressions(key, params, template_ref)?;
                let val = process_template_expressions(val, params, template_ref)?;
                result.insert(key, val);
            }
            Ok(Value::Mapping(result))
        }
        Value::String(s) => substitute_compile_time(s, params, template_ref),
        other => Ok(other.clone()),
    }
}

/// Replace `${{ }}` in a string. A string that is exactly one expression takes
/// the parameter's YAML value; otherwise each expression is interpolated as text.
fn substitute_compile_time(
    text: &str,
    params: &IndexMap<String, Value>,
    template_ref: &str,
) -> EngineResult<Value> {
    if let Some(expr) = whole_expression(text) {
        return lookup_parameter(expr, params, template_ref).cloned();
    }

    let segments =
        split_expressions(text).map_err(|message| ConfigError::template(template_ref, message))?;
    if !segments.iter().any(|s| matches!(s, Segment::Expression(_))) {
        return Ok(Value::String(text.to_string()));
    }

    let mut result = String::new();
    for segment in segments {
        match segment {
            Segment::Text(s) => result.push_str(s),
            Segment::Expression(expr) => {
                let value = lookup_parameter(expr, params, template_ref)?;
                let rendered = scalar_to_string(value).ok_or_else(|| {
                    ConfigError::template(
                        template_ref,
                        format!(
                            "'${{{{ {} }}}}' is not a scalar and cannot be embedded in text",
                            expr
                        ),
                    )
                })?;
                result.push_str(&rendered);
            }
        }
    }

    Ok(Value::String(result))
}

/// Inner text of a string that is exactly one `${{ ... }}`
fn whole_expression(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("${{")?.strip_suffix("}}")?;
    if inner.contains("${{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn split_expressions(text: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("${{") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 3..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated '${{{{' in '{}'", text))?;
        segments.push(Segment::Expression(after[..end].trim()));
        rest = &after[end + 2..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    Ok(segments)
}

/// Resolve `parameters.X` or `parameters['X']`; nothing else is a valid expression
fn lookup_parameter<'p>(
    expr: &str,
    params: &'p IndexMap<String, Value>,
    template_ref: &str,
) -> EngineResult<&'p Value> {
    let name = parameter_name(expr).ok_or_else(|| {
        ConfigError::template(
            template_ref,
            format!(
                "unsupported template expression '${{{{ {} }}}}' (only parameters are supported)",
                expr
            ),
        )
    })?;

    params
        .get(name)
        .ok_or_else(|| ConfigError::template(template_ref, format!("unknown parameter '{}'", name)))
}

fn parameter_name(expr: &str) -> Option<&str> {
    let rest = expr.trim().strip_prefix("parameters")?;
    if let Some(name) = rest.strip_prefix('.') {
        return (!name.is_empty()).then_some(name);
    }

    let inner = rest.strip_prefix('[')?.strip_suffix(']')?.trim();
    inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
}

fn reject_nested_templates(value: &Value, template_ref: &str) -> EngineResult<()> {
    let jobs = value
        .as_mapping()
        .and_then(|m| m.get("jobs"))
        .and_then(Value::as_sequence);

    for job in jobs.into_iter().flatten() {
        let steps = job.get("steps").and_then(Value::as_sequence);
        let nested = job.get("template").is_some()
            || steps
                .into_iter()
                .flatten()
                .any(|step| step.get("template").is_some());
        if nested {
            return Err(ConfigError::template(
                template_ref,
                "nested template references are not supported",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::StepAction;
    use std::io::Write;
    use tempfile::TempDir;

    /// Helper to create a temp directory with template files
    fn setup_templates(files: &[(&str, &str)]) -> TempDir {
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

    fn params(yaml: &str) -> IndexMap<String, Value> {
        serde_yaml::from_str(yaml).unwrap()
    }

    const LINUX_TEMPLATE: &str = r#"
parameters:
  name: ''
  vmImage: ''
  matrix: []

jobs:
- job: ${{ parameters.name }}
  pool:
    vmImage: ${{ parameters.vmImage }}
  strategy:
    matrix:
      ${{ insert }}: ${{ parameters.matrix }}
  steps:
  - script: echo running on ${{ parameters.vmImage }}
    displayName: 'Show image'
"#;

    #[test]
    fn test_expand_job_template_with_matrix_parameter() {
        let dir = setup_templates(&[("ci/linux.yml", LINUX_TEMPLATE)]);
        let engine = TemplateEngine::new(dir.path());

        let jobs = engine
            .expand_job_template(
                "ci/linux.yml",
                &params(
                    r#"
name: Linux
vmImage: ubuntu-latest
matrix:
  py38:
    python.version: '3.8'
  py39:
    python.version: '3.9'
"#,
                ),
            )
            .unwrap();

        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.job, "Linux");
        assert_eq!(job.pool.as_ref().unwrap().vm_image(), Some("ubuntu-latest"));
        let strategy = job.strategy.as_ref().unwrap();
        assert_eq!(strategy.matrix.len(), 2);
        assert_eq!(strategy.matrix["py39"]["python.version"].0, "3.9");
        match &job.steps[0].action {
            StepAction::Script(step) => assert_eq!(step.script, "echo running on ubuntu-latest"),
            other => panic!("expected script step, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults_fill_missing_parameters() {
        let dir = setup_templates(&[("linux.yml", LINUX_TEMPLATE)]);
        let engine = TemplateEngine::new(dir.path());

        let jobs = engine
            .expand_job_template("linux.yml", &params("name: Linux"))
            .unwrap();

        assert!(jobs[0].strategy.as_ref().unwrap().matrix.is_empty());
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        let dir = setup_templates(&[("linux.yml", LINUX_TEMPLATE)]);
        let engine = TemplateEngine::new(dir.path());

        let err = engine
            .expand_job_template("linux.yml", &params("name: Linux\nflavour: fast"))
            .unwrap_err();
        assert!(err.to_string().contains("unexpected parameter 'flavour'"));
    }

    #[test]
    fn test_required_parameter_must_be_provided() {
        let dir = setup_templates(&[(
            "linux.yml",
            r#"
parameters:
- name: name
  type: string
jobs:
- job: ${{ parameters.name }}
  steps:
  - script: 'true'
"#,
        )]);
        let engine = TemplateEngine::new(dir.path());

        let err = engine
            .expand_job_template("linux.yml", &IndexMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("required parameter 'name'"));
    }

    #[test]
    fn test_other_expressions_are_rejected() {
        let dir = setup_templates(&[(
            "linux.yml",
            r#"
parameters:
  name: Linux
jobs:
- job: ${{ parameters.name }}
  steps:
  - script: echo ${{ variables.foo }}
"#,
        )]);
        let engine = TemplateEngine::new(dir.path());

        let err = engine
            .expand_job_template("linux.yml", &IndexMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("unsupported template expression"));
    }

    #[test]
    fn test_step_list_parameter_is_spliced() {
        let dir = setup_templates(&[(
            "linux.yml",
            r#"
parameters:
- name: extraSteps
  type: stepList
  default: []
jobs:
- job: Linux
  steps:
  - script: echo first
  - ${{ parameters.extraSteps }}
  - script: echo last
"#,
        )]);
        let engine = TemplateEngine::new(dir.path());

        let jobs = engine
            .expand_job_template(
                "linux.yml",
                &params("extraSteps:\n  - bash: echo middle\n  - bash: echo more\n"),
            )
            .unwrap();

        let bodies: Vec<&str> = jobs[0].steps.iter().map(|s| s.action.body()).collect();
        assert_eq!(
            bodies,
            vec!["echo first", "echo middle", "echo more", "echo last"]
        );
    }

    #[test]
    fn test_nested_template_is_rejected() {
        let dir = setup_templates(&[(
            "outer.yml",
            "jobs:\n- job: Outer\n  steps:\n  - template: steps.yml\n",
        )]);
        let engine = TemplateEngine::new(dir.path());

        let err = engine
            .expand_job_template("outer.yml", &IndexMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("nested template"));
    }

    #[test]
    fn test_missing_template_file() {
        let dir = TempDir::new().unwrap();
        let engine = TemplateEngine::new(dir.path());

        let err = engine
            .expand_job_template("ci/missing.yml", &IndexMap::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Template { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_parameter_name_forms() {
        assert_eq!(parameter_name("parameters.vmImage"), Some("vmImage"));
        assert_eq!(parameter_name("parameters['vmImage']"), Some("vmImage"));
        assert_eq!(parameter_name("parameters[\"vmImage\"]"), Some("vmImage"));
        assert_eq!(parameter_name("variables.foo"), None);
        assert_eq!(parameter_name("parameters."), None);
    }

    #[test]
    fn test_split_expressions() {
        let segments = split_expressions("a ${{ parameters.x }} b").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Text("a "),
                Segment::Expression("parameters.x"),
                Segment::Text(" b")
            ]
        );
        assert!(split_expressions("a ${{ parameters.x").is_err());
    }
}
