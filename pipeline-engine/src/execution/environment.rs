// Job Environment
// Variable threading between steps, ambient environment lookup and `$(VAR)` macro expansion

use crate::expression::{ConditionEnv, JobState};

use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Ambient variables read by step bodies without being declared
pub const DEFAULT_AMBIENT_VARIABLES: [&str; 3] = ["CONDA", "USE_PRE", "TEST_WITH_XVFB"];

/// Read-only access to the environment a run was started in
pub trait EnvLookup: Send + Sync + fmt::Debug {
    fn lookup(&self, name: &str) -> Option<String>;
}

/// The real process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed set of values, used for `--var` overrides and in tests
#[derive(Debug, Default, Clone)]
pub struct StaticEnv {
    values: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl EnvLookup for StaticEnv {
    fn lookup(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Earlier layers shadow later ones
#[derive(Debug, Default, Clone)]
pub struct LayeredEnv {
    layers: Vec<Arc<dyn EnvLookup>>,
}

impl LayeredEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(mut self, lookup: Arc<dyn EnvLookup>) -> Self {
        self.layers.push(lookup);
        self
    }
}

impl EnvLookup for LayeredEnv {
    fn lookup(&self, name: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.lookup(name))
    }
}

/// Environment variable name for a pipeline variable: `python.version` -> `PYTHON_VERSION`
pub fn env_var_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

fn is_variable_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Split out `$(NAME)` macros, yielding `(start, end, name)` byte ranges
fn macros(text: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut offset = 0;

    while let Some(start) = text[offset..].find("$(").map(|i| i + offset) {
        let name_start = start + 2;
        let Some(close) = text[name_start..].find(')').map(|i| i + name_start) else {
            break;
        };

        let name = &text[name_start..close];
        if !name.is_empty() && name.chars().all(is_variable_char) {
            found.push((start, close + 1, name));
            offset = close + 1;
        } else {
            offset = name_start;
        }
    }

    found
}

/// Names referenced through `$(NAME)` macros
pub fn macro_references(text: &str) -> Vec<&str> {
    macros(text).into_iter().map(|(_, _, name)| name).collect()
}

/// Replace `$(NAME)` wherever `resolve` knows NAME; anything else stays literal
pub fn expand_macros(text: &str, resolve: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(text.len());
    let mut last = 0;

    for (start, end, name) in macros(text) {
        if let Some(value) = resolve(name) {
            result.push_str(&text[last..start]);
            result.push_str(&value);
            last = end;
        }
    }

    result.push_str(&text[last..]);
    result
}

/// Case-insensitive lookup in a declared-order variable map
pub fn find_variable<'a>(variables: &'a IndexMap<String, String>, name: &str) -> Option<&'a str> {
    variables
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Insert or replace a variable, keeping the position of an existing key
pub fn set_variable(variables: &mut IndexMap<String, String>, name: &str, value: String) {
    let existing = variables
        .keys()
        .find(|key| key.eq_ignore_ascii_case(name))
        .cloned();

    match existing {
        Some(key) => {
            variables.insert(key, value);
        }
        None => {
            variables.insert(name.to_string(), value);
        }
    }
}

/// Mutable state of one running job instance
#[derive(Debug, Clone)]
pub struct JobEnvironment {
    variables: IndexMap<String, String>,
    ambient: Arc<dyn EnvLookup>,
    /// Most recently prepended first
    prepend_path: Vec<String>,
    /// Values set with `issecret=true`, masked in anything reported
    secrets: Vec<String>,
    state: JobState,
}

/// Replacement text for secret values
pub const SECRET_MASK: &str = "***";

impl JobEnvironment {
    pub fn new(variables: IndexMap<String, String>, ambient: Arc<dyn EnvLookup>) -> Self {
        Self {
            variables,
            ambient,
            prepend_path: Vec::new(),
            secrets: Vec::new(),
            state: JobState::Succeeded,
        }
    }

    /// Variable value, then ambient value, then the empty string
    pub fn get(&self, name: &str) -> String {
        self.variable(name)
            .map(str::to_string)
            .or_else(|| self.ambient.lookup(name))
            .unwrap_or_default()
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        find_variable(&self.variables, name)
    }

    pub fn variables(&self) -> &IndexMap<String, String> {
        &self.variables
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<String>) {
        set_variable(&mut self.variables, name, value.into());
    }

    pub fn add_secret(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() && !self.secrets.contains(&value) {
            self.secrets.push(value);
            // Longest first, so a secret containing another is masked whole
            self.secrets.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
        }
    }

    /// `text` with every secret value replaced by `***`
    pub fn mask(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |masked, secret| masked.replace(secret.as_str(), SECRET_MASK))
    }

    pub fn prepend_path(&mut self, path: impl Into<String>) {
        self.prepend_path.insert(0, path.into());
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn mark_failed(&mut self) {
        self.state = JobState::Failed;
    }

    /// Expand `$(VAR)` macros against job variables only
    pub fn expand(&self, text: &str) -> String {
        expand_macros(text, |name| self.variable(name).map(str::to_string))
    }

    /// Environment handed to a step's process
    pub fn process_env(
        &self,
        ambient_names: &[String],
        step_env: &IndexMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env = HashMap::new();

        for name in ambient_names {
            env.insert(name.clone(), self.ambient.lookup(name).unwrap_or_default());
        }

        for (name, value) in &self.variables {
            env.insert(env_var_name(name), value.clone());
        }

        for (name, value) in step_env {
            env.insert(name.clone(), self.expand(value));
        }

        if !self.prepend_path.is_empty() {
            let mut entries = self.prepend_path.clone();
            if let Some(path) = self.ambient.lookup("PATH").filter(|p| !p.is_empty()) {
                entries.push(path);
            }
            env.insert("PATH".to_string(), entries.join(":"));
        }

        env
    }
}

impl ConditionEnv for JobEnvironment {
    fn variable(&self, name: &str) -> Option<String> {
        JobEnvironment::variable(self, name).map(str::to_string)
    }

    fn ambient(&self, name: &str) -> Option<String> {
        self.ambient.lookup(name)
    }

    fn job_state(&self) -> JobState {
        self.state
    }
}
