// Matrix Strategy Expansion
// Expands a job template's axes into the Cartesian product of concrete job instances

use crate::error::{ConfigError, EngineResult};
use crate::execution::environment::{expand_macros, find_variable, macro_references, set_variable};
use crate::model::{JobInstance, JobTemplate};

use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on instances produced from one template
pub const MAX_MATRIX_INSTANCES: usize = 256;

/// Axis name used for Azure's named-cell `matrix:` form
pub const NAMED_CELLS_AXIS: &str = "matrix";

/// One value of an axis: a label plus the variables it binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisValue {
    pub label: String,
    pub bindings: IndexMap<String, String>,
}

/// A named dimension of a job matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<AxisValue>,
}

impl MatrixAxis {
    /// Scalar axis: each value binds the axis name, labelled `name=value`
    pub fn scalar<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let values = values
            .into_iter()
            .map(|value| {
                let value = value.into();
                let mut bindings = IndexMap::new();
                bindings.insert(name.clone(), value.clone());
                AxisValue {
                    label: format!("{}={}", name, value),
                    bindings,
                }
            })
            .collect();

        Self { name, values }
    }

    /// Named cells: each cell is labelled by its name and binds its own variables
    pub fn cells(cells: IndexMap<String, IndexMap<String, String>>) -> Self {
        Self {
            name: NAMED_CELLS_AXIS.to_string(),
            values: cells
                .into_iter()
                .map(|(label, bindings)| AxisValue { label, bindings })
                .collect(),
        }
    }
}

pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a template into one instance per matrix cell, in row-major order
    /// (the last axis varies fastest). No axes yields a single instance.
    pub fn expand(
        template: &Arc<JobTemplate>,
        axes: &[MatrixAxis],
    ) -> EngineResult<Vec<JobInstance>> {
        Self::validate(template, axes)?;

        let total = axes
            .iter()
            .map(|axis| axis.values.len())
            .fold(1usize, usize::saturating_mul);
        if total > MAX_MATRIX_INSTANCES {
            return Err(ConfigError::MatrixTooLarge {
                job: template.name.clone(),
                count: total,
                limit: MAX_MATRIX_INSTANCES,
            });
        }

        let mut instances = Vec::with_capacity(total);
        let mut seen = HashSet::with_capacity(total);

        for index in 0..total {
            let cell = Self::cell(axes, index);
            let name = Self::instance_name(&template.name, &cell);

            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateInstance {
                    job: template.name.clone(),
                    name,
                });
            }

            let mut bindings = IndexMap::new();
            for value in &cell {
                for (key, bound) in &value.bindings {
                    bindings.insert(key.clone(), bound.clone());
                }
            }
            Self::check_macros(template, axes, &cell, &bindings)?;

            let variables = Self::bind_variables(&template.variables, &bindings);

            instances.push(JobInstance {
                name,
                index,
                template: Arc::clone(template),
                bindings,
                variables,
            });
        }

        debug!(
            job = %template.name,
            axes = axes.len(),
            instances = instances.len(),
            "expanded matrix"
        );

        Ok(instances)
    }

    fn validate(template: &JobTemplate, axes: &[MatrixAxis]) -> EngineResult<()> {
        for axis in axes {
            if axis.values.is_empty() {
                return Err(ConfigError::EmptyAxis {
                    job: template.name.clone(),
                    axis: axis.name.clone(),
                });
            }

            let mut labels = HashSet::new();
            for value in &axis.values {
                if !labels.insert(value.label.as_str()) {
                    return Err(ConfigError::DuplicateAxisValue {
                        job: template.name.clone(),
                        axis: axis.name.clone(),
                        value: value.label.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Every `$(VAR)` in a cell's bindings must resolve within that cell
    fn check_macros(
        template: &JobTemplate,
        axes: &[MatrixAxis],
        cell: &[&AxisValue],
        bindings: &IndexMap<String, String>,
    ) -> EngineResult<()> {
        for (axis, value) in axes.iter().zip(cell) {
            for (owner, bound) in &value.bindings {
                for variable in macro_references(bound) {
                    if resolve_binding(&template.variables, bindings, owner, variable).is_none() {
                        return Err(ConfigError::UndefinedVariable {
                            job: template.name.clone(),
                            axis: axis.name.clone(),
                            variable: variable.to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Axis values selected by a row-major index
    fn cell(axes: &[MatrixAxis], index: usize) -> Vec<&AxisValue> {
        let mut remainder = index;
        let mut picks = vec![0; axes.len()];

        for (slot, axis) in axes.iter().enumerate().rev() {
            let len = axis.values.len();
            picks[slot] = remainder % len;
            remainder /= len;
        }

        axes.iter()
            .zip(picks)
            .map(|(axis, pick)| &axis.values[pick])
            .collect()
    }

    fn instance_name(job: &str, cell: &[&AxisValue]) -> String {
        if cell.is_empty() {
            return job.to_string();
        }

        let labels: Vec<&str> = cell.iter().map(|value| value.label.as_str()).collect();
        format!("{} ({})", job, labels.join(", "))
    }

    /// Template variables overridden by bindings, with macros expanded once
    fn bind_variables(
        template_vars: &IndexMap<String, String>,
        bindings: &IndexMap<String, String>,
    ) -> IndexMap<String, String> {
        let mut merged = template_vars.clone();
        for (name, value) in bindings {
            set_variable(&mut merged, name, value.clone());
        }

        merged
            .into_iter()
            .map(|(name, value)| {
                let expanded = expand_macros(&value, |reference| {
                    resolve_binding(template_vars, bindings, &name, reference).map(str::to_string)
                });
                (name, expanded)
            })
            .collect()
    }
}

/// Value of `$(reference)` inside variable `owner`: another binding of the
/// same cell wins over the template default, a self reference reads the default
fn resolve_binding<'a>(
    template_vars: &'a IndexMap<String, String>,
    bindings: &'a IndexMap<String, String>,
    owner: &str,
    reference: &str,
) -> Option<&'a str> {
    let bound = if reference.eq_ignore_ascii_case(owner) {
        None
    } else {
        find_variable(bindings, reference)
    };
    bound.or_else(|| find_variable(template_vars, reference))
}
