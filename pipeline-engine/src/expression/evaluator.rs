// Condition Evaluator
// Evaluates step guards against job variables, the ambient environment and the job state

use crate::expression::functions::Function;
use crate::expression::parser::{BinaryOp, Expr, ExprParser, ParseExprError, Scope, VariableRef};

use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Whether every step so far succeeded (warnings count as success)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Succeeded,
    Failed,
}

/// What a condition can observe
pub trait ConditionEnv {
    /// Job variable by name, matched case-insensitively
    fn variable(&self, name: &str) -> Option<String>;

    /// Ambient (process) environment variable
    fn ambient(&self, name: &str) -> Option<String>;

    fn job_state(&self) -> JobState {
        JobState::Succeeded
    }
}

impl ConditionEnv for HashMap<String, String> {
    fn variable(&self, name: &str) -> Option<String> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    fn ambient(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl ConditionEnv for IndexMap<String, String> {
    fn variable(&self, name: &str) -> Option<String> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    fn ambient(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Intermediate value while evaluating
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    String(String),
}

impl Value {
    /// Azure truthiness: non-empty strings are true
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
        }
    }
}

pub struct Evaluator<'a, E: ConditionEnv + ?Sized> {
    env: &'a E,
}

impl<'a, E: ConditionEnv + ?Sized> Evaluator<'a, E> {
    pub fn new(env: &'a E) -> Self {
        Self { env }
    }

    /// Evaluation never fails: malformed input is rejected by the parser
    pub fn eval(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Bool(b) => Value::Bool(*b),
            Expr::String(s) => Value::String(s.clone()),
            Expr::Variable(reference) => Value::String(self.resolve(reference)),
            Expr::Not(inner) => Value::Bool(!self.eval(inner).is_truthy()),
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
            Expr::Call { function, args } => Value::Bool(self.eval_call(*function, args)),
        }
    }

    fn resolve(&self, reference: &VariableRef) -> String {
        let value = match reference.scope {
            Scope::Variables => self
                .env
                .variable(&reference.name)
                .or_else(|| self.env.ambient(&reference.name)),
            Scope::Env => self.env.ambient(&reference.name),
        };
        value.unwrap_or_default()
    }

    fn eval_binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Value {
        let result = match op {
            BinaryOp::And => self.eval(left).is_truthy() && self.eval(right).is_truthy(),
            BinaryOp::Or => self.eval(left).is_truthy() || self.eval(right).is_truthy(),
            BinaryOp::Eq => values_equal(&self.eval(left), &self.eval(right)),
            BinaryOp::Ne => !values_equal(&self.eval(left), &self.eval(right)),
        };
        Value::Bool(result)
    }

    fn eval_call(&self, function: Function, args: &[Expr]) -> bool {
        let state = self.env.job_state();
        match function {
            Function::Eq => values_equal(&self.eval(&args[0]), &self.eval(&args[1])),
            Function::Ne => !values_equal(&self.eval(&args[0]), &self.eval(&args[1])),
            Function::And => args.iter().all(|arg| self.eval(arg).is_truthy()),
            Function::Or => args.iter().any(|arg| self.eval(arg).is_truthy()),
            Function::Not => !self.eval(&args[0]).is_truthy(),
            Function::Succeeded => state == JobState::Succeeded,
            Function::Failed => state == JobState::Failed,
            Function::Always | Function::SucceededOrFailed => true,
            Function::Canceled => false,
        }
    }
}

/// Case-insensitive comparison, booleans compare against "true"/"false"
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            b.eq_ignore_ascii_case(if *a { "true" } else { "false" })
        }
    }
}

/// A parsed step guard
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse and validate a guard; every error surfaces here, never at evaluation
    pub fn parse(source: &str) -> Result<Self, ParseExprError> {
        let expr = ExprParser::parse_str(source)?;
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Guards without a status function are implicitly `and(succeeded(), guard)`
    pub fn evaluate<E: ConditionEnv + ?Sized>(&self, env: &E) -> bool {
        if !self.expr.uses_status() && env.job_state() != JobState::Succeeded {
            return false;
        }
        Evaluator::new(env).eval(&self.expr).is_truthy()
    }
}

impl FromStr for Condition {
    type Err = ParseExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Decide whether a step runs. A missing guard means `succeeded()`.
pub fn evaluate<E: ConditionEnv + ?Sized>(guard: Option<&Condition>, env: &E) -> bool {
    match guard {
        Some(condition) => condition.evaluate(env),
        None => env.job_state() == JobState::Succeeded,
    }
}
