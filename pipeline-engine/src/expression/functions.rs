// Condition Functions
// The Azure function set accepted in step conditions, resolved and arity-checked at parse time

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    // Comparison
    Eq,
    Ne,

    // Logical
    And,
    Or,
    Not,

    // Job status
    Succeeded,
    Failed,
    Always,
    SucceededOrFailed,
    Canceled,
}

impl Function {
    /// Resolve a function name, case-insensitively as Azure does
    pub fn lookup(name: &str) -> Option<Self> {
        let function = match name.to_lowercase().as_str() {
            "eq" => Function::Eq,
            "ne" => Function::Ne,
            "and" => Function::And,
            "or" => Function::Or,
            "not" => Function::Not,
            "succeeded" => Function::Succeeded,
            "failed" => Function::Failed,
            "always" => Function::Always,
            "succeededorfailed" => Function::SucceededOrFailed,
            "canceled" => Function::Canceled,
            _ => return None,
        };
        Some(function)
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Eq => "eq",
            Function::Ne => "ne",
            Function::And => "and",
            Function::Or => "or",
            Function::Not => "not",
            Function::Succeeded => "succeeded",
            Function::Failed => "failed",
            Function::Always => "always",
            Function::SucceededOrFailed => "succeededOrFailed",
            Function::Canceled => "canceled",
        }
    }

    /// Status functions read the job state instead of variables
    pub fn is_status(self) -> bool {
        matches!(
            self,
            Function::Succeeded
                | Function::Failed
                | Function::Always
                | Function::SucceededOrFailed
                | Function::Canceled
        )
    }

    pub fn check_arity(self, count: usize) -> Result<(), String> {
        let ok = match self {
            Function::Eq | Function::Ne => count == 2,
            Function::And | Function::Or => count >= 2,
            Function::Not => count == 1,
            _ => count == 0,
        };

        if ok {
            return Ok(());
        }

        let expected = match self {
            Function::Eq | Function::Ne => "exactly 2 arguments",
            Function::And | Function::Or => "at least 2 arguments",
            Function::Not => "exactly 1 argument",
            _ => "no arguments",
        };
        Err(format!(
            "{}() takes {}, got {}",
            self.name(),
            expected,
            count
        ))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
