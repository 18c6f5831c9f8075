// Condition Expression Module
// Step guards: `eq(variables['X'], '1')` and `X == "1"` forms

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{evaluate, Condition, ConditionEnv, Evaluator, JobState, Value};
pub use functions::Function;
pub use lexer::{LexError, Lexer, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError, Scope, VariableRef};
