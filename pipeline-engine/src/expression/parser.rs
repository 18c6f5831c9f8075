// Condition Parser
// Parses condition tokens into an AST, accepting both the Azure function form and infix operators

use crate::expression::functions::Function;
use crate::expression::lexer::{LexError, Lexer, Token};

use std::fmt;

/// Abstract Syntax Tree node for conditions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),

    /// String literal, numbers included
    String(String),

    /// `variables['X']`, `variables.X`, `X`, `python.version`, `env.X`
    Variable(VariableRef),

    /// `eq(a, b)`, `succeeded()`
    Call { function: Function, args: Vec<Expr> },

    /// `!expr`
    Not(Box<Expr>),

    /// `a == b`, `a && b`
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Whether the expression calls a job status function anywhere
    pub fn uses_status(&self) -> bool {
        match self {
            Expr::Call { function, args } => {
                function.is_status() || args.iter().any(Expr::uses_status)
            }
            Expr::Not(inner) => inner.uses_status(),
            Expr::Binary { left, right, .. } => left.uses_status() || right.uses_status(),
            Expr::Bool(_) | Expr::String(_) | Expr::Variable(_) => false,
        }
    }
}

/// Where a reference is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Job variables first, then the ambient environment
    Variables,
    /// Ambient environment only
    Env,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRef {
    pub scope: Scope,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,  // ==
    Ne,  // !=
    And, // &&
    Or,  // ||
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Eq => write!(f, "=="),
            BinaryOp::Ne => write!(f, "!="),
            BinaryOp::And => write!(f, "&&"),
            BinaryOp::Or => write!(f, "||"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (token {})", self.message, self.position)
    }
}

impl std::error::Error for ParseExprError {}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

/// Recursive descent parser for conditions
pub struct ExprParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let tokens = Lexer::new(input).tokenize()?;
        Self::new(tokens).parse()
    }

    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        if self.is_at_end() {
            return Err(self.error("empty condition"));
        }

        let expr = self.parse_or()?;

        if !self.is_at_end() {
            return Err(self.error(&format!("unexpected token: {}", self.peek())));
        }

        Ok(expr)
    }

    // Precedence (lowest to highest):
    // 1. Or: ||
    // 2. And: &&
    // 3. Equality: == !=
    // 4. Unary: !
    // 5. Primary: literals, references, calls, parentheses

    fn parse_or(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_and()?;

        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_equality()?;

        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseExprError> {
        if self.check(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(expr)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseExprError> {
        match self.peek().clone() {
            Token::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expr::String(n))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::String(s))
            }
            Token::Identifier(name) => {
                self.advance();

                if self.check(&Token::LParen) {
                    self.parse_call(&name)
                } else {
                    self.parse_reference(name)
                }
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            token => Err(self.error(&format!("unexpected token: {}", token))),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Expr, ParseExprError> {
        let function = Function::lookup(name)
            .ok_or_else(|| self.error(&format!("unknown function '{}'", name)))?;

        let args = self.parse_args()?;
        function
            .check_arity(args.len())
            .map_err(|message| self.error(&message))?;

        Ok(Expr::Call { function, args })
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseExprError> {
        self.expect(&Token::LParen, "expected '('")?;

        let mut args = Vec::new();

        if !self.check(&Token::RParen) {
            args.push(self.parse_or()?);

            while self.check(&Token::Comma) {
                self.advance();
                args.push(self.parse_or()?);
            }
        }

        self.expect(&Token::RParen, "expected ')'")?;
        Ok(args)
    }

    /// Collects `a.b['c']` segments and normalizes them to a scoped name
    fn parse_reference(&mut self, first: String) -> Result<Expr, ParseExprError> {
        let mut parts = vec![first];

        loop {
            if self.check(&Token::Dot) {
                self.advance();
                match self.advance().clone() {
                    Token::Identifier(part) => parts.push(part),
                    _ => return Err(self.error("expected a name after '.'")),
                }
            } else if self.check(&Token::LBracket) {
                self.advance();
                match self.advance().clone() {
                    Token::String(part) | Token::Number(part) => parts.push(part),
                    _ => return Err(self.error("expected a quoted name inside '[...]'")),
                }
                self.expect(&Token::RBracket, "expected ']'")?;
            } else {
                break;
            }
        }

        let (scope, rest) = match parts[0].to_lowercase().as_str() {
            "variables" => (Scope::Variables, &parts[1..]),
            "env" => (Scope::Env, &parts[1..]),
            _ => (Scope::Variables, &parts[..]),
        };

        if rest.is_empty() {
            return Err(self.error(&format!("expected a variable name after '{}'", parts[0])));
        }

        Ok(Expr::Variable(VariableRef {
            scope,
            name: rest.join("."),
        }))
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> &Token {
        let token = self.tokens.get(self.position).unwrap_or(&Token::Eof);
        self.position += 1;
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), ParseExprError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn error(&self, message: &str) -> ParseExprError {
        ParseExprError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expr {
        Expr::Variable(VariableRef {
            scope: Scope::Variables,
            name: name.to_string(),
        })
    }

    #[test]
    fn test_parse_infix_comparison() {
        let expr = ExprParser::parse_str(r#"TEST_WITH_XVFB == "1""#).unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Eq,
                var("TEST_WITH_XVFB"),
                Expr::String("1".to_string())
            )
        );
    }

    #[test]
    fn test_reference_forms_normalize() {
        for input in [
            "variables['python.version']",
            "variables.python.version",
            "python.version",
            "Variables[\"python.version\"]",
        ] {
            assert_eq!(
                ExprParser::parse_str(input).unwrap(),
                var("python.version"),
                "{input}"
            );
        }

        assert_eq!(
            ExprParser::parse_str("env.CONDA").unwrap(),
            Expr::Variable(VariableRef {
                scope: Scope::Env,
                name: "CONDA".to_string()
            })
        );
    }

    #[test]
    fn test_parse_function_form() {
        let expr = ExprParser::parse_str("and(succeeded(), eq(variables['X'], '1'))").unwrap();
        let Expr::Call { function, args } = &expr else {
            panic!("expected call, got {expr:?}");
        };
        assert_eq!(*function, Function::And);
        assert_eq!(args.len(), 2);
        assert!(expr.uses_status());
    }

    #[test]
    fn test_operator_precedence() {
        // a || b && c  ==  a || (b && c)
        let expr = ExprParser::parse_str("a || b && c").unwrap();
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
        assert!(matches!(
            *right,
            Expr::Binary {
                op: BinaryOp::And,
                ..
            }
        ));
    }

    #[test]
    fn test_parentheses_and_not() {
        let expr = ExprParser::parse_str("!(a == '1' || b != '2')").unwrap();
        assert!(matches!(expr, Expr::Not(_)));
        assert!(!expr.uses_status());
    }

    #[test]
    fn test_rejects_unknown_function() {
        let err = ExprParser::parse_str("contains(a, 'b')").unwrap_err();
        assert!(err.message.contains("unknown function 'contains'"));
    }

    #[test]
    fn test_rejects_bad_arity() {
        assert!(ExprParser::parse_str("eq(a)").is_err());
        assert!(ExprParser::parse_str("always(a)").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(ExprParser::parse_str("").is_err());
        assert!(ExprParser::parse_str("a ==").is_err());
        assert!(ExprParser::parse_str("(a == b").is_err());
        assert!(ExprParser::parse_str("a b").is_err());
        assert!(ExprParser::parse_str("variables").is_err());
        assert!(ExprParser::parse_str("variables[x]").is_err());
    }
}
