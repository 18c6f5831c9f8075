// Condition Lexer
// Tokenizes step conditions such as `TEST_WITH_XVFB == "1"` or `eq(variables['x'], 'y')`

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    True,
    False,
    /// Numbers stay as written; comparisons are textual
    Number(String),
    String(String),

    Identifier(String),

    // Operators
    Eq,  // ==
    Ne,  // !=
    And, // &&
    Or,  // ||
    Not, // !
    Dot,
    Comma,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "end of condition"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at position {}: {}", self.position, self.message)
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input, always ending with `Token::Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        self.position = pos;

        match ch {
            '.' => self.single(Token::Dot),
            ',' => self.single(Token::Comma),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            '[' => self.single(Token::LBracket),
            ']' => self.single(Token::RBracket),

            '=' => self.double('=', Token::Eq, "expected '==' operator"),
            '&' => self.double('&', Token::And, "expected '&&' operator"),
            '|' => self.double('|', Token::Or, "expected '||' operator"),
            '!' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Ne)
                } else {
                    Ok(Token::Not)
                }
            }

            '\'' => self.read_single_quoted(),
            '"' => self.read_double_quoted(),

            '0'..='9' => Ok(self.read_number()),

            'a'..='z' | 'A'..='Z' | '_' => Ok(self.read_identifier()),

            _ => Err(LexError {
                message: format!("unexpected character: '{}'", ch),
                position: pos,
            }),
        }
    }

    fn single(&mut self, token: Token) -> Result<Token, LexError> {
        self.advance();
        Ok(token)
    }

    fn double(&mut self, second: char, token: Token, message: &str) -> Result<Token, LexError> {
        let start = self.position;
        self.advance();
        if self.peek_char() == Some(second) {
            self.advance();
            Ok(token)
        } else {
            Err(LexError {
                message: message.to_string(),
                position: start,
            })
        }
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn unterminated(&self, start: usize) -> LexError {
        LexError {
            message: "unterminated string".to_string(),
            position: start,
        }
    }

    /// `'...'` with `''` as an escaped quote
    fn read_single_quoted(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        self.advance();

        let mut value = String::new();
        loop {
            match self.advance() {
                Some((_, '\'')) => {
                    if self.peek_char() == Some('\'') {
                        value.push('\'');
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some((_, ch)) => value.push(ch),
                None => return Err(self.unterminated(start)),
            }
        }

        Ok(Token::String(value))
    }

    /// `"..."` with backslash escapes
    fn read_double_quoted(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        self.advance();

        let mut value = String::new();
        loop {
            match self.advance() {
                Some((_, '"')) => break,
                Some((_, '\\')) => match self.advance() {
                    Some((_, escaped)) => value.push(escaped),
                    None => return Err(self.unterminated(start)),
                },
                Some((_, ch)) => value.push(ch),
                None => return Err(self.unterminated(start)),
            }
        }

        Ok(Token::String(value))
    }

    fn read_number(&mut self) -> Token {
        let mut num_str = String::new();

        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() || ch == '.' {
                num_str.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        Token::Number(num_str)
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();

        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match ident.to_lowercase().as_str() {
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn test_lexer_operators() {
        assert_eq!(
            tokens("== != && || !"),
            vec![
                Token::Eq,
                Token::Ne,
                Token::And,
                Token::Or,
                Token::Not,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_strings() {
        assert_eq!(
            tokens(r#"'it''s' "say \"hi\"""#),
            vec![
                Token::String("it's".to_string()),
                Token::String("say \"hi\"".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_bare_comparison() {
        assert_eq!(
            tokens(r#"TEST_WITH_XVFB == "1""#),
            vec![
                Token::Identifier("TEST_WITH_XVFB".to_string()),
                Token::Eq,
                Token::String("1".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_numbers_keep_text() {
        assert_eq!(
            tokens("3.10 1"),
            vec![
                Token::Number("3.10".to_string()),
                Token::Number("1".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_keywords_case_insensitive() {
        assert_eq!(
            tokens("true FALSE"),
            vec![Token::True, Token::False, Token::Eof]
        );
    }

    #[test]
    fn test_lexer_indexer() {
        assert_eq!(
            tokens("variables['python.version']"),
            vec![
                Token::Identifier("variables".to_string()),
                Token::LBracket,
                Token::String("python.version".to_string()),
                Token::RBracket,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_errors() {
        assert!(Lexer::new("a = b").tokenize().is_err());
        assert!(Lexer::new("a & b").tokenize().is_err());
        let err = Lexer::new("'open").tokenize().unwrap_err();
        assert_eq!(err.message, "unterminated string");
        assert!(Lexer::new("a # b").tokenize().is_err());
    }
}
