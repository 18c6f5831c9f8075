// Parser error types with helpful error messages
// Line/column info, source excerpts and suggestions for common pipeline mistakes

use std::fmt;

/// Detailed parse error with location and context
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// File the error was found in, when known
    pub file: Option<String>,
    /// Line number (1-indexed, 0 when the location is unknown)
    pub line: usize,
    /// Column number (1-indexed)
    pub column: usize,
    /// Surrounding context (a few lines around the error)
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Valid YAML with the wrong shape (wrong types, missing fields)
    InvalidSchema,
    /// Condition syntax error
    ExpressionError,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            file: None,
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach an excerpt of `source` around the error line
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column + 7) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Syntax error from `serde_yaml::from_str`
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));

        let mut parsed = ParseError::new(format_yaml_error_message(err), line, column)
            .with_kind(ParseErrorKind::YamlSyntax)
            .with_source_context(source, 2);
        parsed.suggestion = suggest_yaml_fix(err, source, line);
        parsed
    }

    /// Shape error from `serde_yaml::from_value`, which carries no location
    pub fn from_schema_error(err: &serde_yaml::Error) -> Self {
        let message = format_yaml_error_message(err);
        let mut parsed = ParseError::new(message, 0, 0);
        parsed.suggestion = suggest_schema_fix(&err.to_string());
        parsed
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        match (&self.file, self.line) {
            (Some(file), 0) => writeln!(f, "  --> {}", file)?,
            (Some(file), line) => writeln!(f, "  --> {}:{}:{}", file, line, self.column)?,
            (None, 0) => {}
            (None, line) => writeln!(f, "  --> line {}:{}", line, self.column)?,
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Format serde_yaml error message into something more readable
fn format_yaml_error_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();

    if msg.contains("missing field") {
        if let Some(field) = extract_field_name(&msg, "missing field `", "`") {
            return format!("missing required field '{}'", field);
        }
    }

    if msg.contains("unknown field") {
        if let Some(field) = extract_field_name(&msg, "unknown field `", "`") {
            return format!("unknown field '{}'", field);
        }
    }

    if msg.contains("did not match any variant of untagged enum StepAction") {
        return "step must define exactly one of 'script' or 'bash'".to_string();
    }

    if msg.contains("did not match any variant of untagged enum JobEntry") {
        return "job entry must be either a 'job:' definition or a 'template:' reference"
            .to_string();
    }

    if msg.contains("invalid type") {
        return format_invalid_type_error(&msg);
    }

    msg
}

fn extract_field_name(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn format_invalid_type_error(msg: &str) -> String {
    if let (Some(found), Some(expected)) = (
        extract_field_name(msg, "invalid type: ", ","),
        msg.find("expected ").map(|i| &msg[i + "expected ".len()..]),
    ) {
        let expected = expected.split(" at line").next().unwrap_or(expected);
        return format!("expected {}, but found {}", expected, found);
    }
    msg.to_string()
}

fn suggest_schema_fix(msg: &str) -> Option<String> {
    if msg.contains("missing field `job`") {
        return Some("each entry under 'jobs:' needs a 'job:' name or a 'template:' path".into());
    }
    if msg.contains("StepAction") {
        return Some("use 'script:' for sh or 'bash:' for bash".into());
    }
    None
}

/// Suggest fixes for common YAML errors
fn suggest_yaml_fix(err: &serde_yaml::Error, source: &str, line: usize) -> Option<String> {
    let msg = err.to_string();
    let lines: Vec<&str> = source.lines().collect();
    let error_line = lines.get(line.saturating_sub(1)).copied().unwrap_or("");

    if msg.contains("found character that cannot start any token") && error_line.contains('\t') {
        return Some(
            "YAML prefers spaces over tabs for indentation. Replace tabs with spaces.".to_string(),
        );
    }

    let typo_suggestions = [
        ("displayname", "displayName"),
        ("vmimage", "vmImage"),
        ("workingdirectory", "workingDirectory"),
        ("continueonerror", "continueOnError"),
        ("maxparallel", "maxParallel"),
    ];

    for (typo, correct) in typo_suggestions {
        if error_line.contains(typo) {
            return Some(format!("did you mean '{}'?", correct));
        }
    }

    None
}

/// Result type for parser operations
pub type ParseResult<T> = Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("missing required field 'steps'", 10, 5)
            .with_suggestion("add 'steps:' to define what the job should do");

        let output = format!("{}", err);
        assert!(output.contains("missing required field"));
        assert!(output.contains("line 10:5"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_display_with_file_and_unknown_location() {
        let err = ParseError::new("unknown field 'stepz'", 0, 0).with_file("ci/linux.yml");
        let output = err.to_string();
        assert!(output.contains("--> ci/linux.yml"));
        assert!(!output.contains("line 0"));
    }

    #[test]
    fn test_parse_error_with_source_context() {
        let source = r#"jobs:
  - job: Linux
    pool:
      vmImage: ubuntu-latest
    steps:"#;

        let err = ParseError::new("bad value", 4, 7).with_source_context(source, 1);
        assert!(err.context.contains(">    4 |"));
        assert!(err.context.contains("vmImage"));
        assert!(err.context.contains('^'));
    }

    #[test]
    fn test_from_yaml_error_reports_location() {
        let source = "jobs:\n  - job: Linux\n   steps: [\n";
        let err = serde_yaml::from_str::<serde_yaml::Value>(source).unwrap_err();
        let parsed = ParseError::from_yaml_error(&err, source);

        assert_eq!(parsed.kind, ParseErrorKind::YamlSyntax);
        assert!(parsed.line >= 1);
    }

    #[test]
    fn test_extract_field_name() {
        let msg = "missing field `steps` at line 10";
        assert_eq!(
            extract_field_name(msg, "missing field `", "`"),
            Some("steps".to_string())
        );
    }
}
