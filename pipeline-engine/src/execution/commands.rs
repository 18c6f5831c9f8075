// Logging Commands
// Parses `##vso[...]` lines a step writes to stdout

use crate::model::{Issue, IssueKind};

/// Result reported through `##vso[task.complete]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded,
    SucceededWithIssues,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggingCommand {
    /// `##vso[task.setvariable variable=N;issecret=true]V`
    SetVariable {
        name: String,
        value: String,
        is_secret: bool,
        is_output: bool,
    },
    /// `##vso[task.prependpath]P`
    PrependPath(String),
    /// `##vso[task.logissue type=warning]msg`
    LogIssue(Issue),
    /// `##vso[task.complete result=Failed]`
    Complete(TaskResult),
}

/// Every recognized command in `output`, in order
pub fn parse_output(output: &str) -> Vec<LoggingCommand> {
    output.lines().filter_map(parse_line).collect()
}

/// Parse one line; unknown or malformed commands yield `None`
pub fn parse_line(line: &str) -> Option<LoggingCommand> {
    let rest = line.trim_start().strip_prefix("##vso[")?;
    let (header, message) = rest.split_once(']')?;
    let message = message.trim_end_matches(['\r', '\n']);

    let (command, props) = header.split_once(' ').unwrap_or((header, ""));
    let props = Properties::parse(props);

    match command.to_lowercase().as_str() {
        "task.setvariable" => Some(LoggingCommand::SetVariable {
            name: props.get("variable")?.to_string(),
            value: message.to_string(),
            is_secret: props.flag("issecret"),
            is_output: props.flag("isoutput"),
        }),
        "task.prependpath" if !message.is_empty() => {
            Some(LoggingCommand::PrependPath(message.to_string()))
        }
        "task.logissue" => {
            let kind = match props.get("type")?.to_lowercase().as_str() {
                "warning" => IssueKind::Warning,
                "error" => IssueKind::Error,
                _ => return None,
            };
            Some(LoggingCommand::LogIssue(Issue {
                kind,
                message: message.to_string(),
            }))
        }
        "task.complete" => {
            let result = match props.get("result")?.to_lowercase().as_str() {
                "succeeded" => TaskResult::Succeeded,
                "succeededwithissues" => TaskResult::SucceededWithIssues,
                "failed" => TaskResult::Failed,
                _ => return None,
            };
            Some(LoggingCommand::Complete(result))
        }
        _ => None,
    }
}

/// `key=value;key=value` with case-insensitive keys
struct Properties<'a>(Vec<(String, &'a str)>);

impl<'a> Properties<'a> {
    fn parse(raw: &'a str) -> Self {
        Self(
            raw.split(';')
                .filter_map(|prop| prop.trim().split_once('='))
                .map(|(key, value)| (key.trim().to_lowercase(), value.trim()))
                .collect(),
        )
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| *value)
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}
