//! Operator slash commands.
//!
//! Every command maps to one of three effects: a flag on the build (stop,
//! pause), a gate resolution or resume (start/continue), or a control signal
//! the orchestrator drains at its next checkpoint. `/status` is a synchronous
//! read and never reaches the orchestrator.

use serde::{Deserialize, Serialize};

use crate::errors::CommandError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "arg", rename_all = "snake_case")]
pub enum OperatorCommand {
    Stop,
    Pause,
    /// `/start` or `/continue`, optionally `phase N`
    Continue { phase: Option<u32> },
    Verify,
    Fix(String),
    Compact,
    Clear,
    Commit,
    Push,
    Pull,
    Status,
}

/// Work queued for the orchestrator's next checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    /// Operator instruction injected into the next prompts
    Instruction(String),
    /// Drop accumulated error context
    Compact,
    /// Drop queued instructions and pending signals
    Clear,
    Commit,
    Push,
    Pull,
    Verify,
}

impl OperatorCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Continue { .. } => "continue",
            Self::Verify => "verify",
            Self::Fix(_) => "fix",
            Self::Compact => "compact",
            Self::Clear => "clear",
            Self::Commit => "commit",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Status => "status",
        }
    }

    /// The checkpoint signal this command becomes, if it is one.
    pub fn as_signal(&self) -> Option<ControlSignal> {
        match self {
            Self::Verify => Some(ControlSignal::Verify),
            Self::Fix(text) => Some(ControlSignal::Instruction(text.clone())),
            Self::Compact => Some(ControlSignal::Compact),
            Self::Clear => Some(ControlSignal::Clear),
            Self::Commit => Some(ControlSignal::Commit),
            Self::Push => Some(ControlSignal::Push),
            Self::Pull => Some(ControlSignal::Pull),
            Self::Stop | Self::Pause | Self::Continue { .. } | Self::Status => None,
        }
    }
}

pub fn parse_command(input: &str) -> Result<OperatorCommand, CommandError> {
    let input = input.trim();
    let Some(body) = input.strip_prefix('/') else {
        return Err(CommandError::MissingSlash(input.to_string()));
    };
    let (name, rest) = match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (body, ""),
    };
    let name = name.to_lowercase();

    let no_args = |cmd: OperatorCommand| {
        if rest.is_empty() {
            Ok(cmd)
        } else {
            Err(CommandError::Malformed {
                command: name.clone(),
                message: "takes no arguments".to_string(),
            })
        }
    };

    match name.as_str() {
        "stop" => no_args(OperatorCommand::Stop),
        "pause" => no_args(OperatorCommand::Pause),
        "verify" => no_args(OperatorCommand::Verify),
        "compact" => no_args(OperatorCommand::Compact),
        "clear" => no_args(OperatorCommand::Clear),
        "commit" => no_args(OperatorCommand::Commit),
        "push" => no_args(OperatorCommand::Push),
        "pull" => no_args(OperatorCommand::Pull),
        "status" => no_args(OperatorCommand::Status),
        "start" | "continue" => parse_phase_arg(&name, rest),
        "fix" => {
            if rest.is_empty() {
                Err(CommandError::Malformed {
                    command: name.clone(),
                    message: "requires instruction text, e.g. /fix use async sessions".to_string(),
                })
            } else {
                Ok(OperatorCommand::Fix(rest.to_string()))
            }
        }
        "" => Err(CommandError::Malformed {
            command: String::new(),
            message: "is not a command".to_string(),
        }),
        _ => Err(CommandError::Unknown(name.clone())),
    }
}

fn parse_phase_arg(name: &str, rest: &str) -> Result<OperatorCommand, CommandError> {
    if rest.is_empty() {
        return Ok(OperatorCommand::Continue { phase: None });
    }
    let mut parts = rest.split_whitespace();
    let number = match (parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(n), None) if p.eq_ignore_ascii_case("phase") => n,
        (Some(n), None, None) => n,
        _ => {
            return Err(CommandError::Malformed {
                command: name.to_string(),
                message: "expects an optional 'phase N'".to_string(),
            });
        }
    };
    number
        .parse::<u32>()
        .map(|n| OperatorCommand::Continue { phase: Some(n) })
        .map_err(|_| CommandError::Malformed {
            command: name.to_string(),
            message: format!("phase must be a number, got '{}'", number),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse_command("/stop").unwrap(), OperatorCommand::Stop);
        assert_eq!(parse_command("  /PAUSE ").unwrap(), OperatorCommand::Pause);
        assert_eq!(parse_command("/status").unwrap(), OperatorCommand::Status);
        assert_eq!(parse_command("/pull").unwrap(), OperatorCommand::Pull);
    }

    #[test]
    fn test_start_and_continue_with_phase() {
        assert_eq!(
            parse_command("/start").unwrap(),
            OperatorCommand::Continue { phase: None }
        );
        assert_eq!(
            parse_command("/continue phase 3").unwrap(),
            OperatorCommand::Continue { phase: Some(3) }
        );
        assert_eq!(
            parse_command("/start 2").unwrap(),
            OperatorCommand::Continue { phase: Some(2) }
        );
        assert!(matches!(
            parse_command("/continue phase three"),
            Err(CommandError::Malformed { .. })
        ));
        assert!(matches!(
            parse_command("/continue from the top"),
            Err(CommandError::Malformed { .. })
        ));
    }

    #[test]
    fn test_fix_requires_text() {
        assert_eq!(
            parse_command("/fix use pydantic v2 models").unwrap(),
            OperatorCommand::Fix("use pydantic v2 models".into())
        );
        let err = parse_command("/fix").unwrap_err();
        assert!(err.to_string().contains("requires instruction text"));
    }

    #[test]
    fn test_errors_are_descriptive() {
        assert!(matches!(
            parse_command("stop"),
            Err(CommandError::MissingSlash(_))
        ));
        assert!(matches!(
            parse_command("/deploy"),
            Err(CommandError::Unknown(n)) if n == "deploy"
        ));
        assert!(matches!(
            parse_command("/push now"),
            Err(CommandError::Malformed { .. })
        ));
        assert!(parse_command("/").is_err());
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(
            parse_command("/fix x").unwrap().as_signal(),
            Some(ControlSignal::Instruction("x".into()))
        );
        assert_eq!(
            parse_command("/verify").unwrap().as_signal(),
            Some(ControlSignal::Verify)
        );
        assert!(parse_command("/stop").unwrap().as_signal().is_none());
        assert!(parse_command("/status").unwrap().as_signal().is_none());
    }
}
