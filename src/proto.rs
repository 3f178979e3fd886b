//! CLI ↔ daemon wire model: one JSON command line in, one JSON reply line
//! out, per connection. Commands are a union discriminated on `action`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Over,
    Into,
    Out,
}

impl StepKind {
    pub fn dap_command(self) -> &'static str {
        match self {
            StepKind::Over => "next",
            StepKind::Into => "stepIn",
            StepKind::Out => "stepOut",
        }
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "over" => Ok(StepKind::Over),
            "into" => Ok(StepKind::Into),
            "out" => Ok(StepKind::Out),
            other => Err(format!("unknown step kind `{other}`, expected over|into|out")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Start {
        script: String,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        breakpoints: Vec<String>,
        #[serde(default)]
        runtime: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        stop_on_entry: bool,
    },
    Attach {
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        pid: Option<i32>,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        runtime: Option<String>,
        #[serde(default)]
        breakpoints: Vec<String>,
    },
    Vars,
    Stack,
    Eval {
        expression: String,
    },
    Step {
        #[serde(default)]
        kind: Option<StepKind>,
    },
    Continue,
    Break {
        file: String,
        line: i64,
        #[serde(default)]
        condition: Option<String>,
    },
    Source {
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        line: Option<i64>,
    },
    Status,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub file: String,
    pub line: i64,
    pub function: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointInfo {
    pub file: String,
    pub line: i64,
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", default)]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameInfo {
    pub name: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<i64>,
}

/// Loose result map; every verb fills the fields it has.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakpoints: Option<Vec<BreakpointInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Vec<VariableInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<FrameInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Reply {
        Reply {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn state(state: &str) -> Reply {
        Reply {
            state: Some(state.to_string()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_decode_from_action_tag() {
        let cmd: Command = serde_json::from_str(r#"{"action":"vars"}"#).unwrap();
        assert!(matches!(cmd, Command::Vars));

        let cmd: Command =
            serde_json::from_str(r#"{"action":"eval","expression":"data['age']"}"#).unwrap();
        match cmd {
            Command::Eval { expression } => assert_eq!(expression, "data['age']"),
            other => panic!("unexpected command {other:?}"),
        }

        let cmd: Command = serde_json::from_str(
            r#"{"action":"start","script":"app.py","breakpoints":["app.py:25"]}"#,
        )
        .unwrap();
        match cmd {
            Command::Start {
                script,
                breakpoints,
                stop_on_entry,
                ..
            } => {
                assert_eq!(script, "app.py");
                assert_eq!(breakpoints, vec!["app.py:25"]);
                assert!(!stop_on_entry);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn step_kind_decodes_lowercase() {
        let cmd: Command = serde_json::from_str(r#"{"action":"step","kind":"into"}"#).unwrap();
        assert!(matches!(
            cmd,
            Command::Step {
                kind: Some(StepKind::Into)
            }
        ));
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"action":"dance"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{"verb":"vars"}"#).is_err());
    }

    #[test]
    fn reply_omits_empty_fields() {
        let encoded = serde_json::to_string(&Reply::state("idle")).unwrap();
        assert_eq!(encoded, r#"{"state":"idle"}"#);

        let encoded = serde_json::to_string(&Reply::error("boom")).unwrap();
        assert_eq!(encoded, r#"{"error":"boom"}"#);
    }
}
