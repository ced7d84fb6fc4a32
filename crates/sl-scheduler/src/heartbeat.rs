//! Agent heartbeat command decoding.

use serde_json::Value;
use sl_types::{RunArgs, SchedulerError, SweepResult};

/// A decoded heartbeat command.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    /// Start a trial.
    Run {
        run_id: String,
        args: RunArgs,
        program: Option<String>,
    },
    /// Stop the sweep, optionally lowering the run cap first.
    Stop { run_cap: Option<usize> },
}

impl AgentCommand {
    /// Decode one raw command. Unknown types and `run` commands without a
    /// run id are protocol violations.
    pub fn parse(raw: &Value) -> SweepResult<Self> {
        let command_type = raw.get("type").and_then(Value::as_str).unwrap_or_default();
        match command_type {
            "run" => {
                let run_id = raw
                    .get("run_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| SchedulerError::MissingRunId {
                        command: raw.to_string(),
                    })?;
                let args = match raw.get("args") {
                    None | Some(Value::Null) => RunArgs::new(),
                    Some(args) => serde_json::from_value(args.clone()).map_err(|e| {
                        SchedulerError::InvalidConfig {
                            message: format!("bad args for run {run_id}: {e}"),
                        }
                    })?,
                };
                let program = raw
                    .get("program")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                Ok(Self::Run {
                    run_id: run_id.to_string(),
                    args,
                    program,
                })
            }
            "stop" => {
                let run_cap = raw
                    .get("run_cap")
                    .and_then(Value::as_u64)
                    .map(|cap| cap as usize);
                Ok(Self::Stop { run_cap })
            }
            other => {
                let command_type = if other.is_empty() {
                    raw.get("type").map(Value::to_string).unwrap_or_else(|| "<missing>".into())
                } else {
                    other.to_string()
                };
                Err(SchedulerError::UnknownCommand { command_type }.into())
            }
        }
    }

    /// Decode a whole heartbeat reply. The first bad command aborts.
    pub fn parse_all(raw: &[Value]) -> SweepResult<Vec<Self>> {
        raw.iter().map(Self::parse).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sl_types::{ArgValue, SweepError};

    #[test]
    fn parses_run_command() {
        let command = AgentCommand::parse(&json!({
            "type": "run",
            "run_id": "mock-run-id-1",
            "args": {"foo_arg": {"value": 1}},
            "program": "train.py",
        }))
        .unwrap();

        let mut args = RunArgs::new();
        args.insert("foo_arg".into(), ArgValue::new(1));
        assert_eq!(
            command,
            AgentCommand::Run {
                run_id: "mock-run-id-1".into(),
                args,
                program: Some("train.py".into()),
            }
        );
    }

    #[test]
    fn parses_stop_with_run_cap() {
        assert_eq!(
            AgentCommand::parse(&json!({"type": "stop", "run_cap": 7})).unwrap(),
            AgentCommand::Stop { run_cap: Some(7) }
        );
        assert_eq!(
            AgentCommand::parse(&json!({"type": "stop"})).unwrap(),
            AgentCommand::Stop { run_cap: None }
        );
    }

    #[test]
    fn unknown_type_names_the_type() {
        let err = AgentCommand::parse(&json!({"type": "foo"})).unwrap_err();
        assert!(matches!(
            err,
            SweepError::Scheduler(SchedulerError::UnknownCommand { ref command_type })
                if command_type == "foo"
        ));
        assert!(err.to_string().contains("unknown command type in agent heartbeat: foo"));

        let err = AgentCommand::parse(&json!({"run_id": "x"})).unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn run_without_id_is_rejected() {
        let err = AgentCommand::parse(&json!({"type": "run"})).unwrap_err();
        assert!(err.to_string().contains("No run id in agent heartbeat"));
    }

    #[test]
    fn parse_all_stops_at_first_violation() {
        let raw = vec![
            json!({"type": "run", "run_id": "a"}),
            json!({"type": "resume"}),
        ];
        assert!(AgentCommand::parse_all(&raw).is_err());
        assert_eq!(AgentCommand::parse_all(&raw[..1]).unwrap().len(), 1);
    }
}
