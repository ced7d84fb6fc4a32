//! Command template expansion.
//!
//! A sweep's `command` is a token list that may contain placeholders. Each
//! placeholder token is replaced by the expansion of the run's parameters;
//! everything else is passed through unchanged.

use serde_json::Value;
use sl_types::RunArgs;

/// Placeholder tokens and the strings they expand into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConvention {
    pub env_marker: String,
    pub env_command: String,
    pub program_marker: String,
    /// `--k=v` per parameter.
    pub args_marker: String,
    /// `k=v` per parameter.
    pub args_no_hyphens_marker: String,
    /// `--k v` per parameter, as two tokens.
    pub args_no_equals_marker: String,
    /// One JSON object token holding every parameter.
    pub args_json_marker: String,
}

impl Default for CommandConvention {
    fn default() -> Self {
        Self {
            env_marker: "${env}".into(),
            env_command: "/usr/bin/env".into(),
            program_marker: "${program}".into(),
            args_marker: "${args}".into(),
            args_no_hyphens_marker: "${args_no_hyphens}".into(),
            args_no_equals_marker: "${args_no_equals}".into(),
            args_json_marker: "${args_json}".into(),
        }
    }
}

impl CommandConvention {
    fn is_args_marker(&self, token: &str) -> bool {
        token == self.args_marker
            || token == self.args_no_hyphens_marker
            || token == self.args_no_equals_marker
            || token == self.args_json_marker
    }

    /// Expand `template` for one run. Without any args placeholder the
    /// `--k=v` flags are appended at the end.
    pub fn render(&self, template: &[String], args: &RunArgs, program: Option<&str>) -> Vec<String> {
        let mut out = Vec::with_capacity(template.len() + args.len());
        for token in template {
            if *token == self.env_marker {
                out.push(self.env_command.clone());
            } else if *token == self.program_marker {
                if let Some(program) = program {
                    out.push(program.to_string());
                }
            } else if *token == self.args_marker {
                out.extend(hyphenated(args));
            } else if *token == self.args_no_hyphens_marker {
                out.extend(args.iter().map(|(k, v)| format!("{k}={}", render_value(&v.value))));
            } else if *token == self.args_no_equals_marker {
                for (k, v) in args {
                    out.push(format!("--{k}"));
                    out.push(render_value(&v.value));
                }
            } else if *token == self.args_json_marker {
                out.push(args_json(args));
            } else {
                out.push(token.clone());
            }
        }

        if !template.iter().any(|token| self.is_args_marker(token)) {
            out.extend(hyphenated(args));
        }
        out
    }
}

fn hyphenated(args: &RunArgs) -> impl Iterator<Item = String> + '_ {
    args.iter()
        .map(|(k, v)| format!("--{k}={}", render_value(&v.value)))
}

/// Scalars render as JSON, except strings which go in bare.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn args_json(args: &RunArgs) -> String {
    let object: serde_json::Map<String, Value> = args
        .iter()
        .map(|(k, v)| (k.clone(), v.value.clone()))
        .collect();
    Value::Object(object).to_string()
}

/// Run args in the `{name: {"value": v}}` shape used for run configs.
pub fn run_config(args: &RunArgs) -> serde_json::Map<String, Value> {
    args.iter()
        .map(|(k, v)| (k.clone(), serde_json::json!({ "value": v.value })))
        .collect()
}
