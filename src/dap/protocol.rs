use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DAP request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

impl DapRequest {
    /// Decode request arguments.
    pub fn args<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.arguments.clone())
            .with_context(|| format!("{}: bad arguments", self.command))
    }
}

/// DAP response envelope.
///
/// Note: the DAP specification allows responses with no `body` field at all.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct Source {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct SourceBreakpoint {
    pub line: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsArguments {
    pub source: Source,
    #[serde(default)]
    pub breakpoints: Option<Vec<SourceBreakpoint>>,
    /// Deprecated form of `breakpoints`.
    #[serde(default)]
    pub lines: Option<Vec<i64>>,
}

impl SetBreakpointsArguments {
    pub fn requested_lines(&self) -> Vec<i64> {
        match (&self.breakpoints, &self.lines) {
            (Some(bps), _) => bps.iter().map(|bp| bp.line).collect(),
            (None, Some(lines)) => lines.clone(),
            (None, None) => vec![],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadArguments {
    pub thread_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArguments {
    pub thread_id: i64,
    #[serde(default)]
    pub levels: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    pub frame_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    pub variables_reference: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    pub expression: String,
    #[serde(default)]
    pub frame_id: Option<i64>,
}
