use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateSessionRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionCreateResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SaveResultRequest {
    pub result: Value,
}

/// Frames pushed by the server over `/ws/optimize/{session_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMessage {
    Progress {
        step: String,
        message: String,
    },
    ToolCalled {
        tool: String,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        result_summary: String,
    },
    Question {
        question_id: String,
        question: String,
        #[serde(default)]
        reason: String,
    },
    Completed {
        result: Value,
    },
    Error {
        error: String,
    },
    /// Any tag this client does not know about.
    #[serde(other)]
    #[schemars(skip)]
    Unknown,
}

impl SessionMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            SessionMessage::Progress { .. } => "progress",
            SessionMessage::ToolCalled { .. } => "tool_called",
            SessionMessage::Question { .. } => "question",
            SessionMessage::Completed { .. } => "completed",
            SessionMessage::Error { .. } => "error",
            SessionMessage::Unknown => "unknown",
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionCommand {
    Answer { question_id: String, answer: String },
}

/// Lenient view over a `completed` result, for display only.
#[derive(Debug, Default, Deserialize)]
pub struct OptimizationSummary {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub scores: Option<Value>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub analysis: Option<String>,
}

impl OptimizationSummary {
    pub fn from_result(result: &Value) -> Self {
        serde_json::from_value(result.clone()).unwrap_or_default()
    }
}
