use crate::api::ApiClient;
use crate::config::ClientConfig;
use crate::protocol::{CreateSessionRequest, OptimizationSummary, SessionCommand, SessionMessage};
use crate::session::{OptimizeSession, SessionHandlers};
use schemars::schema_for;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const ARGS_PREVIEW: usize = 200;

/// Session callbacks, forwarded to the command loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CliEvent {
    Progress {
        step: String,
        message: String,
    },
    ToolCalled {
        tool: String,
        args: Value,
        result_summary: String,
    },
    Question {
        question_id: String,
        question: String,
        reason: String,
    },
    Completed(Value),
    Error(String),
    Closed,
}

impl CliEvent {
    fn lines(&self) -> Vec<String> {
        match self {
            CliEvent::Progress { step, message } => vec![format!("[{}] {}", step, message)],
            CliEvent::ToolCalled {
                tool,
                args,
                result_summary,
            } => {
                let args = serde_json::to_string(args).unwrap_or_default();
                let mut lines = vec![format!(
                    "tool: {}({})",
                    tool,
                    truncate(&args, ARGS_PREVIEW, "...")
                )];
                if !result_summary.is_empty() {
                    lines.push(format!("  → {}", result_summary));
                }
                lines
            }
            CliEvent::Question {
                question_id,
                question,
                reason,
            } => {
                let mut lines = vec![format!("? [{}] {}", question_id, question)];
                if !reason.is_empty() {
                    lines.push(format!("  ({})", reason));
                }
                lines
            }
            CliEvent::Completed(result) => summary_lines(result),
            CliEvent::Error(message) => vec![format!("error: {}", message)],
            CliEvent::Closed => Vec::new(),
        }
    }
}

fn summary_lines(result: &Value) -> Vec<String> {
    let summary = OptimizationSummary::from_result(result);
    let mut lines = vec!["✓ Optimization complete".to_string()];

    if let Some(prompt) = &summary.prompt {
        lines.push("Prompt:".to_string());
        lines.extend(prompt.lines().map(|line| format!("  {}", line)));
    }
    if let Some(scores) = &summary.scores {
        lines.push(format!("Scores: {}", scores));
    }
    if !summary.improvements.is_empty() {
        lines.push("Improvements:".to_string());
        lines.extend(summary.improvements.iter().map(|item| format!("  - {}", item)));
    }
    if let Some(analysis) = &summary.analysis {
        lines.push(format!("Analysis: {}", analysis));
    }
    if lines.len() == 1 {
        lines.push(serde_json::to_string_pretty(result).unwrap_or_default());
    }

    lines
}

fn truncate(value: &str, max: usize, suffix: &str) -> String {
    match value.char_indices().nth(max) {
        Some((end, _)) => format!("{}{}", &value[..end], suffix),
        None => value.to_string(),
    }
}

/// Parses `--answer ID=TEXT`.
pub fn parse_answer(value: &str) -> Result<(String, String), String> {
    let (id, answer) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=TEXT, got `{}`", value))?;
    if id.trim().is_empty() {
        return Err(format!("missing question id in `{}`", value));
    }
    Ok((id.trim().to_string(), answer.to_string()))
}

pub struct StreamOptions {
    pub answers: HashMap<String, String>,
    pub save: bool,
}

fn forwarding_handlers(sender: mpsc::UnboundedSender<CliEvent>) -> SessionHandlers {
    let progress = sender.clone();
    let tool = sender.clone();
    let question = sender.clone();
    let completed = sender.clone();
    let error = sender.clone();
    let closed = sender;

    SessionHandlers::new()
        .on_progress(move |step, message| {
            let _ = progress.send(CliEvent::Progress { step, message });
        })
        .on_tool_called(move |tool_name, args, result_summary| {
            let _ = tool.send(CliEvent::ToolCalled {
                tool: tool_name,
                args,
                result_summary,
            });
        })
        .on_question(move |question_id, text, reason| {
            let _ = question.send(CliEvent::Question {
                question_id,
                question: text,
                reason,
            });
        })
        .on_completed(move |result| {
            let _ = completed.send(CliEvent::Completed(result));
        })
        .on_error(move |message| {
            let _ = error.send(CliEvent::Error(message));
        })
        .on_close(move || {
            let _ = closed.send(CliEvent::Closed);
        })
}

pub async fn optimize(
    config: &ClientConfig,
    request: CreateSessionRequest,
    options: StreamOptions,
) -> CliResult<Value> {
    let api = ApiClient::new(config)?;
    let session_id = api.create_session(&request).await?;
    println!("session: {}", session_id);
    stream(config, &api, &session_id, options).await
}

pub async fn attach(
    config: &ClientConfig,
    session_id: &str,
    options: StreamOptions,
) -> CliResult<Value> {
    let api = ApiClient::new(config)?;
    stream(config, &api, session_id, options).await
}

async fn stream(
    config: &ClientConfig,
    api: &ApiClient,
    session_id: &str,
    options: StreamOptions,
) -> CliResult<Value> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let session = OptimizeSession::connect(&config.api_base, session_id, forwarding_handlers(sender));
    info!("Streaming session {} from {}", session_id, config.websocket_url(session_id));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut answers = options.answers;
    let mut result = None;
    let mut failure = None;

    while let Some(event) = receiver.recv().await {
        for line in event.lines() {
            println!("{}", line);
        }

        match event {
            CliEvent::Question { question_id, .. } => {
                let answer = match answers.remove(&question_id) {
                    Some(answer) => {
                        println!("> {}", answer);
                        Some(answer)
                    }
                    None => {
                        print!("> ");
                        std::io::stdout().flush()?;
                        stdin.next_line().await?
                    }
                };

                match answer {
                    Some(answer) => session.send_answer(question_id, answer.trim()),
                    None => {
                        failure = Some("stdin closed before the question was answered".to_string());
                        session.close();
                    }
                }
            }
            CliEvent::Completed(value) => {
                result = Some(value);
                session.close();
            }
            CliEvent::Error(message) => failure = Some(message),
            CliEvent::Closed => break,
            CliEvent::Progress { .. } | CliEvent::ToolCalled { .. } => {}
        }
    }

    session.closed().await;
    debug!("Session {} stream ended ({:?})", session_id, session.state());

    let Some(result) = result else {
        let reason = failure.unwrap_or_else(|| "stream ended without a result".to_string());
        return Err(format!("Session {} did not complete: {}", session_id, reason).into());
    };

    if options.save {
        api.save_result(session_id, &result).await?;
        println!("saved result for session {}", session_id);
    }

    Ok(result)
}

pub async fn load_prompt(prompt: Option<String>, file: Option<PathBuf>) -> CliResult<String> {
    let prompt = match (prompt, file) {
        (Some(prompt), _) => prompt,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Error reading {}: {}", path.display(), e))?,
        (None, None) => return Err("pass --prompt or --file".into()),
    };

    if prompt.trim().is_empty() {
        return Err("prompt is empty".into());
    }
    Ok(prompt)
}

pub fn protocol_schema() -> CliResult<String> {
    let inbound = schema_for!(SessionMessage);
    let outbound = schema_for!(SessionCommand);
    let schema = json!({ "inbound": inbound, "outbound": outbound });
    Ok(serde_json::to_string_pretty(&schema)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server;

    #[test]
    fn parse_answer_splits_on_first_equals() {
        assert_eq!(
            parse_answer("q1=formal=ish").unwrap(),
            ("q1".to_string(), "formal=ish".to_string())
        );
        assert!(parse_answer("formal").is_err());
        assert!(parse_answer("=formal").is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2, "..."), "hé...");
        assert_eq!(truncate("short", 10, "..."), "short");
    }

    #[test]
    fn tool_lines_truncate_long_args() {
        let event = CliEvent::ToolCalled {
            tool: "score".to_string(),
            args: json!({"text": "x".repeat(500)}),
            result_summary: "ok".to_string(),
        };
        let lines = event.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("tool: score({"));
        assert!(lines[0].ends_with("...)"));
        assert_eq!(lines[1], "  → ok");
    }

    #[test]
    fn completed_lines_fall_back_to_raw_json() {
        let lines = CliEvent::Completed(json!({"other": 1})).lines();
        assert_eq!(lines[0], "✓ Optimization complete");
        assert!(lines[1].contains("\"other\": 1"));
    }

    #[test]
    fn schema_lists_every_tag() {
        let schema = protocol_schema().unwrap();
        for tag in ["progress", "tool_called", "question", "completed", "error", "answer"] {
            assert!(schema.contains(tag), "missing {}", tag);
        }
    }

    #[tokio::test]
    async fn optimize_with_preset_answer_returns_result() {
        let base = server::spawn(None).await;
        let config = ClientConfig::new(&base);
        let answers = HashMap::from([(server::QUESTION_ID.to_string(), "playful".to_string())]);

        let result = optimize(
            &config,
            CreateSessionRequest {
                prompt: "Write a product blurb".to_string(),
                goal: None,
            },
            StreamOptions {
                answers,
                save: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            result["prompt"],
            "Write a product blurb\n\nRespond in a playful tone."
        );
    }

    #[tokio::test]
    async fn attach_with_save_stores_the_result() {
        let base = server::spawn(None).await;
        let config = ClientConfig::new(&base);
        let api = ApiClient::new(&config).unwrap();
        let session_id = api
            .create_session(&CreateSessionRequest {
                prompt: "Name a cat".to_string(),
                goal: None,
            })
            .await
            .unwrap();
        let answers = HashMap::from([(server::QUESTION_ID.to_string(), "whimsical".to_string())]);

        let result = attach(
            &config,
            &session_id,
            StreamOptions {
                answers,
                save: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(result["prompt"], "Name a cat\n\nRespond in a whimsical tone.");
        assert_eq!(api.fetch_result(&session_id).await.unwrap(), Some(result));
    }

    #[tokio::test]
    async fn attach_to_missing_session_fails() {
        let base = server::spawn(None).await;
        let config = ClientConfig::new(&base);

        let err = attach(
            &config,
            "missing",
            StreamOptions {
                answers: HashMap::new(),
                save: false,
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("WebSocket connection error"));
    }

    #[tokio::test]
    async fn load_prompt_rejects_blank_text() {
        assert!(load_prompt(Some("  ".to_string()), None).await.is_err());
        assert!(load_prompt(None, None).await.is_err());
        assert_eq!(
            load_prompt(Some("hi".to_string()), None).await.unwrap(),
            "hi"
        );
    }
}
