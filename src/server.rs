//! Rehearsal server: speaks the optimization session protocol and replays a
//! fixed script, so clients can be exercised without the hosted backend.

use crate::protocol::{
    CreateSessionRequest, SaveResultRequest, SessionCommand, SessionCreateResponse,
    SessionMessage,
};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const QUESTION_ID: &str = "q1";

pub struct ServerConfig {
    pub listen: String,
    pub auth_token: Option<String>,
}

struct ServerState {
    sessions: Mutex<HashMap<String, Arc<SessionRecord>>>,
    auth_token: Option<String>,
}

struct SessionRecord {
    prompt: String,
    goal: Option<String>,
    streaming: AtomicBool,
    result: Mutex<Option<Value>>,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let listener = TcpListener::bind(&config.listen).await?;
    info!("promptwire rehearsal server listening on http://{}", config.listen);
    if config.auth_token.is_some() {
        info!("REST routes require a bearer token");
    }
    serve(listener, config.auth_token).await
}

pub async fn serve(listener: TcpListener, auth_token: Option<String>) -> ServerResult<()> {
    let state = Arc::new(ServerState {
        sessions: Mutex::new(HashMap::new()),
        auth_token,
    });

    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/optimize/sessions", post(create_session))
        .route(
            "/api/optimize/sessions/:id/result",
            post(save_result).get(fetch_result),
        )
        .route("/ws/optimize/:id", get(optimize_socket))
        .with_state(state)
}

async fn create_session(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<Json<SessionCreateResponse>, StatusCode> {
    authorize(&headers, state.auth_token.as_deref())?;

    if payload.prompt.trim().is_empty() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let session_id = Uuid::new_v4().to_string();
    let record = Arc::new(SessionRecord {
        prompt: payload.prompt,
        goal: payload.goal,
        streaming: AtomicBool::new(false),
        result: Mutex::new(None),
    });

    state
        .sessions
        .lock()
        .await
        .insert(session_id.clone(), record);
    info!("Created session {}", session_id);

    Ok(Json(SessionCreateResponse { session_id }))
}

async fn save_result(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<SaveResultRequest>,
) -> Result<StatusCode, StatusCode> {
    authorize(&headers, state.auth_token.as_deref())?;

    let record = find_session(&state, &session_id).await?;
    *record.result.lock().await = Some(payload.result);
    info!("Saved result for session {}", session_id);

    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_result(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SaveResultRequest>, StatusCode> {
    authorize(&headers, state.auth_token.as_deref())?;

    let record = find_session(&state, &session_id).await?;
    let result = record.result.lock().await.clone();
    result
        .map(|result| Json(SaveResultRequest { result }))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn optimize_socket(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let record = find_session(&state, &session_id).await?;

    let claim = StreamClaim::acquire(record).ok_or(StatusCode::CONFLICT)?;
    let failed_id = session_id.clone();

    Ok(ws
        .on_failed_upgrade(move |e| warn!("Upgrade for session {} failed: {}", failed_id, e))
        .on_upgrade(move |socket| async move {
            if let Err(e) = replay_session(socket, &claim.0).await {
                warn!("Session {} stream failed: {}", session_id, e);
            }
            debug!("Session {} stream finished", session_id);
        }))
}

/// Marks a session as streaming until dropped. The upgrade callback owns it,
/// so a failed upgrade releases the session too.
struct StreamClaim(Arc<SessionRecord>);

impl StreamClaim {
    fn acquire(record: Arc<SessionRecord>) -> Option<Self> {
        record
            .streaming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self(record))
    }
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        self.0.streaming.store(false, Ordering::Release);
    }
}

async fn replay_session(socket: WebSocket, record: &SessionRecord) -> ServerResult<()> {
    let (mut sender, mut receiver) = socket.split();
    let words = record.prompt.split_whitespace().count();

    send(
        &mut sender,
        &SessionMessage::Progress {
            step: "analyze".to_string(),
            message: format!("Analyzing prompt ({} words)", words),
        },
    )
    .await?;
    send(
        &mut sender,
        &SessionMessage::ToolCalled {
            tool: "score_prompt".to_string(),
            args: json!({ "words": words, "goal": record.goal }),
            result_summary: format!("baseline score {}", baseline_score(words)),
        },
    )
    .await?;
    send(
        &mut sender,
        &SessionMessage::Question {
            question_id: QUESTION_ID.to_string(),
            question: "Which tone should the prompt use?".to_string(),
            reason: "The prompt does not state its audience".to_string(),
        },
    )
    .await?;

    let tone = loop {
        let text = match receiver.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                debug!("Client left before answering");
                return Ok(());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        match serde_json::from_str::<SessionCommand>(&text) {
            Ok(SessionCommand::Answer {
                question_id,
                answer,
            }) if question_id == QUESTION_ID => break answer,
            Ok(SessionCommand::Answer { question_id, .. }) => {
                let error = format!("Unknown question_id: {}", question_id);
                send(&mut sender, &SessionMessage::Error { error }).await?;
            }
            Err(e) => {
                let error = format!("Invalid message: {}", e);
                send(&mut sender, &SessionMessage::Error { error }).await?;
            }
        }
    };

    send(
        &mut sender,
        &SessionMessage::Progress {
            step: "rewrite".to_string(),
            message: format!("Rewriting for a {} tone", tone),
        },
    )
    .await?;
    send(
        &mut sender,
        &SessionMessage::Completed {
            result: rehearsal_result(record, &tone, words),
        },
    )
    .await?;
    sender.send(Message::Close(None)).await?;

    Ok(())
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &SessionMessage,
) -> ServerResult<()> {
    let json = serde_json::to_string(message)?;
    sender.send(Message::Text(json)).await?;
    Ok(())
}

fn baseline_score(words: usize) -> u64 {
    (40 + words.min(40)) as u64
}

fn rehearsal_result(record: &SessionRecord, tone: &str, words: usize) -> Value {
    let before = baseline_score(words);
    let mut improvements = vec![format!("Stated a {} tone", tone)];
    if let Some(goal) = &record.goal {
        improvements.push(format!("Anchored on the goal: {}", goal));
    }

    json!({
        "prompt": format!("{}\n\nRespond in a {} tone.", record.prompt.trim(), tone),
        "scores": { "before": before, "after": (before + 15).min(100) },
        "improvements": improvements,
        "analysis": "Rehearsal run: the result is scripted, not scored.",
    })
}

async fn find_session(
    state: &ServerState,
    session_id: &str,
) -> Result<Arc<SessionRecord>, StatusCode> {
    let sessions = state.sessions.lock().await;
    sessions.get(session_id).cloned().ok_or(StatusCode::NOT_FOUND)
}

fn authorize(headers: &HeaderMap, token: Option<&str>) -> Result<(), StatusCode> {
    let Some(token) = token else {
        return Ok(());
    };

    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match header {
        Some(value) if value == format!("Bearer {}", token) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
pub(crate) async fn spawn(auth_token: Option<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(listener, auth_token).await.unwrap();
    });
    format!("http://{}", addr)
}
