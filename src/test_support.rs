use crate::session::SessionHandlers;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Progress(String, String),
    ToolCalled(String, Value, String),
    Question(String, String, String),
    Completed(Value),
    Error(String),
    Close,
}

/// Handlers that record every callback, in order, on a channel.
pub fn recording_handlers() -> (SessionHandlers, mpsc::UnboundedReceiver<Seen>) {
    let (sender, receiver) = mpsc::unbounded_channel();

    let progress = sender.clone();
    let tool = sender.clone();
    let question = sender.clone();
    let completed = sender.clone();
    let error = sender.clone();
    let close = sender;

    let handlers = SessionHandlers::new()
        .on_progress(move |step, message| {
            let _ = progress.send(Seen::Progress(step, message));
        })
        .on_tool_called(move |name, args, summary| {
            let _ = tool.send(Seen::ToolCalled(name, args, summary));
        })
        .on_question(move |id, text, reason| {
            let _ = question.send(Seen::Question(id, text, reason));
        })
        .on_completed(move |result| {
            let _ = completed.send(Seen::Completed(result));
        })
        .on_error(move |message| {
            let _ = error.send(Seen::Error(message));
        })
        .on_close(move || {
            let _ = close.send(Seen::Close);
        });

    (handlers, receiver)
}

pub async fn next_seen(receiver: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("handlers dropped")
}

pub struct FrameServer {
    pub api_base: String,
    pub received: mpsc::UnboundedReceiver<String>,
    /// One entry per close frame answered by the client after `hang_up`.
    pub close_replies: mpsc::UnboundedReceiver<()>,
    hang_up: Arc<Notify>,
}

impl FrameServer {
    /// Make the server send a close frame.
    pub fn hang_up(&self) {
        self.hang_up.notify_one();
    }
}

#[derive(Clone)]
struct FrameState {
    frames: Arc<Vec<String>>,
    received: mpsc::UnboundedSender<String>,
    close_replies: mpsc::UnboundedSender<()>,
    hang_up: Arc<Notify>,
}

/// WebSocket server that pushes `frames` verbatim to each client on
/// `/ws/optimize/:id`, then reports every text frame it receives.
pub async fn spawn_frame_server(frames: Vec<String>) -> FrameServer {
    let (received_tx, received) = mpsc::unbounded_channel();
    let (close_tx, close_replies) = mpsc::unbounded_channel();
    let hang_up = Arc::new(Notify::new());
    let state = FrameState {
        frames: Arc::new(frames),
        received: received_tx,
        close_replies: close_tx,
        hang_up: hang_up.clone(),
    };

    let app = axum::Router::new()
        .route("/ws/optimize/:id", get(upgrade))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FrameServer {
        api_base: format!("http://{}", addr),
        received,
        close_replies,
        hang_up,
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<FrameState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| replay(socket, state))
}

async fn replay(socket: WebSocket, state: FrameState) {
    let (mut sender, mut receiver) = socket.split();

    for frame in state.frames.iter() {
        if sender.send(Message::Text(frame.clone())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = state.received.send(text);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = state.hang_up.notified() => {
                let _ = sender.send(Message::Close(None)).await;
                while let Some(Ok(msg)) = receiver.next().await {
                    if let Message::Close(_) = msg {
                        let _ = state.close_replies.send(());
                        break;
                    }
                }
                break;
            }
        }
    }
}
