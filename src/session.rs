//! Streaming client for a remote optimization session.
//!
//! One WebSocket per session, owned by a spawned task. Inbound frames are
//! decoded as [`SessionMessage`] and routed to the callbacks registered in
//! [`SessionHandlers`]; the only outbound traffic is `answer` commands.
//! Every failure is reported through callbacks, never returned.

use crate::config::websocket_url;
use crate::protocol::{SessionCommand, SessionMessage};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Reported through `on_error` for any transport failure. The underlying
/// error only goes to the log.
pub const CONNECTION_ERROR: &str = "WebSocket connection error";

type ProgressFn = Box<dyn FnMut(String, String) + Send>;
type ToolCalledFn = Box<dyn FnMut(String, Value, String) + Send>;
type QuestionFn = Box<dyn FnMut(String, String, String) + Send>;
type CompletedFn = Box<dyn FnMut(Value) + Send>;
type ErrorFn = Box<dyn FnMut(String) + Send>;
type CloseFn = Box<dyn FnMut() + Send>;

/// Optional callback per message tag. An unset callback means the message
/// class is not surfaced.
#[derive(Default)]
pub struct SessionHandlers {
    on_progress: Option<ProgressFn>,
    on_tool_called: Option<ToolCalledFn>,
    on_question: Option<QuestionFn>,
    on_completed: Option<CompletedFn>,
    on_error: Option<ErrorFn>,
    on_close: Option<CloseFn>,
}

/// What happened to a single inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered(&'static str),
    Unhandled(&'static str),
    UnknownTag,
    Malformed,
}

impl SessionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl FnMut(String, String) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_tool_called(mut self, f: impl FnMut(String, Value, String) + Send + 'static) -> Self {
        self.on_tool_called = Some(Box::new(f));
        self
    }

    pub fn on_question(mut self, f: impl FnMut(String, String, String) + Send + 'static) -> Self {
        self.on_question = Some(Box::new(f));
        self
    }

    pub fn on_completed(mut self, f: impl FnMut(Value) + Send + 'static) -> Self {
        self.on_completed = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(String) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Decode one text frame and invoke at most one callback for it.
    pub fn dispatch(&mut self, frame: &str) -> Dispatch {
        let message = match serde_json::from_str::<SessionMessage>(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed session frame: {}", e);
                return Dispatch::Malformed;
            }
        };

        let tag = message.tag();
        let delivered = match message {
            SessionMessage::Progress { step, message } => {
                call(&mut self.on_progress, |f| f(step, message))
            }
            SessionMessage::ToolCalled {
                tool,
                args,
                result_summary,
            } => call(&mut self.on_tool_called, |f| f(tool, args, result_summary)),
            SessionMessage::Question {
                question_id,
                question,
                reason,
            } => call(&mut self.on_question, |f| f(question_id, question, reason)),
            SessionMessage::Completed { result } => call(&mut self.on_completed, |f| f(result)),
            SessionMessage::Error { error } => call(&mut self.on_error, |f| f(error)),
            SessionMessage::Unknown => {
                debug!("Ignoring session frame with unknown type");
                return Dispatch::UnknownTag;
            }
        };

        if delivered {
            Dispatch::Delivered(tag)
        } else {
            Dispatch::Unhandled(tag)
        }
    }

    fn error(&mut self, message: &str) {
        call(&mut self.on_error, |f| f(message.to_string()));
    }

    fn close(&mut self) {
        call(&mut self.on_close, |f| f());
    }
}

fn call<F: ?Sized>(slot: &mut Option<Box<F>>, invoke: impl FnOnce(&mut F)) -> bool {
    match slot.as_deref_mut() {
        Some(f) => {
            invoke(f);
            true
        }
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

enum Outbound {
    Command(SessionCommand),
    Close,
}

/// Handle to one streaming session. Dropping it closes the connection.
pub struct OptimizeSession {
    commands: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<SessionState>,
}

impl OptimizeSession {
    /// Open the stream for `session_id`. Must be called inside a tokio
    /// runtime. Connection failures arrive through `handlers`.
    pub fn connect(api_base: &str, session_id: &str, handlers: SessionHandlers) -> Self {
        Self::connect_url(websocket_url(api_base, session_id), handlers)
    }

    pub fn connect_url(url: String, handlers: SessionHandlers) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Connecting);

        let task = SessionTask {
            url,
            handlers,
            commands: receiver,
            state: state_tx,
        };
        tokio::spawn(task.run());

        Self { commands, state }
    }

    /// Queue an `answer` frame. Nothing is awaited; pairing the id with the
    /// right question is up to the caller.
    pub fn send_answer(&self, question_id: impl Into<String>, answer: impl Into<String>) {
        let command = SessionCommand::Answer {
            question_id: question_id.into(),
            answer: answer.into(),
        };
        if self.commands.send(Outbound::Command(command)).is_err() {
            debug!("Session already closed, answer dropped");
        }
    }

    pub fn close(&self) {
        let _ = self.commands.send(Outbound::Close);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Resolves after `on_close` has run.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

struct SessionTask {
    url: String,
    handlers: SessionHandlers,
    commands: mpsc::UnboundedReceiver<Outbound>,
    state: watch::Sender<SessionState>,
}

impl SessionTask {
    async fn run(mut self) {
        let url = self.url.clone();
        let connect = connect_async(url.as_str());
        tokio::pin!(connect);

        let mut pending = Vec::new();
        let socket = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok((socket, _)) => break socket,
                    Err(e) => {
                        warn!("Failed to connect to {}: {}", self.url, e);
                        self.handlers.error(CONNECTION_ERROR);
                        return self.finish();
                    }
                },
                outbound = self.commands.recv() => match outbound {
                    Some(Outbound::Command(command)) => pending.push(command),
                    Some(Outbound::Close) | None => {
                        debug!("Session closed before {} opened", self.url);
                        return self.finish();
                    }
                },
            }
        };

        self.state.send_replace(SessionState::Open);
        debug!("Session stream open at {}", self.url);

        let (mut sender, mut receiver) = socket.split();

        for command in pending {
            if let Err(e) = send_command(&mut sender, &command).await {
                warn!("Failed to send queued command: {}", e);
                self.handlers.error(CONNECTION_ERROR);
                return self.finish();
            }
        }

        loop {
            tokio::select! {
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handlers.dispatch(&text);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Dropping binary session frame ({} bytes)", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Server closed session stream: {:?}", frame);
                        // Flushes the queued close reply.
                        let _ = sender.close().await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Session stream error: {}", e);
                        self.handlers.error(CONNECTION_ERROR);
                        break;
                    }
                    None => break,
                },
                outbound = self.commands.recv() => match outbound {
                    Some(Outbound::Command(command)) => {
                        if let Err(e) = send_command(&mut sender, &command).await {
                            warn!("Failed to send command: {}", e);
                            self.handlers.error(CONNECTION_ERROR);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
            }
        }

        self.finish();
    }

    fn finish(mut self) {
        self.handlers.close();
        self.state.send_replace(SessionState::Closed);
    }
}

async fn send_command<S>(
    sender: &mut S,
    command: &SessionCommand,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(command)?;
    sender.send(Message::Text(json.into())).await?;
    Ok(())
}
