//! Chat with the nutrition assistant, buffered or streamed.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ApiError, GENERIC_ERROR_MESSAGE, is_aborted};
use crate::sse::{SseDecoder, StreamEvent};

/// Placeholder text left in a streamed reply whose stream failed.
pub const CONNECTION_ERROR_MESSAGE: &str =
    "Sorry, I couldn't reach the assistant. Please check your connection and try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    #[serde(alias = "tool")]
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Only set on streamed replies, so updates can find their placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub is_streaming: bool,
}

impl ChatMessage {
    fn user(content: &str) -> Self {
        Self {
            role: ChatRole::User,
            content: content.to_string(),
            id: None,
            is_streaming: false,
        }
    }

    fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            id: None,
            is_streaming: false,
        }
    }

    fn placeholder(id: String) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: String::new(),
            id: Some(id),
            is_streaming: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatResponses {
    Many(Vec<ChatMessage>),
    One(ChatMessage),
}

/// Body of a buffered `POST /api/chatbot/send`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatReply {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub responses: Option<ChatResponses>,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_success() -> bool {
    true
}

impl ChatReply {
    /// Messages to append to the transcript, or the backend's own failure.
    pub fn into_messages(self) -> Result<Vec<ChatMessage>> {
        if !self.success {
            let message = self
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| GENERIC_ERROR_MESSAGE.to_string());
            return Err(ApiError::Backend(message).into());
        }
        let messages = match self.responses {
            Some(ChatResponses::Many(list)) => list,
            Some(ChatResponses::One(single)) => vec![single],
            None => self.message.map(ChatMessage::assistant).into_iter().collect(),
        };
        Ok(messages
            .into_iter()
            .map(|m| ChatMessage {
                id: None,
                is_streaming: false,
                ..m
            })
            .collect())
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// How the session reaches the chatbot endpoint.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// `{message, stream: false}`; returns the decoded reply body.
    async fn send_buffered(&self, message: &str) -> Result<ChatReply>;
    /// `{message, stream: true}`; returns the raw event-stream body.
    async fn open_stream(&self, message: &str) -> Result<ByteStream>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatSnapshot {
    pub messages: Vec<ChatMessage>,
    pub is_typing: bool,
}

#[derive(Default)]
struct ChatState {
    messages: Vec<ChatMessage>,
    in_flight: usize,
}

impl ChatState {
    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            messages: self.messages.clone(),
            is_typing: self.in_flight > 0,
        }
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.id.as_deref() == Some(id))
    }
}

struct ActiveStream {
    generation: u64,
    token: CancellationToken,
}

/// One conversation: the transcript plus at most one live stream.
///
/// Starting a streamed send cancels the stream before it. Cancellation is
/// silent: the superseded placeholder keeps whatever content it had.
pub struct ChatSession<T> {
    transport: T,
    state: Mutex<ChatState>,
    snapshots: watch::Sender<ChatSnapshot>,
    current: Mutex<Option<ActiveStream>>,
    generation: AtomicU64,
}

impl<T: ChatTransport> ChatSession<T> {
    pub fn new(transport: T) -> Self {
        let (snapshots, _) = watch::channel(ChatSnapshot::default());
        Self {
            transport,
            state: Mutex::new(ChatState::default()),
            snapshots,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock_state().messages.clone()
    }

    pub fn is_typing(&self) -> bool {
        self.lock_state().in_flight > 0
    }

    /// Receive a fresh snapshot after every transcript change.
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.subscribe()
    }

    /// Send `message` and record the reply in the transcript.
    ///
    /// Failures never escape: they end up as assistant messages (buffered)
    /// or as the placeholder's content (streamed).
    pub async fn send(&self, message: &str, streaming: bool) {
        let text = message.trim();
        if text.is_empty() {
            return;
        }

        self.update(|s| {
            s.messages.push(ChatMessage::user(text));
            s.in_flight += 1;
        });
        let _typing = TypingGuard { session: self };

        if streaming {
            self.send_streaming(text).await;
        } else {
            self.send_buffered(text).await;
        }
    }

    /// Cancel the live stream, if any.
    pub fn close(&self) {
        if let Some(active) = lock(&self.current).take() {
            active.token.cancel();
        }
    }

    async fn send_buffered(&self, text: &str) {
        let result = self
            .transport
            .send_buffered(text)
            .await
            .and_then(ChatReply::into_messages);

        match result {
            Ok(replies) => self.update(|s| s.messages.extend(replies)),
            Err(e) => {
                warn!(error = %e, "chat request failed");
                let content = e
                    .downcast_ref::<ApiError>()
                    .map_or_else(|| GENERIC_ERROR_MESSAGE.to_string(), ApiError::user_message);
                self.update(|s| s.messages.push(ChatMessage::assistant(content)));
            }
        }
    }

    async fn send_streaming(&self, text: &str) {
        let id = Uuid::new_v4().to_string();
        // The older stream is cancelled under the state lock, so it cannot
        // touch its placeholder once this one is in the transcript.
        let (generation, token) = self.update(|s| {
            let replaced = self.replace_stream();
            s.messages.push(ChatMessage::placeholder(id.clone()));
            replaced
        });

        match self.read_stream(text, &id, &token).await {
            Ok(()) => {}
            Err(e) if token.is_cancelled() || is_aborted(&e) => {
                debug!(%id, "chat stream superseded");
            }
            Err(e) => {
                warn!(%id, error = %e, "chat stream failed");
                let applied = self.update_stream(&id, &token, |m| {
                    m.content = CONNECTION_ERROR_MESSAGE.to_string();
                    m.is_streaming = false;
                });
                if !applied {
                    debug!(%id, "chat stream superseded");
                }
            }
        }

        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|a| a.generation == generation) {
            *current = None;
        }
    }

    /// Cancel whatever stream is live and install a new token, in one step.
    fn replace_stream(&self) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let previous = lock(&self.current).replace(ActiveStream {
            generation,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        (generation, token)
    }

    async fn read_stream(&self, text: &str, id: &str, token: &CancellationToken) -> Result<()> {
        let mut stream = tokio::select! {
            biased;
            () = token.cancelled() => return Err(ApiError::Aborted.into()),
            opened = self.transport.open_stream(text) => opened?,
        };

        let mut decoder = SseDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Err(ApiError::Aborted.into()),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            for data in decoder.push(&chunk?) {
                if self.apply_frame(id, &data, token)? {
                    return Ok(());
                }
            }
        }

        if let Some(data) = decoder.finish()
            && self.apply_frame(id, &data, token)?
        {
            return Ok(());
        }

        // Closed without a done frame
        if self.update_stream(id, token, |m| m.is_streaming = false) {
            Ok(())
        } else {
            Err(ApiError::Aborted.into())
        }
    }

    /// Returns `true` once the server marks the reply done.
    fn apply_frame(&self, id: &str, data: &str, token: &CancellationToken) -> Result<bool> {
        if token.is_cancelled() {
            return Err(ApiError::Aborted.into());
        }
        let event = match StreamEvent::parse(data) {
            Ok(event) => event,
            Err(e) => {
                warn!(%id, error = %e, "skipping malformed chat frame");
                return Ok(false);
            }
        };
        if let Some(error) = event.error {
            return Err(ApiError::Backend(error).into());
        }

        let applied = self.update_stream(id, token, |m| {
            if let Some(content) = event.content {
                m.content = content;
            }
            if event.done {
                m.is_streaming = false;
            }
        });
        if !applied {
            return Err(ApiError::Aborted.into());
        }
        Ok(event.done)
    }

    /// Apply `f` to placeholder `id` unless `token` has been cancelled.
    ///
    /// The check runs under the state lock, the same lock a newer send holds
    /// while cancelling. Returns `false` when the stream was superseded.
    fn update_stream(
        &self,
        id: &str,
        token: &CancellationToken,
        f: impl FnOnce(&mut ChatMessage),
    ) -> bool {
        self.update(|s| {
            if token.is_cancelled() {
                return false;
            }
            if let Some(m) = s.message_mut(id) {
                f(m);
            }
            true
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ChatState> {
        lock(&self.state)
    }

    fn update<R>(&self, f: impl FnOnce(&mut ChatState) -> R) -> R {
        let (out, snapshot) = {
            let mut state = self.lock_state();
            let out = f(&mut state);
            (out, state.snapshot())
        };
        self.snapshots.send_replace(snapshot);
        out
    }
}

impl<T> Drop for ChatSession<T> {
    fn drop(&mut self) {
        if let Some(active) = lock(&self.current).take() {
            active.token.cancel();
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears this send's share of the typing indicator however the send ends.
struct TypingGuard<'a, T: ChatTransport> {
    session: &'a ChatSession<T>,
}

impl<T: ChatTransport> Drop for TypingGuard<'_, T> {
    fn drop(&mut self) {
        self.session
            .update(|s| s.in_flight = s.in_flight.saturating_sub(1));
    }
}
