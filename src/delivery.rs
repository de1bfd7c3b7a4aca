//! Chunked delivery to size-bounded output channels.
//!
//! `chunk_text` is a pure fixed-width split on character boundaries.
//! `deliver` sends the chunks one at a time and waits for each send to be
//! acknowledged before starting the next, so a human reader sees them in order.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::errors::DeliveryError;

/// Discord rejects message content longer than this.
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

const FENCE_OPEN: &str = "```\n";
const FENCE_CLOSE: &str = "\n```";

/// Characters added to every chunk by code-fence wrapping.
pub const FENCE_OVERHEAD: usize = FENCE_OPEN.len() + FENCE_CLOSE.len();

/// Append-only message sink with a per-message size limit.
#[async_trait]
pub trait OutputChannel: Send + Sync {
    /// Send one message. Returns once the sink has acknowledged it.
    async fn send(&self, message: &str) -> Result<(), DeliveryError>;

    /// Maximum message length in characters.
    fn max_message_len(&self) -> usize;
}

/// Split `text` into contiguous `max_chars`-character chunks, the last one
/// holding the remainder. Text that already fits comes back as a single chunk.
pub fn chunk_text(text: &str, max_chars: NonZeroUsize) -> Vec<String> {
    let max = max_chars.get();
    if text.chars().count() <= max {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == max {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Send `text` as sequential chunks of at most `max_chunk_size` characters.
/// Returns the number of chunks sent; stops at the first failed send.
pub async fn deliver(
    channel: &dyn OutputChannel,
    text: &str,
    max_chunk_size: usize,
) -> Result<usize, DeliveryError> {
    deliver_with(channel, text, max_chunk_size, false).await
}

/// Like [`deliver`], optionally wrapping every chunk in a code fence. The
/// fence counts against `max_chunk_size`.
pub async fn deliver_with(
    channel: &dyn OutputChannel,
    text: &str,
    max_chunk_size: usize,
    code_fence: bool,
) -> Result<usize, DeliveryError> {
    let width = if code_fence {
        max_chunk_size.saturating_sub(FENCE_OVERHEAD)
    } else {
        max_chunk_size
    };
    let width = NonZeroUsize::new(width).ok_or(DeliveryError::ZeroChunkSize)?;

    let chunks = chunk_text(text, width);
    let total = chunks.len();
    for (index, chunk) in chunks.iter().enumerate() {
        if code_fence {
            channel
                .send(&format!("{}{}{}", FENCE_OPEN, chunk, FENCE_CLOSE))
                .await?;
        } else {
            channel.send(chunk).await?;
        }
        tracing::debug!(chunk = index + 1, total, "chunk delivered");
    }
    Ok(total)
}

/// Posts to a Discord-compatible webhook (`{"content": ...}`).
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    http: reqwest::Client,
    url: String,
    limit: usize,
}

impl WebhookChannel {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            limit: DISCORD_MESSAGE_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[async_trait]
impl OutputChannel for WebhookChannel {
    async fn send(&self, message: &str) -> Result<(), DeliveryError> {
        let len = message.chars().count();
        if len > self.limit {
            return Err(DeliveryError::TooLong {
                len,
                limit: self.limit,
            });
        }
        let response = self
            .http
            .post(&self.url)
            .json(&json!({ "content": message }))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    fn max_message_len(&self) -> usize {
        self.limit
    }
}

/// Writes each message to stdout. No size limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutChannel;

#[async_trait]
impl OutputChannel for StdoutChannel {
    async fn send(&self, message: &str) -> Result<(), DeliveryError> {
        println!("{}", message);
        Ok(())
    }

    fn max_message_len(&self) -> usize {
        usize::MAX
    }
}

/// Keeps every message in memory. Can be told to start failing after a
/// number of successful sends.
#[derive(Debug)]
pub struct RecordingChannel {
    messages: Mutex<Vec<String>>,
    limit: usize,
    fail_after: Option<usize>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::with_limit(DISCORD_MESSAGE_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            limit,
            fail_after: None,
        }
    }

    pub fn failing_after(mut self, successful_sends: usize) -> Self {
        self.fail_after = Some(successful_sends);
        self
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

impl Default for RecordingChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutputChannel for RecordingChannel {
    async fn send(&self, message: &str) -> Result<(), DeliveryError> {
        let len = message.chars().count();
        if len > self.limit {
            return Err(DeliveryError::TooLong {
                len,
                limit: self.limit,
            });
        }
        let mut messages = self.messages.lock().await;
        if self.fail_after.is_some_and(|n| messages.len() >= n) {
            return Err(DeliveryError::Transport("recording channel closed".into()));
        }
        messages.push(message.to_string());
        Ok(())
    }

    fn max_message_len(&self) -> usize {
        self.limit
    }
}
