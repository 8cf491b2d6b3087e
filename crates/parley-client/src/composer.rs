use std::collections::HashMap;
use std::future::Future;

use tracing::{debug, warn};

use parley_types::models::{Message, UserId, normalize_content};
use parley_types::ChatResult;

use crate::api::ApiClient;
use crate::typing::TypingDebouncer;

/// Anything that can store a message on the server.
pub trait MessageSender {
    fn send_message(&self, partner: UserId, content: &str) -> impl Future<Output = ChatResult<Message>> + Send;
}

impl MessageSender for ApiClient {
    fn send_message(&self, partner: UserId, content: &str) -> impl Future<Output = ChatResult<Message>> + Send {
        ApiClient::send_message(self, partner, content)
    }
}

/// Per-conversation drafts that survive failed sends.
///
/// A draft is cleared only once the server has returned the stored message,
/// so a failed or timed-out send can be retried with the same text.
pub struct Composer<S> {
    sender: S,
    drafts: HashMap<UserId, String>,
    typing: Option<TypingDebouncer>,
}

impl<S: MessageSender> Composer<S> {
    pub fn new(sender: S) -> Self {
        Self {
            sender,
            drafts: HashMap::new(),
            typing: None,
        }
    }

    /// Report edits as typing activity.
    pub fn with_typing(mut self, typing: TypingDebouncer) -> Self {
        self.typing = Some(typing);
        self
    }

    pub fn edit(&mut self, partner: UserId, text: impl Into<String>) {
        let text = text.into();
        if let Some(typing) = &self.typing {
            if text.trim().is_empty() {
                typing.stop(partner);
            } else {
                typing.keystroke(partner);
            }
        }
        self.drafts.insert(partner, text);
    }

    pub fn draft(&self, partner: UserId) -> &str {
        self.drafts.get(&partner).map(String::as_str).unwrap_or("")
    }

    pub fn discard(&mut self, partner: UserId) {
        self.drafts.remove(&partner);
        if let Some(typing) = &self.typing {
            typing.stop(partner);
        }
    }

    /// Send the draft for `partner`. On success the draft is cleared and the
    /// stored message returned; on failure the draft is kept and the error
    /// tells whether a retry can help (`ChatError::is_retryable`).
    pub async fn send_draft(&mut self, partner: UserId) -> ChatResult<Message> {
        let content = normalize_content(self.draft(partner))?;

        match self.sender.send_message(partner, &content).await {
            Ok(message) => {
                debug!("Draft to {} stored as message {}", partner, message.id);
                self.drafts.remove(&partner);
                if let Some(typing) = &self.typing {
                    typing.stop(partner);
                }
                Ok(message)
            }
            Err(e) => {
                warn!("Send to {} failed (retryable: {}): {}", partner, e.is_retryable(), e);
                Err(e)
            }
        }
    }
}
