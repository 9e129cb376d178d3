use crate::error::SinkError;
use crate::ports::notifier::{MessageId, NotificationSink};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Messages kept per session; the oldest are dropped first.
pub const HISTORY_PER_SESSION: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardMessage {
    pub id: MessageId,
    pub text: String,
    /// How many times the message was edited in place.
    pub edits: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BoardEvent {
    Posted {
        session: String,
        id: MessageId,
        text: String,
    },
    Edited {
        session: String,
        id: MessageId,
        text: String,
    },
}

/// In-memory notification sink keyed by session.
///
/// Keeps every message so the HTTP surface can list them, and publishes each
/// post and edit to subscribers.
#[derive(Debug)]
pub struct MessageBoard {
    messages: Mutex<HashMap<String, VecDeque<BoardMessage>>>,
    next_id: AtomicU64,
    max_len: usize,
    sender: broadcast::Sender<BoardEvent>,
}

impl MessageBoard {
    pub fn new(max_len: usize) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            messages: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_len: max_len.max(1),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.sender.subscribe()
    }

    pub fn messages(&self, session: &str) -> Vec<BoardMessage> {
        self.messages
            .lock()
            .get(session)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current text of every message in a session, oldest first.
    pub fn texts(&self, session: &str) -> Vec<String> {
        self.messages(session).into_iter().map(|m| m.text).collect()
    }

    fn check_len(&self, text: &str) -> Result<(), SinkError> {
        let len = text.chars().count();
        if len > self.max_len {
            return Err(SinkError::Rejected(format!(
                "message of {} characters exceeds limit of {}",
                len, self.max_len
            )));
        }
        Ok(())
    }

    fn publish(&self, event: BoardEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for MessageBoard {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl NotificationSink for MessageBoard {
    async fn post(&self, session: &str, text: &str) -> Result<MessageId, SinkError> {
        self.check_len(text)?;
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut messages = self.messages.lock();
            let list = messages.entry(session.to_string()).or_default();
            list.push_back(BoardMessage {
                id,
                text: text.to_string(),
                edits: 0,
            });
            while list.len() > HISTORY_PER_SESSION {
                list.pop_front();
            }
        }
        self.publish(BoardEvent::Posted {
            session: session.to_string(),
            id,
            text: text.to_string(),
        });
        Ok(id)
    }

    async fn edit(&self, session: &str, id: MessageId, text: &str) -> Result<(), SinkError> {
        self.check_len(text)?;
        {
            let mut messages = self.messages.lock();
            let message = messages
                .get_mut(session)
                .and_then(|list| list.iter_mut().find(|m| m.id == id))
                .ok_or(SinkError::UnknownMessage(id.0))?;
            message.text = text.to_string();
            message.edits += 1;
        }
        self.publish(BoardEvent::Edited {
            session: session.to_string(),
            id,
            text: text.to_string(),
        });
        Ok(())
    }

    fn max_message_len(&self) -> usize {
        self.max_len
    }
}
