// Typed events carried by the case stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Document, DocumentStatus};

pub const CHAT_RESPONSE_CHUNK: &str = "chat_response_chunk";
pub const CHAT_MESSAGE_OUT: &str = "chat_message_out";
pub const DOCUMENT_UPDATE: &str = "document_update";

/// A decoded server -> client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Chat(ChatEvent),
    Document(DocumentUpdate),
}

/// Assistant reply traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Incremental piece of a reply that is still being produced.
    Fragment { text: String },
    /// The complete reply text. Replaces whatever fragments preceded it.
    Final { text: String },
}

/// A document-shaped payload from a `document_update` frame.
///
/// Only `id` is guaranteed; any other field may be absent, in which case the
/// reconciler keeps the previously known value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpdate {
    pub id: String,
    pub file_name: Option<String>,
    pub status: Option<DocumentStatus>,
    pub created_at: Option<DateTime<Utc>>,
}

impl DocumentUpdate {
    pub fn is_delete(&self) -> bool {
        self.status == Some(DocumentStatus::Deleted)
    }
}

impl From<Document> for DocumentUpdate {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            file_name: Some(doc.file_name),
            status: Some(doc.status),
            created_at: Some(doc.created_at),
        }
    }
}

/// Client -> server frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    ChatMessage { payload: ChatPayload },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatPayload {
    pub text: String,
}

impl OutboundFrame {
    pub fn chat_message(text: impl Into<String>) -> Self {
        Self::ChatMessage { payload: ChatPayload { text: text.into() } }
    }
}
