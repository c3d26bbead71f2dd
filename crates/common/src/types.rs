// Core domain types shared across all caseroom crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A document attached to a case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    #[serde(alias = "filename")]
    pub file_name: String,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// `READY` and `COMPLETED` are both treated as "ready"; upstream pipelines
    /// report either one.
    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

/// Processing status of a case document.
///
/// Parsed case-insensitively; always serialized in upper case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    Pending,
    Ready,
    Completed,
    Failed,
    Deleted,
}

impl DocumentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Deleted => "DELETED",
        }
    }

    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Completed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDocumentStatus(pub String);

impl fmt::Display for UnknownDocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown document status `{}`", self.0)
    }
}

impl std::error::Error for UnknownDocumentStatus {}

impl FromStr for DocumentStatus {
    type Err = UnknownDocumentStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        [Self::Pending, Self::Ready, Self::Completed, Self::Failed, Self::Deleted]
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownDocumentStatus(value.to_string()))
    }
}

impl Serialize for DocumentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DocumentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Sender {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "AI")]
    Ai,
}

/// One entry of the case chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Set while an AI reply is still receiving fragments. Cleared by the
    /// terminal event; a cleared record is never touched again.
    #[serde(default)]
    pub streaming: bool,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { sender: Sender::User, text: text.into(), timestamp, streaming: false }
    }

    pub fn ai(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { sender: Sender::Ai, text: text.into(), timestamp, streaming: false }
    }

    pub fn ai_streaming(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { sender: Sender::Ai, text: text.into(), timestamp, streaming: true }
    }

    pub fn is_streaming_ai(&self) -> bool {
        self.sender == Sender::Ai && self.streaming
    }
}
