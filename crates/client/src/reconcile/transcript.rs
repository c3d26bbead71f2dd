// Chat transcript assembler.
//
// Merges streamed reply fragments into a single AI record. The tail record
// is replaced with a fresh value on every change instead of being edited in
// place, so snapshots handed out earlier never observe a mutation.

use chrono::{DateTime, Utc};

use caseroom_common::protocol::frames::ChatEvent;
use caseroom_common::types::ChatMessage;

/// Apply one chat event to the transcript.
pub fn assemble(
    mut transcript: Vec<ChatMessage>,
    event: ChatEvent,
    now: DateTime<Utc>,
) -> Vec<ChatMessage> {
    let streaming_tail = transcript.last().is_some_and(ChatMessage::is_streaming_ai);

    match event {
        ChatEvent::Fragment { text } => {
            if streaming_tail {
                if let Some(tail) = transcript.pop() {
                    let mut merged = tail.text;
                    merged.push_str(&text);
                    transcript.push(ChatMessage::ai_streaming(merged, tail.timestamp));
                }
            } else {
                transcript.push(ChatMessage::ai_streaming(text, now));
            }
        }
        ChatEvent::Final { text } => {
            if streaming_tail {
                transcript.pop();
            }
            transcript.push(ChatMessage::ai(text, now));
        }
    }

    transcript
}

/// Close off a reply that will never finish, e.g. because its connection
/// dropped. The partial text stays as a final record, so the next fragment
/// starts a new reply.
pub fn finalize_tail(mut transcript: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if transcript.last().is_some_and(ChatMessage::is_streaming_ai) {
        if let Some(tail) = transcript.pop() {
            transcript.push(ChatMessage::ai(tail.text, tail.timestamp));
        }
    }
    transcript
}

/// Append the user's own message. Used by the send path, never by inbound
/// events.
pub fn append_user(
    mut transcript: Vec<ChatMessage>,
    text: impl Into<String>,
    now: DateTime<Utc>,
) -> Vec<ChatMessage> {
    transcript.push(ChatMessage::user(text, now));
    transcript
}

/// Normalise a transcript fetched out of band: every record is final.
pub fn hydrate(fetched: impl IntoIterator<Item = ChatMessage>) -> Vec<ChatMessage> {
    fetched.into_iter().map(|message| ChatMessage { streaming: false, ..message }).collect()
}
