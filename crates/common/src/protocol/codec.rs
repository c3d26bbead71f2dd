// Inbound frame decoder.
//
// A frame is first parsed as a JSON object, then dispatched on its `type`
// discriminant. Known kinds are validated into `InboundEvent`s; unknown
// kinds are reported as `Decoded::Ignored` so newer servers can add events
// without breaking older clients.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use super::frames::{
    ChatEvent, DocumentUpdate, InboundEvent, OutboundFrame, CHAT_MESSAGE_OUT,
    CHAT_RESPONSE_CHUNK, DOCUMENT_UPDATE,
};
use crate::types::DocumentStatus;

/// Result of decoding a well-formed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(InboundEvent),
    /// A frame whose discriminant this client does not know about.
    Ignored { kind: String },
}

/// Why a frame was rejected.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `type` discriminant")]
    MissingDiscriminant,

    #[error("`{kind}` frame is missing `{field}`")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("`document_update` payload has no id")]
    MissingDocumentId,

    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RawDocumentPayload {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "filename")]
    file_name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

/// Decode one raw text frame.
pub fn decode_frame(raw: &str) -> Result<Decoded, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;
    let Value::Object(mut object) = value else {
        return Err(DecodeError::NotAnObject);
    };
    let kind = match object.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(DecodeError::MissingDiscriminant),
    };

    let event = match kind.as_str() {
        CHAT_RESPONSE_CHUNK => InboundEvent::Chat(ChatEvent::Fragment {
            text: take_text(&mut object, CHAT_RESPONSE_CHUNK)?,
        }),
        CHAT_MESSAGE_OUT => InboundEvent::Chat(ChatEvent::Final {
            text: take_text(&mut object, CHAT_MESSAGE_OUT)?,
        }),
        DOCUMENT_UPDATE => InboundEvent::Document(decode_document(object.remove("payload"))?),
        _ => return Ok(Decoded::Ignored { kind }),
    };
    Ok(Decoded::Event(event))
}

/// Encode a client -> server frame.
pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

fn take_text(object: &mut Map<String, Value>, kind: &'static str) -> Result<String, DecodeError> {
    let text: Option<String> = serde_json::from_value(object.remove("text").unwrap_or(Value::Null))
        .map_err(|source| DecodeError::InvalidPayload { kind, source })?;
    text.ok_or(DecodeError::MissingField { kind, field: "text" })
}

fn decode_document(payload: Option<Value>) -> Result<DocumentUpdate, DecodeError> {
    let payload = match payload {
        Some(Value::Null) | None => {
            return Err(DecodeError::MissingField { kind: DOCUMENT_UPDATE, field: "payload" })
        }
        Some(payload) => payload,
    };
    let raw: RawDocumentPayload = serde_json::from_value(payload)
        .map_err(|source| DecodeError::InvalidPayload { kind: DOCUMENT_UPDATE, source })?;

    let id = match raw.id {
        Some(Value::String(id)) => id,
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    };
    if id.trim().is_empty() {
        return Err(DecodeError::MissingDocumentId);
    }

    // Statuses newer than this client are dropped so the rest of the update
    // still applies; the reconciler keeps the prior status.
    let status = raw.status.and_then(|status| match status.parse::<DocumentStatus>() {
        Ok(status) => Some(status),
        Err(error) => {
            warn!(%id, %error, "ignoring unrecognised document status");
            None
        }
    });

    Ok(DocumentUpdate { id, file_name: raw.file_name, status, created_at: raw.created_at })
}
