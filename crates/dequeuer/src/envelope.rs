//! Transport envelope parsing
//!
//! Messages arrive wrapped twice: the outer body is a JSON notification
//! object, and its `Message` field is a JSON-encoded string holding the
//! application payload.

use serde_json::Value;

use crate::queue::{RawMessage, ReceiptHandle};

/// Key of the outer envelope that carries the encoded payload
pub const MESSAGE_FIELD: &str = "Message";

/// Reasons a raw message cannot be turned into a [`MessageEnvelope`]
#[derive(Debug, thiserror::Error)]
pub enum MalformedMessage {
    /// Body is missing or blank
    #[error("message body is empty")]
    Empty,

    /// Outer body is not JSON
    #[error("body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Outer body is JSON but not an object
    #[error("body is not a JSON object")]
    NotAnObject,

    /// Outer object has no `Message` key
    #[error("body has no \"Message\" field")]
    MissingMessage,

    /// `Message` is present but is not a string
    #[error("\"Message\" field is not a string")]
    MessageNotString,

    /// `Message` string does not decode to JSON
    #[error("\"Message\" field is not valid JSON: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

/// A received message whose transport envelope and payload both decoded
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub message_id: Option<String>,
    pub raw_body: String,
    pub transport: Value,
    pub payload: Value,
    pub delete_handle: ReceiptHandle,
}

impl MessageEnvelope {
    /// Decode both layers of a raw message
    pub fn parse(raw: &RawMessage) -> Result<Self, MalformedMessage> {
        let body = raw
            .body
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or(MalformedMessage::Empty)?;

        let transport: Value = serde_json::from_str(body).map_err(MalformedMessage::InvalidJson)?;
        let encoded = match &transport {
            Value::Object(fields) => match fields.get(MESSAGE_FIELD) {
                Some(Value::String(encoded)) => encoded,
                Some(_) => return Err(MalformedMessage::MessageNotString),
                None => return Err(MalformedMessage::MissingMessage),
            },
            _ => return Err(MalformedMessage::NotAnObject),
        };
        let payload: Value =
            serde_json::from_str(encoded).map_err(MalformedMessage::InvalidPayload)?;

        Ok(Self {
            message_id: raw.message_id.clone(),
            raw_body: body.to_string(),
            transport,
            payload,
            delete_handle: raw.receipt_handle.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SNS_BODY: &str = r#"{"Type" : "Notification",
        "MessageId" : "5236f865-61b8-5882-ba1b-a91938a3b891",
        "TopicArn" : "arn:aws:sns:us-east-1:571726798637:test_topic",
        "Message" : "{\"id\": 11, \"created_by\": 4, \"created_at\": \"2017-04-27 20:38:51.321404+00:00\"}",
        "Timestamp" : "2017-04-27T20:38:51.525Z"}"#;

    fn raw(body: &str) -> RawMessage {
        RawMessage::new(body, ReceiptHandle::new("receipt-1"))
    }

    #[test]
    fn test_parses_notification() {
        let envelope = MessageEnvelope::parse(&raw(SNS_BODY)).unwrap();

        assert_eq!(envelope.payload["id"], 11);
        assert_eq!(envelope.payload["created_by"], 4);
        assert_eq!(envelope.transport["Type"], "Notification");
        assert_eq!(envelope.delete_handle, ReceiptHandle::new("receipt-1"));
        assert_eq!(envelope.raw_body, SNS_BODY);
    }

    #[test]
    fn test_scalar_and_array_payloads() {
        let number = json!({"Message": "42"}).to_string();
        assert_eq!(MessageEnvelope::parse(&raw(&number)).unwrap().payload, json!(42));

        let list = json!({"Message": "[1, \"two\"]"}).to_string();
        assert_eq!(
            MessageEnvelope::parse(&raw(&list)).unwrap().payload,
            json!([1, "two"])
        );
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(matches!(
            MessageEnvelope::parse(&raw("not json")),
            Err(MalformedMessage::InvalidJson(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_shapes() {
        assert!(matches!(
            MessageEnvelope::parse(&raw("[1, 2]")),
            Err(MalformedMessage::NotAnObject)
        ));
        assert!(matches!(
            MessageEnvelope::parse(&raw(r#"{"Subject": "x"}"#)),
            Err(MalformedMessage::MissingMessage)
        ));
        assert!(matches!(
            MessageEnvelope::parse(&raw(r#"{"Message": {"id": 1}}"#)),
            Err(MalformedMessage::MessageNotString)
        ));
        assert!(matches!(
            MessageEnvelope::parse(&raw(r#"{"Message": "{oops"}"#)),
            Err(MalformedMessage::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_rejects_empty_body() {
        assert!(matches!(
            MessageEnvelope::parse(&raw("   ")),
            Err(MalformedMessage::Empty)
        ));
    }
}
