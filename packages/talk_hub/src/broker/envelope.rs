//! Wire format for events exchanged through the broker.

use serde::{Deserialize, Serialize};
use talk_store::TalkMessage;

use crate::session::SessionId;

/// Role broadcast channel subscribed by every customer-facing process.
pub const CUSTOMER_CHANNEL: &str = "customerC";
/// Role broadcast channel subscribed by every servicer-facing process.
pub const SERVICER_CHANNEL: &str = "servicerC";
/// Catch-all channel subscribed by every process.
pub const CATCH_ALL_CHANNEL: &str = "C";

const EXCHANGE_PREFIX: &str = "talk:";

pub fn exchange_name(channel: &str) -> String {
    format!("{EXCHANGE_PREFIX}{channel}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub talk_id: String,
    /// Empty means the talk's own channel.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_id: String,
    pub payload: EnvelopePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopePayload {
    Message {
        sender_session_id: SessionId,
        message: TalkMessage,
    },
    TalkCreated {
        talk_id: String,
    },
    TalkClosed,
    ServicerAttached {
        servicer_id: u64,
    },
    ServicerDetached {
        servicer_id: u64,
    },
}

impl Envelope {
    pub fn new(
        talk_id: impl Into<String>,
        channel_id: impl Into<String>,
        payload: EnvelopePayload,
    ) -> Self {
        Self {
            talk_id: talk_id.into(),
            channel_id: channel_id.into(),
            payload,
        }
    }

    /// The channel this envelope is published on.
    pub fn channel(&self) -> &str {
        if self.channel_id.is_empty() {
            &self.talk_id
        } else {
            &self.channel_id
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_channel_defaults_to_talk() {
        let env = Envelope::new("42", "", EnvelopePayload::TalkClosed);
        assert_eq!(env.channel(), "42");
        assert_eq!(exchange_name(env.channel()), "talk:42");

        let shared = Envelope::new("42", CATCH_ALL_CHANNEL, EnvelopePayload::TalkClosed);
        assert_eq!(exchange_name(shared.channel()), "talk:C");
    }

    #[test]
    fn message_envelope_decodes() {
        let env = Envelope::new(
            "42",
            "",
            EnvelopePayload::Message {
                sender_session_id: 7,
                message: TalkMessage::text(1, "alice", true, "hello"),
            },
        );
        let bytes = env.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["payload"]["type"], "message");
        assert!(json.get("channel_id").is_none());
        assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn unknown_payload_is_an_error() {
        let body = br#"{"talk_id":"1","payload":{"type":"teleport"}}"#;
        assert!(Envelope::decode(body).is_err());
        assert!(Envelope::decode(b"not json").is_err());
    }
}
