//! Responses pushed into session mailboxes.
//!
//! Adapters drain these and forward them to the connected client; the enums are
//! tagged with `type` so they can go over the wire as JSON unchanged.

use serde::{Deserialize, Serialize};
use talk_store::{MessageBody, TalkInfo, TalkMessage};

/// Code carried by every forced-removal notice.
pub const KICK_OUT_CODE: i32 = -1;

/// A message rendered for one audience.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub user: String,
    pub from_customer: bool,
    pub at: i64,
    pub body: MessageBody,
}

impl MessageView {
    /// Customers see their own side as "you" and agents as "support".
    pub fn for_customer(message: &TalkMessage) -> Self {
        let user = if message.from_customer { "you" } else { "support" };
        Self {
            user: user.to_string(),
            from_customer: message.from_customer,
            at: message.at,
            body: message.body.clone(),
        }
    }

    pub fn for_servicer(message: &TalkMessage) -> Self {
        Self {
            user: format!("{}[{}]", message.sender_name, message.sender_id),
            from_customer: message.from_customer,
            at: message.at,
            body: message.body.clone(),
        }
    }
}

/// A talk and its full history, as sent on install and reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalkSnapshot {
    pub info: TalkInfo,
    pub messages: Vec<MessageView>,
}

impl TalkSnapshot {
    pub fn for_servicer(info: TalkInfo, messages: &[TalkMessage]) -> Self {
        Self {
            info,
            messages: messages.iter().map(MessageView::for_servicer).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CustomerResponse {
    KickOut { code: i32, message: String },
    Messages { talk_id: String, messages: Vec<MessageView> },
    Message { talk_id: String, message: MessageView },
    MessageConfirmed { seq_id: u64, at: i64 },
    Close { talk_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServicerResponse {
    KickOut { code: i32, message: String },
    Notify { message: String },
    AttachedTalks { talks: Vec<TalkSnapshot> },
    PendingTalks { talks: Vec<TalkInfo> },
    Reload { talk: TalkSnapshot },
    Message { talk_id: String, message: MessageView },
    MessageConfirmed { seq_id: u64, at: i64 },
    Attach { talk: TalkInfo, servicer_id: u64 },
    Detach { talk: TalkInfo, servicer_id: u64 },
    Created { talk: TalkInfo },
    Close { talk_id: String },
}

/// Builds the kick-out notice for a session's response type.
pub trait KickOut {
    fn kick_out(message: String) -> Self;
}

impl KickOut for CustomerResponse {
    fn kick_out(message: String) -> Self {
        Self::KickOut {
            code: KICK_OUT_CODE,
            message,
        }
    }
}

impl KickOut for ServicerResponse {
    fn kick_out(message: String) -> Self {
        Self::KickOut {
            code: KICK_OUT_CODE,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_label_sender_per_audience() {
        let from_agent = TalkMessage::text(9, "dana", false, "how can I help?");
        assert_eq!(MessageView::for_customer(&from_agent).user, "support");
        assert_eq!(MessageView::for_servicer(&from_agent).user, "dana[9]");

        let from_customer = TalkMessage::text(4, "eve", true, "hi");
        assert_eq!(MessageView::for_customer(&from_customer).user, "you");
    }

    #[test]
    fn responses_are_type_tagged() {
        let confirmed = CustomerResponse::MessageConfirmed { seq_id: 3, at: 10 };
        let json = serde_json::to_value(confirmed).unwrap();
        assert_eq!(json["type"], "message_confirmed");
        assert_eq!(json["seq_id"], 3);

        let kick = serde_json::to_value(ServicerResponse::kick_out("bye".to_string())).unwrap();
        assert_eq!(kick["type"], "kick_out");
        assert_eq!(kick["code"], KICK_OUT_CODE);
    }
}
