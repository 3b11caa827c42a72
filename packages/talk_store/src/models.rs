use serde::{Deserialize, Serialize};

/// Lifecycle of a talk. `Closed` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TalkStatus {
    #[default]
    None,
    Opened,
    Closed,
}

impl TalkStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Opened => 1,
            Self::Closed => 2,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Opened,
            2 => Self::Closed,
            _ => Self::None,
        }
    }
}

/// Activity/business partitioning. Each non-empty list restricts visibility
/// to talks whose tag is in the list; an empty list is unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeTags {
    #[serde(default)]
    pub act_ids: Vec<String>,
    #[serde(default)]
    pub biz_ids: Vec<String>,
}

impl ScopeTags {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Scope of a customer session, pinned to exactly one activity and business.
    pub fn single(act_id: impl Into<String>, biz_id: impl Into<String>) -> Self {
        Self {
            act_ids: vec![act_id.into()],
            biz_ids: vec![biz_id.into()],
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.act_ids.is_empty() && self.biz_ids.is_empty()
    }

    pub fn matches(&self, act_id: &str, biz_id: &str) -> bool {
        (self.act_ids.is_empty() || self.act_ids.iter().any(|a| a == act_id))
            && (self.biz_ids.is_empty() || self.biz_ids.iter().any(|b| b == biz_id))
    }

    pub fn allows(&self, talk: &TalkInfo) -> bool {
        self.matches(&talk.act_id, &talk.biz_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalkInfo {
    pub talk_id: String,
    pub status: TalkStatus,
    pub title: String,
    pub act_id: String,
    pub biz_id: String,
    pub creator_id: u64,
    pub creator_name: String,
    /// 0 while no servicer is attached.
    pub servicer_id: u64,
    pub started_at: i64,
    pub finished_at: i64,
}

impl TalkInfo {
    pub fn is_pending(&self) -> bool {
        self.status == TalkStatus::Opened && self.servicer_id == 0
    }
}

/// Input for [`crate::TalkStore::create_talk`].
#[derive(Debug, Clone, Default)]
pub struct NewTalk {
    pub act_id: String,
    pub biz_id: String,
    pub title: String,
    pub creator_id: u64,
    pub creator_name: String,
}

impl NewTalk {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.title.trim().is_empty() {
            return Err(crate::StoreError::InvalidArgument("title"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum MessageBody {
    Text(String),
    Image(Vec<u8>),
    Unknown,
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalkMessage {
    pub sender_id: u64,
    pub sender_name: String,
    pub from_customer: bool,
    pub body: MessageBody,
    /// Unix seconds.
    pub at: i64,
}

impl TalkMessage {
    pub fn new(
        sender_id: u64,
        sender_name: impl Into<String>,
        from_customer: bool,
        body: MessageBody,
    ) -> Self {
        Self {
            sender_id,
            sender_name: sender_name.into(),
            from_customer,
            body,
            at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn text(
        sender_id: u64,
        sender_name: impl Into<String>,
        from_customer: bool,
        text: impl Into<String>,
    ) -> Self {
        Self::new(sender_id, sender_name, from_customer, MessageBody::Text(text.into()))
    }
}

/// Filters for [`crate::TalkStore::query_talks`]. Unset fields match everything;
/// an empty status list matches every status.
#[derive(Debug, Clone, Default)]
pub struct TalkQuery {
    pub creator_id: Option<u64>,
    pub servicer_id: Option<u64>,
    pub talk_id: Option<String>,
    pub statuses: Vec<TalkStatus>,
}

impl TalkQuery {
    pub fn matches(&self, talk: &TalkInfo) -> bool {
        self.creator_id.is_none_or(|id| talk.creator_id == id)
            && self.servicer_id.is_none_or(|id| talk.servicer_id == id)
            && self.talk_id.as_deref().is_none_or(|id| talk.talk_id == id)
            && (self.statuses.is_empty() || self.statuses.contains(&talk.status))
    }
}
