//! In-process talk store. Everything is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::ids::{IdGenerator, SnowflakeIds};
use crate::models::{NewTalk, ScopeTags, TalkInfo, TalkMessage, TalkQuery, TalkStatus};
use crate::store::TalkStore;

struct TalkRecord {
    info: TalkInfo,
    messages: Vec<TalkMessage>,
}

pub struct MemoryTalkStore {
    ids: Arc<dyn IdGenerator>,
    talks: RwLock<HashMap<String, TalkRecord>>,
}

impl MemoryTalkStore {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            ids,
            talks: RwLock::new(HashMap::new()),
        }
    }

    fn scoped<'a>(
        talks: &'a mut HashMap<String, TalkRecord>,
        scope: &ScopeTags,
        talk_id: &str,
    ) -> Result<&'a mut TalkRecord> {
        match talks.get_mut(talk_id) {
            Some(record) if scope.allows(&record.info) => Ok(record),
            _ => Err(StoreError::NotFound),
        }
    }
}

impl Default for MemoryTalkStore {
    fn default() -> Self {
        Self::new(Arc::new(SnowflakeIds::default()))
    }
}

#[async_trait]
impl TalkStore for MemoryTalkStore {
    async fn create_talk(&self, talk: NewTalk) -> Result<String> {
        talk.validate()?;
        let talk_id = self.ids.next_id().to_string();
        let info = TalkInfo {
            talk_id: talk_id.clone(),
            status: TalkStatus::Opened,
            title: talk.title,
            act_id: talk.act_id,
            biz_id: talk.biz_id,
            creator_id: talk.creator_id,
            creator_name: talk.creator_name,
            servicer_id: 0,
            started_at: chrono::Utc::now().timestamp(),
            finished_at: 0,
        };
        debug!(talk_id = %talk_id, "talk created");
        self.talks.write().await.insert(
            talk_id.clone(),
            TalkRecord {
                info,
                messages: Vec::new(),
            },
        );
        Ok(talk_id)
    }

    async fn open_talk(&self, scope: &ScopeTags, talk_id: &str) -> Result<()> {
        let mut talks = self.talks.write().await;
        let record = Self::scoped(&mut talks, scope, talk_id)?;
        if record.info.status == TalkStatus::Closed {
            return Err(StoreError::TalkClosed(talk_id.to_string()));
        }
        record.info.status = TalkStatus::Opened;
        Ok(())
    }

    async fn close_talk(&self, scope: &ScopeTags, talk_id: &str) -> Result<()> {
        let mut talks = self.talks.write().await;
        let record = Self::scoped(&mut talks, scope, talk_id)?;
        if record.info.status != TalkStatus::Closed {
            record.info.status = TalkStatus::Closed;
            record.info.finished_at = chrono::Utc::now().timestamp();
        }
        Ok(())
    }

    async fn append_message(&self, talk_id: &str, message: &TalkMessage) -> Result<String> {
        let mut talks = self.talks.write().await;
        let record = talks.get_mut(talk_id).ok_or(StoreError::NotFound)?;
        if record.info.status == TalkStatus::Closed {
            return Err(StoreError::TalkClosed(talk_id.to_string()));
        }
        record.messages.push(message.clone());
        Ok(self.ids.next_id().to_string())
    }

    async fn list_messages(
        &self,
        talk_id: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<TalkMessage>> {
        let talks = self.talks.read().await;
        let record = talks.get(talk_id).ok_or(StoreError::NotFound)?;
        let rest = record.messages.iter().skip(offset);
        Ok(if count == 0 {
            rest.cloned().collect()
        } else {
            rest.take(count).cloned().collect()
        })
    }

    async fn query_talks(&self, scope: &ScopeTags, query: &TalkQuery) -> Result<Vec<TalkInfo>> {
        let talks = self.talks.read().await;
        let mut found: Vec<TalkInfo> = talks
            .values()
            .map(|r| &r.info)
            .filter(|info| scope.allows(info) && query.matches(info))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.talk_id.cmp(&b.talk_id))
        });
        Ok(found)
    }

    async fn pending_talks(&self, scope: &ScopeTags) -> Result<Vec<TalkInfo>> {
        let mut pending = self
            .query_talks(
                scope,
                &TalkQuery {
                    servicer_id: Some(0),
                    statuses: vec![TalkStatus::Opened],
                    ..Default::default()
                },
            )
            .await?;
        pending.retain(TalkInfo::is_pending);
        Ok(pending)
    }

    async fn assign_servicer(
        &self,
        scope: &ScopeTags,
        talk_id: &str,
        servicer_id: u64,
    ) -> Result<()> {
        let mut talks = self.talks.write().await;
        let record = Self::scoped(&mut talks, scope, talk_id)?;
        if record.info.status == TalkStatus::Closed {
            return Err(StoreError::TalkClosed(talk_id.to_string()));
        }
        let current = record.info.servicer_id;
        if servicer_id != 0 && current != 0 && current != servicer_id {
            return Err(StoreError::AlreadyAssigned(current));
        }
        record.info.servicer_id = servicer_id;
        Ok(())
    }
}
