use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::models::{NewTalk, ScopeTags, TalkInfo, TalkMessage, TalkQuery, TalkStatus};

/// Persistence capability for talks and their messages.
///
/// Scope-aware operations treat a talk outside `scope` as missing and return
/// [`StoreError::NotFound`], so callers cannot probe for foreign talks.
#[async_trait]
pub trait TalkStore: Send + Sync {
    /// Create a talk in `Opened` state and return its id.
    async fn create_talk(&self, talk: NewTalk) -> Result<String>;

    async fn open_talk(&self, scope: &ScopeTags, talk_id: &str) -> Result<()>;

    async fn close_talk(&self, scope: &ScopeTags, talk_id: &str) -> Result<()>;

    /// Append to the talk's log and return the message id.
    async fn append_message(&self, talk_id: &str, message: &TalkMessage) -> Result<String>;

    /// Messages in append order. `count == 0` returns everything after `offset`.
    async fn list_messages(
        &self,
        talk_id: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<TalkMessage>>;

    async fn query_talks(&self, scope: &ScopeTags, query: &TalkQuery) -> Result<Vec<TalkInfo>>;

    /// Opened talks without an attached servicer.
    async fn pending_talks(&self, scope: &ScopeTags) -> Result<Vec<TalkInfo>>;

    /// Attach `servicer_id`, or detach with 0.
    ///
    /// Attaching fails with [`StoreError::AlreadyAssigned`] when a different
    /// servicer already holds the talk, so concurrent attaches resolve to exactly
    /// one winner even across processes.
    async fn assign_servicer(
        &self,
        scope: &ScopeTags,
        talk_id: &str,
        servicer_id: u64,
    ) -> Result<()>;

    async fn talk_exists(&self, scope: &ScopeTags, talk_id: &str) -> Result<bool> {
        let found = self
            .query_talks(
                scope,
                &TalkQuery {
                    talk_id: Some(talk_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(!found.is_empty())
    }

    async fn talk_info(&self, scope: &ScopeTags, talk_id: &str) -> Result<TalkInfo> {
        let found = self
            .query_talks(
                scope,
                &TalkQuery {
                    talk_id: Some(talk_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        found.into_iter().next().ok_or(StoreError::NotFound)
    }

    /// Opened talks currently attached to `servicer_id`.
    async fn servicer_talks(&self, scope: &ScopeTags, servicer_id: u64) -> Result<Vec<TalkInfo>> {
        self.query_talks(
            scope,
            &TalkQuery {
                servicer_id: Some(servicer_id),
                statuses: vec![TalkStatus::Opened],
                ..Default::default()
            },
        )
        .await
    }

    async fn talk_servicer_id(&self, scope: &ScopeTags, talk_id: &str) -> Result<u64> {
        Ok(self.talk_info(scope, talk_id).await?.servicer_id)
    }
}
