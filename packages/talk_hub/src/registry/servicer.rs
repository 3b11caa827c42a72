use std::collections::HashMap;
use std::sync::Arc;

use talk_store::{ScopeTags, StoreError, TalkInfo, TalkMessage, TalkStatus, TalkStore};
use tracing::{debug, warn};

use super::{EarlyUninstalls, REASON_SEND_FAILED, SessionTable};
use crate::controller::{Poster, log_outcome};
use crate::distribution::{ServicerDistribution, ServicerObserver};
use crate::error::{HubError, Result};
use crate::protocol::{MessageView, ServicerResponse, TalkSnapshot};
use crate::session::{ServicerSession, SessionId};

const NOTICE_ALREADY_ATTACHED: &str = "talk already attached";
const NOTICE_NOT_ATTACHED: &str = "talk not attached";
const NOTICE_NOT_FOUND: &str = "talk not found";
const NOTICE_CLOSED: &str = "talk closed";
const NOTICE_NOT_STORED: &str = "message not stored";

/// Servicer sessions grouped by servicer user id.
///
/// A talk is tracked exactly while a locally connected servicer holds it;
/// `held` maps each such talk to its servicer.
pub struct ServicerMd {
    distribution: Arc<dyn ServicerDistribution>,
    store: Arc<dyn TalkStore>,
    servicers: SessionTable<u64, ServicerSession>,
    held: HashMap<String, u64>,
    early_uninstalls: EarlyUninstalls<ServicerSession>,
}

impl ServicerMd {
    pub fn new(distribution: Arc<dyn ServicerDistribution>) -> Self {
        let store = distribution.store();
        Self {
            distribution,
            store,
            servicers: SessionTable::new(),
            held: HashMap::new(),
            early_uninstalls: EarlyUninstalls::new(),
        }
    }

    pub(crate) fn setup(&mut self, poster: Poster<Self>) {
        self.distribution
            .set_servicer_observer(Arc::new(ServicerEvents { poster }));
    }

    pub fn session_count(&self, servicer_id: u64) -> usize {
        self.servicers.len(&servicer_id)
    }

    pub fn servicer_count(&self) -> usize {
        self.servicers.key_count()
    }

    /// Talks held by local servicers, sorted.
    pub fn tracked_talks(&self) -> Vec<String> {
        let mut talks: Vec<String> = self.held.keys().cloned().collect();
        talks.sort();
        talks
    }

    async fn snapshot(&self, info: TalkInfo) -> Result<TalkSnapshot> {
        let messages = self.store.list_messages(&info.talk_id, 0, 0).await?;
        Ok(TalkSnapshot::for_servicer(info, &messages))
    }

    async fn attached_snapshots(&self, session: &ServicerSession) -> Result<Vec<TalkSnapshot>> {
        let talks = self
            .store
            .servicer_talks(&session.scope, session.user_id)
            .await?;
        let mut snapshots = Vec::with_capacity(talks.len());
        for info in talks {
            snapshots.push(self.snapshot(info).await?);
        }
        Ok(snapshots)
    }

    /// Reply to one session; a session that cannot take it is dropped.
    fn reply(&mut self, session: &ServicerSession, response: ServicerResponse) -> Result<()> {
        if let Err(e) = session.send(response) {
            session.kick(REASON_SEND_FAILED);
            self.drop_session(session.user_id, session.unique_id);
            return Err(e);
        }
        Ok(())
    }

    fn reject(&mut self, session: &ServicerSession, notice: &str, error: HubError) -> Result<()> {
        self.reply(session, notify(notice))?;
        Err(error)
    }

    fn hold(&mut self, talk_id: &str, servicer_id: u64) {
        if self.held.contains_key(talk_id) {
            self.held.insert(talk_id.to_string(), servicer_id);
            return;
        }
        match self.distribution.add_tracked_talk(talk_id) {
            Ok(()) => {
                self.held.insert(talk_id.to_string(), servicer_id);
            }
            Err(e) => warn!(talk_id = %talk_id, error = %e, "failed to track talk"),
        }
    }

    fn release(&mut self, talk_id: &str) {
        if self.held.remove(talk_id).is_some() {
            self.distribution.remove_tracked_talk(talk_id);
        }
    }

    /// The servicer has no local sessions left.
    fn servicer_gone(&mut self, servicer_id: u64) {
        let talks: Vec<String> = self
            .held
            .iter()
            .filter(|(_, holder)| **holder == servicer_id)
            .map(|(talk_id, _)| talk_id.clone())
            .collect();
        for talk_id in talks {
            self.release(&talk_id);
        }
        debug!(servicer = servicer_id, "servicer offline");
    }

    fn drop_session(&mut self, servicer_id: u64, session_id: SessionId) {
        if self.servicers.remove(&servicer_id, session_id) {
            self.servicer_gone(servicer_id);
        }
    }

    fn fan_out(&mut self, info: &TalkInfo, response: ServicerResponse) {
        let emptied = self
            .servicers
            .broadcast_where(|session| session.scope.allows(info), &response);
        for servicer_id in emptied {
            self.servicer_gone(servicer_id);
        }
    }

    pub(crate) async fn install(&mut self, session: Arc<ServicerSession>) -> Result<()> {
        if self.early_uninstalls.take(session.unique_id) {
            debug!(session = session.unique_id, "install dropped, session already uninstalled");
            return Ok(());
        }
        if session.is_closed() {
            return Err(HubError::Aborted);
        }
        let attached = self.attached_snapshots(&session).await?;
        let pending = self.store.pending_talks(&session.scope).await?;
        let talk_ids: Vec<String> = attached.iter().map(|s| s.info.talk_id.clone()).collect();

        for response in [
            ServicerResponse::AttachedTalks { talks: attached },
            ServicerResponse::PendingTalks { talks: pending },
        ] {
            if let Err(e) = session.send(response) {
                session.kick(REASON_SEND_FAILED);
                return Err(e);
            }
        }

        for talk_id in &talk_ids {
            self.hold(talk_id, session.user_id);
        }
        self.servicers.insert(session.user_id, session.clone());
        debug!(
            servicer = session.user_id,
            session = session.unique_id,
            talks = talk_ids.len(),
            "servicer session installed"
        );
        Ok(())
    }

    pub(crate) fn uninstall(&mut self, session: &Arc<ServicerSession>) -> Result<()> {
        if !self.servicers.contains(&session.user_id, session.unique_id) {
            self.early_uninstalls.record(session.unique_id, session);
            return Err(HubError::NotFound);
        }
        self.drop_session(session.user_id, session.unique_id);
        debug!(
            servicer = session.user_id,
            session = session.unique_id,
            "servicer session uninstalled"
        );
        Ok(())
    }

    /// Current assignee of `talk_id` as visible to `session`, notifying the
    /// session when the talk is out of reach.
    async fn assignee(&mut self, session: &ServicerSession, talk_id: &str) -> Result<TalkInfo> {
        match self.store.talk_info(&session.scope, talk_id).await {
            Ok(info) => Ok(info),
            Err(StoreError::NotFound) => {
                self.reply(session, notify(NOTICE_NOT_FOUND))?;
                Err(HubError::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rejects work on a talk that has been closed.
    fn ensure_open(&mut self, session: &ServicerSession, info: &TalkInfo) -> Result<()> {
        if info.status == TalkStatus::Opened {
            return Ok(());
        }
        let closed = StoreError::TalkClosed(info.talk_id.clone());
        self.reject(session, NOTICE_CLOSED, closed.into())
    }

    pub(crate) async fn attach_talk(
        &mut self,
        talk_id: &str,
        session: &ServicerSession,
    ) -> Result<()> {
        let info = self.assignee(session, talk_id).await?;
        self.ensure_open(session, &info)?;
        if info.servicer_id == session.user_id {
            warn!(
                talk_id = %talk_id,
                servicer = session.user_id,
                "talk already attached to this servicer"
            );
            return Ok(());
        }
        if info.servicer_id != 0 {
            return self.reject(session, NOTICE_ALREADY_ATTACHED, HubError::Unauthorized);
        }

        match self
            .store
            .assign_servicer(&session.scope, talk_id, session.user_id)
            .await
        {
            Ok(()) => {}
            Err(StoreError::AlreadyAssigned(holder)) => {
                debug!(talk_id = %talk_id, holder = holder, "lost attach race");
                return self.reject(session, NOTICE_ALREADY_ATTACHED, HubError::Unauthorized);
            }
            Err(e) => return Err(e.into()),
        }
        self.distribution
            .send_servicer_attached(talk_id, session.user_id);
        Ok(())
    }

    pub(crate) async fn detach_talk(
        &mut self,
        talk_id: &str,
        session: &ServicerSession,
    ) -> Result<()> {
        let info = self.assignee(session, talk_id).await?;
        if info.servicer_id != session.user_id {
            return self.reject(session, NOTICE_NOT_ATTACHED, HubError::Unauthorized);
        }
        self.store.assign_servicer(&session.scope, talk_id, 0).await?;
        self.distribution
            .send_servicer_detached(talk_id, session.user_id);
        Ok(())
    }

    pub(crate) async fn query_attached_talks(&mut self, session: &ServicerSession) -> Result<()> {
        let talks = self.attached_snapshots(session).await?;
        self.reply(session, ServicerResponse::AttachedTalks { talks })
    }

    pub(crate) async fn query_pending_talks(&mut self, session: &ServicerSession) -> Result<()> {
        let talks = self.store.pending_talks(&session.scope).await?;
        self.reply(session, ServicerResponse::PendingTalks { talks })
    }

    /// Full snapshot of one talk for the requester, whatever it missed.
    pub(crate) async fn reload_talk(
        &mut self,
        session: &ServicerSession,
        talk_id: &str,
    ) -> Result<()> {
        let info = self.assignee(session, talk_id).await?;
        let talk = self.snapshot(info).await?;
        self.reply(session, ServicerResponse::Reload { talk })
    }

    pub(crate) async fn incoming_message(
        &mut self,
        talk_id: &str,
        session: &ServicerSession,
        seq_id: u64,
        mut message: TalkMessage,
    ) -> Result<()> {
        let info = self.assignee(session, talk_id).await?;
        self.ensure_open(session, &info)?;
        if info.servicer_id != session.user_id {
            return self.reject(session, NOTICE_NOT_ATTACHED, HubError::Unauthorized);
        }
        message.sender_id = session.user_id;
        message.from_customer = false;

        // The confirmation slot is taken before anything is stored.
        let permit = match session.reserve() {
            Ok(permit) => permit,
            Err(e) => {
                session.kick(REASON_SEND_FAILED);
                self.drop_session(session.user_id, session.unique_id);
                return Err(e);
            }
        };
        if let Err(e) = self.store.append_message(talk_id, &message).await {
            permit.send(notify(NOTICE_NOT_STORED));
            return Err(e.into());
        }
        permit.send(ServicerResponse::MessageConfirmed {
            seq_id,
            at: message.at,
        });
        self.distribution
            .send_message(session.unique_id, talk_id, &message);
        Ok(())
    }

    fn on_message(&mut self, sender: SessionId, talk_id: &str, message: &TalkMessage) {
        let Some(&servicer_id) = self.held.get(talk_id) else {
            return;
        };
        let response = ServicerResponse::Message {
            talk_id: talk_id.to_string(),
            message: MessageView::for_servicer(message),
        };
        if self.servicers.broadcast(&servicer_id, Some(sender), &response) {
            self.servicer_gone(servicer_id);
        }
    }

    async fn talk_for_event(&self, talk_id: &str) -> Result<TalkInfo> {
        Ok(self
            .store
            .talk_info(&ScopeTags::unrestricted(), talk_id)
            .await?)
    }

    async fn on_created(&mut self, talk_id: &str) -> Result<()> {
        let info = self.talk_for_event(talk_id).await?;
        self.fan_out(&info, ServicerResponse::Created { talk: info.clone() });
        Ok(())
    }

    async fn on_closed(&mut self, talk_id: &str) -> Result<()> {
        self.release(talk_id);
        let info = self.talk_for_event(talk_id).await?;
        self.fan_out(
            &info,
            ServicerResponse::Close {
                talk_id: talk_id.to_string(),
            },
        );
        Ok(())
    }

    async fn on_attached(&mut self, talk_id: &str, servicer_id: u64) -> Result<()> {
        let info = self.talk_for_event(talk_id).await?;
        if self.servicers.contains_key(&servicer_id) {
            self.hold(talk_id, servicer_id);
            let reload = ServicerResponse::Reload {
                talk: self.snapshot(info.clone()).await?,
            };
            if self.servicers.broadcast(&servicer_id, None, &reload) {
                self.servicer_gone(servicer_id);
            }
        }
        self.fan_out(
            &info,
            ServicerResponse::Attach {
                talk: info.clone(),
                servicer_id,
            },
        );
        Ok(())
    }

    async fn on_detached(&mut self, talk_id: &str, servicer_id: u64) -> Result<()> {
        if self.held.get(talk_id) == Some(&servicer_id) {
            self.release(talk_id);
        }
        let info = self.talk_for_event(talk_id).await?;
        self.fan_out(
            &info,
            ServicerResponse::Detach {
                talk: info.clone(),
                servicer_id,
            },
        );
        Ok(())
    }
}

fn notify(message: &str) -> ServicerResponse {
    ServicerResponse::Notify {
        message: message.to_string(),
    }
}

/// Funnels distribution callbacks back onto the controller task.
struct ServicerEvents {
    poster: Poster<ServicerMd>,
}

impl ServicerObserver for ServicerEvents {
    fn on_message_incoming(&self, sender: SessionId, talk_id: &str, message: &TalkMessage) {
        let talk_id = talk_id.to_string();
        let message = message.clone();
        self.poster.post(move |md: &mut ServicerMd| {
            Box::pin(async move { md.on_message(sender, &talk_id, &message) })
        });
    }

    fn on_talk_created(&self, talk_id: &str) {
        let talk_id = talk_id.to_string();
        self.poster.post(move |md: &mut ServicerMd| {
            Box::pin(async move { log_outcome("talk_created", md.on_created(&talk_id).await) })
        });
    }

    fn on_talk_closed(&self, talk_id: &str) {
        let talk_id = talk_id.to_string();
        self.poster.post(move |md: &mut ServicerMd| {
            Box::pin(async move { log_outcome("talk_closed", md.on_closed(&talk_id).await) })
        });
    }

    fn on_servicer_attached(&self, talk_id: &str, servicer_id: u64) {
        let talk_id = talk_id.to_string();
        self.poster.post(move |md: &mut ServicerMd| {
            Box::pin(async move {
                log_outcome("servicer_attached", md.on_attached(&talk_id, servicer_id).await)
            })
        });
    }

    fn on_servicer_detached(&self, talk_id: &str, servicer_id: u64) {
        let talk_id = talk_id.to_string();
        self.poster.post(move |md: &mut ServicerMd| {
            Box::pin(async move {
                log_outcome("servicer_detached", md.on_detached(&talk_id, servicer_id).await)
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::LocalDistribution;
    use talk_store::{MemoryTalkStore, NewTalk, SequentialIds};
    use tokio::sync::mpsc;

    struct Fixture {
        md: ServicerMd,
        store: Arc<dyn TalkStore>,
        ids: SequentialIds,
        talk_id: String,
    }

    async fn fixture() -> Fixture {
        let ids = Arc::new(SequentialIds::default());
        let store: Arc<dyn TalkStore> = Arc::new(MemoryTalkStore::new(ids));
        let talk_id = store
            .create_talk(NewTalk {
                act_id: "a".into(),
                biz_id: "b".into(),
                title: "late parcel".into(),
                creator_id: 7,
                creator_name: "eve".into(),
            })
            .await
            .unwrap();
        Fixture {
            md: ServicerMd::new(Arc::new(LocalDistribution::new(store.clone()))),
            store,
            ids: SequentialIds::default(),
            talk_id,
        }
    }

    fn servicer(
        f: &Fixture,
        user_id: u64,
    ) -> (Arc<ServicerSession>, mpsc::Receiver<ServicerResponse>) {
        ServicerSession::new(&f.ids, user_id, ScopeTags::unrestricted(), 16)
    }

    fn drain(rx: &mut mpsc::Receiver<ServicerResponse>) -> Vec<ServicerResponse> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn install_sends_attached_then_pending() {
        let mut f = fixture().await;
        f.store.assign_servicer(&ScopeTags::unrestricted(), &f.talk_id, 5).await.unwrap();
        let (session, mut rx) = servicer(&f, 5);

        f.md.install(session).await.unwrap();
        let responses = drain(&mut rx);
        assert!(matches!(
            &responses[0],
            ServicerResponse::AttachedTalks { talks } if talks.len() == 1
        ));
        assert!(matches!(
            &responses[1],
            ServicerResponse::PendingTalks { talks } if talks.is_empty()
        ));
        assert_eq!(f.md.tracked_talks(), vec![f.talk_id.clone()]);
    }

    #[tokio::test]
    async fn attach_by_other_servicer_is_rejected() {
        let mut f = fixture().await;
        let (a, _rx_a) = servicer(&f, 1);
        let (b, mut rx_b) = servicer(&f, 2);

        f.md.attach_talk(&f.talk_id.clone(), &a).await.unwrap();
        // same servicer again is a no-op
        f.md.attach_talk(&f.talk_id.clone(), &a).await.unwrap();

        assert!(matches!(
            f.md.attach_talk(&f.talk_id.clone(), &b).await,
            Err(HubError::Unauthorized)
        ));
        assert_eq!(
            drain(&mut rx_b),
            vec![ServicerResponse::Notify { message: "talk already attached".into() }]
        );
        let holder = f
            .store
            .talk_servicer_id(&ScopeTags::unrestricted(), &f.talk_id)
            .await
            .unwrap();
        assert_eq!(holder, 1);
    }

    #[tokio::test]
    async fn only_assignee_may_detach_or_send() {
        let mut f = fixture().await;
        let talk_id = f.talk_id.clone();
        let (a, mut rx_a) = servicer(&f, 1);
        let (b, mut rx_b) = servicer(&f, 2);
        f.md.attach_talk(&talk_id, &a).await.unwrap();

        assert!(f.md.detach_talk(&talk_id, &b).await.is_err());
        assert!(
            f.md.incoming_message(&talk_id, &b, 1, TalkMessage::text(2, "bo", false, "hi"))
                .await
                .is_err()
        );
        assert_eq!(drain(&mut rx_b).len(), 2);

        f.md.incoming_message(&talk_id, &a, 9, TalkMessage::text(1, "al", false, "hello"))
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServicerResponse::MessageConfirmed { seq_id: 9, .. }]
        ));
        f.md.detach_talk(&talk_id, &a).await.unwrap();
        let holder = f.store.talk_servicer_id(&ScopeTags::unrestricted(), &talk_id).await.unwrap();
        assert_eq!(holder, 0);
    }

    #[tokio::test]
    async fn closed_talk_refuses_messages_and_attaches() {
        let mut f = fixture().await;
        let talk_id = f.talk_id.clone();
        let scope = ScopeTags::unrestricted();
        f.store.assign_servicer(&scope, &talk_id, 5).await.unwrap();
        f.store.close_talk(&scope, &talk_id).await.unwrap();
        let (assignee, mut rx) = servicer(&f, 5);
        let (other, mut rx_other) = servicer(&f, 6);

        let late = TalkMessage::text(5, "al", false, "still there?");
        let outcome = f.md.incoming_message(&talk_id, &assignee, 3, late).await;
        assert!(matches!(outcome, Err(HubError::Store(StoreError::TalkClosed(_)))));
        assert_eq!(drain(&mut rx), vec![notify("talk closed")]);
        assert!(f.store.list_messages(&talk_id, 0, 0).await.unwrap().is_empty());

        assert!(f.md.attach_talk(&talk_id, &other).await.is_err());
        assert_eq!(drain(&mut rx_other), vec![notify("talk closed")]);
    }

    #[tokio::test]
    async fn unconfirmable_servicer_is_dropped_before_storing() {
        let mut f = fixture().await;
        let talk_id = f.talk_id.clone();
        let (poster, mut jobs) = Poster::channel(8);
        f.md.setup(poster);
        f.store.assign_servicer(&ScopeTags::unrestricted(), &talk_id, 1).await.unwrap();
        let (a, mut rx) = ServicerSession::new(&f.ids, 1, ScopeTags::unrestricted(), 2);
        f.md.install(a.clone()).await.unwrap();
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(f.md.tracked_talks(), vec![talk_id.clone()]);
        a.notify("one").unwrap();
        a.notify("two").unwrap();

        let outcome = f
            .md
            .incoming_message(&talk_id, &a, 4, TalkMessage::text(1, "al", false, "lost"))
            .await;
        assert!(matches!(outcome, Err(HubError::Aborted)));
        assert_eq!(f.md.session_count(1), 0);
        assert!(f.md.tracked_talks().is_empty());
        assert!(f.store.list_messages(&talk_id, 0, 0).await.unwrap().is_empty());
        assert!(jobs.try_recv().is_err());
        // only the pre-filled notices; the kick-out did not fit
        assert_eq!(drain(&mut rx), vec![notify("one"), notify("two")]);
    }

    #[tokio::test]
    async fn uninstall_ahead_of_install_wins() {
        let mut f = fixture().await;
        f.store.assign_servicer(&ScopeTags::unrestricted(), &f.talk_id, 1).await.unwrap();
        let (a, mut rx) = servicer(&f, 1);

        assert!(matches!(f.md.uninstall(&a), Err(HubError::NotFound)));
        f.md.install(a).await.unwrap();
        assert_eq!(f.md.servicer_count(), 0);
        assert!(f.md.tracked_talks().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn install_of_hung_up_session_is_refused() {
        let mut f = fixture().await;
        let (a, rx) = servicer(&f, 1);
        drop(rx);

        assert!(matches!(f.md.install(a).await, Err(HubError::Aborted)));
        assert_eq!(f.md.servicer_count(), 0);
    }

    #[tokio::test]
    async fn reload_returns_full_history() {
        let mut f = fixture().await;
        let talk_id = f.talk_id.clone();
        for text in ["one", "two", "three"] {
            f.store
                .append_message(&talk_id, &TalkMessage::text(7, "eve", true, text))
                .await
                .unwrap();
        }
        let (a, mut rx) = servicer(&f, 1);

        f.md.reload_talk(&a, &talk_id).await.unwrap();
        f.md.reload_talk(&a, &talk_id).await.unwrap();
        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0], responses[1]);
        match &responses[0] {
            ServicerResponse::Reload { talk } => {
                assert_eq!(talk.messages.len(), 3);
                assert_eq!(talk.messages[0].user, "eve[7]");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn lifecycle_fan_out_respects_scope() {
        let mut f = fixture().await;
        let (inside, mut rx_in) = ServicerSession::new(&f.ids, 1, ScopeTags::single("a", "b"), 8);
        let (outside, mut rx_out) = ServicerSession::new(&f.ids, 2, ScopeTags::single("z", "b"), 8);
        f.md.install(inside).await.unwrap();
        f.md.install(outside).await.unwrap();
        drain(&mut rx_in);
        drain(&mut rx_out);

        f.md.on_created(&f.talk_id.clone()).await.unwrap();
        assert!(matches!(drain(&mut rx_in).as_slice(), [ServicerResponse::Created { .. }]));
        assert!(drain(&mut rx_out).is_empty());
    }

    #[tokio::test]
    async fn last_session_leaving_releases_talks() {
        let mut f = fixture().await;
        let talk_id = f.talk_id.clone();
        let (a1, _rx1) = servicer(&f, 1);
        let (a2, _rx2) = servicer(&f, 1);
        f.md.install(a1.clone()).await.unwrap();
        f.md.install(a2.clone()).await.unwrap();
        f.md.on_attached(&talk_id, 1).await.unwrap();
        assert_eq!(f.md.tracked_talks(), vec![talk_id.clone()]);

        f.md.uninstall(&a1).unwrap();
        assert_eq!(f.md.tracked_talks(), vec![talk_id.clone()]);
        f.md.uninstall(&a2).unwrap();
        assert!(f.md.tracked_talks().is_empty());
        assert_eq!(f.md.servicer_count(), 0);
    }
}
