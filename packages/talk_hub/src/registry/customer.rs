use std::sync::Arc;

use talk_store::{TalkMessage, TalkStore};
use tracing::{debug, warn};

use super::{EarlyUninstalls, SessionTable};
use crate::controller::Poster;
use crate::distribution::{CustomerDistribution, CustomerObserver};
use crate::error::{HubError, Result};
use crate::protocol::{CustomerResponse, MessageView};
use crate::session::{CustomerSession, SessionId};

const REASON_NOT_FOUND: &str = "talk not found";
const REASON_UNAVAILABLE: &str = "service unavailable";

/// Customer sessions grouped by talk.
///
/// A talk is tracked on the distribution while at least one local session
/// watches it.
pub struct CustomerMd {
    distribution: Arc<dyn CustomerDistribution>,
    store: Arc<dyn TalkStore>,
    talks: SessionTable<String, CustomerSession>,
    early_uninstalls: EarlyUninstalls<CustomerSession>,
}

impl CustomerMd {
    pub fn new(distribution: Arc<dyn CustomerDistribution>) -> Self {
        let store = distribution.store();
        Self {
            distribution,
            store,
            talks: SessionTable::new(),
            early_uninstalls: EarlyUninstalls::new(),
        }
    }

    pub(crate) fn setup(&mut self, poster: Poster<Self>) {
        self.distribution
            .set_customer_observer(Arc::new(CustomerEvents { poster }));
    }

    /// Number of local sessions watching `talk_id`.
    pub fn session_count(&self, talk_id: &str) -> usize {
        self.talks.len(&talk_id.to_string())
    }

    pub fn talk_count(&self) -> usize {
        self.talks.key_count()
    }

    pub fn has_session(&self, talk_id: &str, session_id: SessionId) -> bool {
        self.talks.contains(&talk_id.to_string(), session_id)
    }

    pub(crate) async fn install(&mut self, session: Arc<CustomerSession>) -> Result<()> {
        if self.early_uninstalls.take(session.unique_id) {
            debug!(session = session.unique_id, "install dropped, session already uninstalled");
            return Ok(());
        }
        // The adapter hung up before the install was handled.
        if session.is_closed() {
            return Err(HubError::Aborted);
        }
        let talk_id = session.talk_id.clone();
        if !self.store.talk_exists(&session.scope, &talk_id).await? {
            session.kick(REASON_NOT_FOUND);
            return Err(HubError::NotFound);
        }

        if !self.talks.contains_key(&talk_id) {
            if let Err(e) = self.distribution.add_tracked_talk(&talk_id) {
                session.kick(REASON_UNAVAILABLE);
                return Err(e);
            }
        }
        self.talks.insert(talk_id.clone(), session.clone());
        debug!(talk_id = %talk_id, session = session.unique_id, "customer session installed");

        if session.created_talk {
            self.distribution.send_talk_created(&talk_id);
        }

        // History goes straight into this session's mailbox.
        let store = self.store.clone();
        tokio::spawn(async move {
            match store.list_messages(&talk_id, 0, 0).await {
                Ok(messages) => {
                    let response = CustomerResponse::Messages {
                        talk_id: talk_id.clone(),
                        messages: messages.iter().map(MessageView::for_customer).collect(),
                    };
                    if let Err(e) = session.send(response) {
                        debug!(
                            talk_id = %talk_id,
                            session = session.unique_id,
                            error = %e,
                            "history not delivered"
                        );
                    }
                }
                Err(e) => warn!(talk_id = %talk_id, error = %e, "failed to load history"),
            }
        });
        Ok(())
    }

    pub(crate) fn uninstall(&mut self, session: &Arc<CustomerSession>) -> Result<()> {
        if !self.talks.contains(&session.talk_id, session.unique_id) {
            self.early_uninstalls.record(session.unique_id, session);
            return Err(HubError::NotFound);
        }
        self.drop_session(&session.talk_id, session.unique_id);
        debug!(
            talk_id = %session.talk_id,
            session = session.unique_id,
            "customer session uninstalled"
        );
        Ok(())
    }

    pub(crate) async fn incoming_message(
        &mut self,
        session: &CustomerSession,
        seq_id: u64,
        mut message: TalkMessage,
    ) -> Result<()> {
        let talk_id = &session.talk_id;
        if !self.talks.contains(talk_id, session.unique_id) {
            return Err(HubError::NotFound);
        }
        message.sender_id = session.user_id;
        message.from_customer = true;

        // The confirmation slot is taken before anything is stored.
        let permit = match session.reserve() {
            Ok(permit) => permit,
            Err(e) => {
                session.kick(super::REASON_SEND_FAILED);
                self.drop_session(talk_id, session.unique_id);
                return Err(e);
            }
        };
        self.store.append_message(talk_id, &message).await?;
        permit.send(CustomerResponse::MessageConfirmed {
            seq_id,
            at: message.at,
        });
        self.distribution
            .send_message(session.unique_id, talk_id, &message);
        Ok(())
    }

    pub(crate) async fn close(&mut self, session: &CustomerSession) -> Result<()> {
        self.store.close_talk(&session.scope, &session.talk_id).await?;
        // Local sessions hear about it through the close notification.
        self.distribution.send_talk_closed(&session.talk_id);
        Ok(())
    }

    fn on_message(&mut self, sender: SessionId, talk_id: &str, message: &TalkMessage) {
        let key = talk_id.to_string();
        let response = CustomerResponse::Message {
            talk_id: key.clone(),
            message: MessageView::for_customer(message),
        };
        if self.talks.broadcast(&key, Some(sender), &response) {
            self.distribution.remove_tracked_talk(talk_id);
        }
    }

    fn on_closed(&mut self, talk_id: &str) {
        let sessions = self.talks.remove_key(&talk_id.to_string());
        if sessions.is_empty() {
            return;
        }
        for session in &sessions {
            let close = CustomerResponse::Close {
                talk_id: talk_id.to_string(),
            };
            if let Err(e) = session.send(close) {
                debug!(
                    talk_id = %talk_id,
                    session = session.unique_id,
                    error = %e,
                    "close not delivered"
                );
            }
        }
        self.distribution.remove_tracked_talk(talk_id);
        debug!(talk_id = %talk_id, sessions = sessions.len(), "talk closed");
    }

    fn drop_session(&mut self, talk_id: &str, session_id: SessionId) {
        if self.talks.remove(&talk_id.to_string(), session_id) {
            self.distribution.remove_tracked_talk(talk_id);
        }
    }
}

/// Funnels distribution callbacks back onto the controller task.
struct CustomerEvents {
    poster: Poster<CustomerMd>,
}

impl CustomerObserver for CustomerEvents {
    fn on_message_incoming(&self, sender: SessionId, talk_id: &str, message: &TalkMessage) {
        let talk_id = talk_id.to_string();
        let message = message.clone();
        self.poster.post(move |md: &mut CustomerMd| {
            Box::pin(async move { md.on_message(sender, &talk_id, &message) })
        });
    }

    fn on_talk_closed(&self, talk_id: &str) {
        let talk_id = talk_id.to_string();
        self.poster
            .post(move |md: &mut CustomerMd| Box::pin(async move { md.on_closed(&talk_id) }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::LocalDistribution;
    use talk_store::{MemoryTalkStore, NewTalk, ScopeTags, SequentialIds, StoreError};
    use tokio::sync::mpsc;

    async fn setup() -> (CustomerMd, Arc<dyn TalkStore>, String) {
        let ids = Arc::new(SequentialIds::default());
        let store: Arc<dyn TalkStore> = Arc::new(MemoryTalkStore::new(ids));
        let talk_id = store
            .create_talk(NewTalk {
                act_id: "a".into(),
                biz_id: "b".into(),
                title: "refund".into(),
                creator_id: 7,
                creator_name: "eve".into(),
            })
            .await
            .unwrap();
        let md = CustomerMd::new(Arc::new(LocalDistribution::new(store.clone())));
        (md, store, talk_id)
    }

    fn customer(
        ids: &SequentialIds,
        talk_id: &str,
        capacity: usize,
    ) -> (Arc<CustomerSession>, mpsc::Receiver<CustomerResponse>) {
        CustomerSession::new(ids, 7, ScopeTags::single("a", "b"), talk_id, false, capacity)
    }

    async fn recv(rx: &mut mpsc::Receiver<CustomerResponse>) -> CustomerResponse {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn install_outside_scope_kicks() {
        let (mut md, _store, talk_id) = setup().await;
        let ids = SequentialIds::default();
        let outside = ScopeTags::single("x", "y");
        let (session, mut rx) = CustomerSession::new(&ids, 7, outside, talk_id, false, 4);

        assert!(matches!(md.install(session).await, Err(HubError::NotFound)));
        assert_eq!(md.talk_count(), 0);
        match rx.try_recv().unwrap() {
            CustomerResponse::KickOut { message, .. } => assert_eq!(message, "talk not found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn install_pushes_history_to_new_session() {
        let (mut md, store, talk_id) = setup().await;
        store
            .append_message(&talk_id, &TalkMessage::text(7, "eve", true, "earlier"))
            .await
            .unwrap();
        let ids = SequentialIds::default();
        let (session, mut rx) = customer(&ids, &talk_id, 4);

        md.install(session.clone()).await.unwrap();
        assert!(md.has_session(&talk_id, session.unique_id));
        match recv(&mut rx).await {
            CustomerResponse::Messages { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].user, "you");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_is_confirmed_and_stored() {
        let (mut md, store, talk_id) = setup().await;
        let ids = SequentialIds::default();
        let (session, mut rx) = customer(&ids, &talk_id, 4);
        md.install(session.clone()).await.unwrap();
        let _history = recv(&mut rx).await;

        // sender fields are taken from the session
        let message = TalkMessage::text(999, "eve", false, "hello");
        md.incoming_message(&session, 41, message.clone()).await.unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            CustomerResponse::MessageConfirmed { seq_id: 41, at: message.at }
        );
        let stored = store.list_messages(&talk_id, 0, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender_id, 7);
        assert!(stored[0].from_customer);
    }

    #[tokio::test]
    async fn unconfirmable_sender_is_dropped_before_storing() {
        let (mut md, store, talk_id) = setup().await;
        let (poster, mut jobs) = Poster::channel(8);
        md.setup(poster);
        let ids = SequentialIds::default();
        let scope = ScopeTags::single("a", "b");
        let (a, mut rx_a) = CustomerSession::new(&ids, 7, scope.clone(), talk_id.clone(), false, 1);
        let (b, mut rx_b) = CustomerSession::new(&ids, 7, scope, talk_id.clone(), false, 4);
        md.install(a.clone()).await.unwrap();
        md.install(b.clone()).await.unwrap();
        let _ = recv(&mut rx_a).await;
        let _ = recv(&mut rx_b).await;
        a.send(CustomerResponse::Close { talk_id: talk_id.clone() }).unwrap();

        let outcome = md
            .incoming_message(&a, 1, TalkMessage::text(7, "eve", true, "lost"))
            .await;
        assert!(matches!(outcome, Err(HubError::Aborted)));
        assert!(!md.has_session(&talk_id, a.unique_id));
        assert!(md.has_session(&talk_id, b.unique_id));
        assert!(store.list_messages(&talk_id, 0, 0).await.unwrap().is_empty());
        assert!(jobs.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        // the kick-out did not fit either
        assert!(matches!(rx_a.try_recv(), Ok(CustomerResponse::Close { .. })));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_last_unconfirmable_sender_untracks_talk() {
        let (mut md, _store, talk_id) = setup().await;
        let ids = SequentialIds::default();
        let (a, mut rx_a) = customer(&ids, &talk_id, 1);
        md.install(a.clone()).await.unwrap();
        let _ = recv(&mut rx_a).await;
        a.send(CustomerResponse::Close { talk_id: talk_id.clone() }).unwrap();

        let lost = TalkMessage::text(7, "eve", true, "lost");
        assert!(md.incoming_message(&a, 1, lost).await.is_err());
        assert_eq!(md.talk_count(), 0);
    }

    #[tokio::test]
    async fn message_to_closed_talk_is_not_confirmed() {
        let (mut md, store, talk_id) = setup().await;
        let (poster, mut jobs) = Poster::channel(8);
        md.setup(poster);
        let ids = SequentialIds::default();
        let (a, mut rx) = customer(&ids, &talk_id, 4);
        md.install(a.clone()).await.unwrap();
        let _history = recv(&mut rx).await;
        store.close_talk(&ScopeTags::unrestricted(), &talk_id).await.unwrap();

        let outcome = md
            .incoming_message(&a, 2, TalkMessage::text(7, "eve", true, "after close"))
            .await;
        assert!(matches!(outcome, Err(HubError::Store(StoreError::TalkClosed(_)))));
        assert!(rx.try_recv().is_err());
        assert!(jobs.try_recv().is_err());
        assert!(store.list_messages(&talk_id, 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn install_of_hung_up_session_is_refused() {
        let (mut md, _store, talk_id) = setup().await;
        let ids = SequentialIds::default();
        let (a, rx) = customer(&ids, &talk_id, 4);
        drop(rx);

        assert!(matches!(md.install(a.clone()).await, Err(HubError::Aborted)));
        assert!(!md.has_session(&talk_id, a.unique_id));
        assert_eq!(md.talk_count(), 0);
    }

    #[tokio::test]
    async fn uninstall_ahead_of_install_wins() {
        let (mut md, _store, talk_id) = setup().await;
        let ids = SequentialIds::default();
        let (a, mut rx) = customer(&ids, &talk_id, 4);

        assert!(matches!(md.uninstall(&a), Err(HubError::NotFound)));
        md.install(a.clone()).await.unwrap();
        assert!(!md.has_session(&talk_id, a.unique_id));
        assert_eq!(md.talk_count(), 0);
        assert!(rx.try_recv().is_err());

        // the record is spent; another session installs normally
        let (b, _rx_b) = customer(&ids, &talk_id, 4);
        md.install(b.clone()).await.unwrap();
        assert!(md.has_session(&talk_id, b.unique_id));
    }

    #[tokio::test]
    async fn uninstalled_session_cannot_send() {
        let (mut md, _store, talk_id) = setup().await;
        let ids = SequentialIds::default();
        let (session, _rx) = customer(&ids, &talk_id, 4);
        md.install(session.clone()).await.unwrap();
        md.uninstall(&session).unwrap();

        assert_eq!(md.session_count(&talk_id), 0);
        assert!(matches!(
            md.incoming_message(&session, 1, TalkMessage::text(7, "eve", true, "late")).await,
            Err(HubError::NotFound)
        ));
    }

    #[tokio::test]
    async fn close_notification_drops_talk() {
        let (mut md, _store, talk_id) = setup().await;
        let ids = SequentialIds::default();
        let (a, mut rx_a) = customer(&ids, &talk_id, 4);
        let (b, mut rx_b) = customer(&ids, &talk_id, 4);
        md.install(a).await.unwrap();
        md.install(b).await.unwrap();
        let _ = recv(&mut rx_a).await;
        let _ = recv(&mut rx_b).await;

        md.on_closed(&talk_id);
        assert_eq!(md.talk_count(), 0);
        assert_eq!(rx_a.try_recv().unwrap(), CustomerResponse::Close { talk_id: talk_id.clone() });
        assert_eq!(rx_b.try_recv().unwrap(), CustomerResponse::Close { talk_id });
    }
}
