//! Live connections and their outbound mailboxes.
//!
//! A session is created by the adapter that owns the client stream. The adapter
//! keeps the receiving half of the mailbox and forwards whatever arrives; the
//! registries hold the session and only ever write to it.

use std::sync::Arc;

use talk_store::{IdGenerator, ScopeTags};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{HubError, Result};
use crate::protocol::{CustomerResponse, KickOut, ServicerResponse};

pub type SessionId = u64;

pub const DEFAULT_MAILBOX_CAPACITY: usize = 100;

/// Bounded single-writer mailbox. Sending never waits.
#[derive(Debug)]
pub struct Mailbox<T> {
    tx: mpsc::Sender<T>,
}

impl<T: KickOut> Mailbox<T> {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let capacity = if capacity == 0 {
            DEFAULT_MAILBOX_CAPACITY
        } else {
            capacity
        };
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Fails with [`HubError::Aborted`] when the mailbox is full or the reader is gone.
    pub fn send(&self, message: T) -> Result<()> {
        self.tx.try_send(message).map_err(|_| HubError::Aborted)
    }

    /// Best-effort kick-out notice.
    pub fn kick(&self, reason: &str) {
        if self.tx.try_send(T::kick_out(reason.to_string())).is_err() {
            debug!("kick-out notice dropped: {}", reason);
        }
    }

    /// Claims one slot, so the message sent through the permit cannot fail.
    pub fn reserve(&self) -> Result<mpsc::Permit<'_, T>> {
        self.tx.try_reserve().map_err(|_| HubError::Aborted)
    }

    /// The adapter dropped the receiving half.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct CustomerSession {
    pub unique_id: SessionId,
    pub talk_id: String,
    /// The client created this talk when opening the stream.
    pub created_talk: bool,
    pub user_id: u64,
    pub scope: ScopeTags,
    mailbox: Mailbox<CustomerResponse>,
}

impl CustomerSession {
    pub fn new(
        ids: &dyn IdGenerator,
        user_id: u64,
        scope: ScopeTags,
        talk_id: impl Into<String>,
        created_talk: bool,
        mailbox_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<CustomerResponse>) {
        let (mailbox, rx) = Mailbox::channel(mailbox_capacity);
        let session = Self {
            unique_id: ids.next_id(),
            talk_id: talk_id.into(),
            created_talk,
            user_id,
            scope,
            mailbox,
        };
        (Arc::new(session), rx)
    }

    pub fn send(&self, response: CustomerResponse) -> Result<()> {
        self.mailbox.send(response)
    }

    pub fn reserve(&self) -> Result<mpsc::Permit<'_, CustomerResponse>> {
        self.mailbox.reserve()
    }

    pub fn kick(&self, reason: &str) {
        self.mailbox.kick(reason)
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

#[derive(Debug)]
pub struct ServicerSession {
    pub user_id: u64,
    pub unique_id: SessionId,
    /// Act/biz ids this agent may see. Empty lists are unrestricted.
    pub scope: ScopeTags,
    mailbox: Mailbox<ServicerResponse>,
}

impl ServicerSession {
    pub fn new(
        ids: &dyn IdGenerator,
        user_id: u64,
        scope: ScopeTags,
        mailbox_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ServicerResponse>) {
        let (mailbox, rx) = Mailbox::channel(mailbox_capacity);
        let session = Self {
            user_id,
            unique_id: ids.next_id(),
            scope,
            mailbox,
        };
        (Arc::new(session), rx)
    }

    pub fn send(&self, response: ServicerResponse) -> Result<()> {
        self.mailbox.send(response)
    }

    pub fn reserve(&self) -> Result<mpsc::Permit<'_, ServicerResponse>> {
        self.mailbox.reserve()
    }

    pub fn kick(&self, reason: &str) {
        self.mailbox.kick(reason)
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    pub fn notify(&self, message: &str) -> Result<()> {
        self.send(ServicerResponse::Notify {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talk_store::SequentialIds;

    #[test]
    fn sessions_get_fresh_ids() {
        let ids = SequentialIds::default();
        let (a, _rx_a) = CustomerSession::new(&ids, 1, ScopeTags::single("a", "b"), "t1", false, 4);
        let (b, _rx_b) = ServicerSession::new(&ids, 2, ScopeTags::unrestricted(), 4);
        assert_ne!(a.unique_id, b.unique_id);
    }

    #[test]
    fn full_mailbox_aborts() {
        let ids = SequentialIds::default();
        let (session, mut rx) =
            CustomerSession::new(&ids, 1, ScopeTags::unrestricted(), "t1", false, 2);
        session.send(CustomerResponse::Close { talk_id: "t1".into() }).unwrap();
        session.send(CustomerResponse::Close { talk_id: "t1".into() }).unwrap();
        assert!(matches!(
            session.send(CustomerResponse::Close { talk_id: "t1".into() }),
            Err(HubError::Aborted)
        ));

        // mailbox is FIFO
        assert!(matches!(rx.try_recv(), Ok(CustomerResponse::Close { .. })));
    }

    #[test]
    fn closed_reader_aborts() {
        let ids = SequentialIds::default();
        let (session, rx) = ServicerSession::new(&ids, 1, ScopeTags::unrestricted(), 0);
        drop(rx);
        assert!(matches!(session.notify("hi"), Err(HubError::Aborted)));
    }

    #[test]
    fn reserved_slot_survives_a_full_mailbox() {
        let ids = SequentialIds::default();
        let (session, mut rx) =
            CustomerSession::new(&ids, 1, ScopeTags::unrestricted(), "t1", false, 1);
        let permit = session.reserve().unwrap();
        assert!(matches!(
            session.send(CustomerResponse::Close { talk_id: "t1".into() }),
            Err(HubError::Aborted)
        ));
        permit.send(CustomerResponse::MessageConfirmed { seq_id: 3, at: 0 });
        assert!(matches!(rx.try_recv(), Ok(CustomerResponse::MessageConfirmed { seq_id: 3, .. })));

        assert!(!session.is_closed());
        drop(rx);
        assert!(session.is_closed());
        assert!(matches!(session.reserve(), Err(HubError::Aborted)));
    }

    #[test]
    fn kick_out_is_best_effort() {
        let ids = SequentialIds::default();
        let (session, mut rx) = ServicerSession::new(&ids, 1, ScopeTags::unrestricted(), 1);
        session.kick("talk not found");
        // second kick is silently dropped on the full mailbox
        session.kick("again");
        match rx.try_recv() {
            Ok(ServicerResponse::KickOut { code, message }) => {
                assert_eq!(code, crate::protocol::KICK_OUT_CODE);
                assert_eq!(message, "talk not found");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
