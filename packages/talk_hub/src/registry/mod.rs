//! Session registries.
//!
//! A registry is owned by exactly one controller task and is only ever touched
//! from inside it, so plain maps are enough. Inner maps are pruned as soon as
//! they become empty; an outer key with no sessions never lingers.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::error::Result;
use crate::protocol::{CustomerResponse, ServicerResponse};
use crate::session::{CustomerSession, ServicerSession, SessionId};

mod customer;
mod servicer;

pub use customer::CustomerMd;
pub use servicer::ServicerMd;

pub(crate) const REASON_SEND_FAILED: &str = "send failed";

/// A session as seen by a registry.
pub(crate) trait Member: Send + Sync {
    type Response: Clone;

    fn session_id(&self) -> SessionId;
    fn deliver(&self, response: Self::Response) -> Result<()>;
    fn kick(&self, reason: &str);
}

impl Member for CustomerSession {
    type Response = CustomerResponse;

    fn session_id(&self) -> SessionId {
        self.unique_id
    }

    fn deliver(&self, response: CustomerResponse) -> Result<()> {
        self.send(response)
    }

    fn kick(&self, reason: &str) {
        CustomerSession::kick(self, reason)
    }
}

impl Member for ServicerSession {
    type Response = ServicerResponse;

    fn session_id(&self) -> SessionId {
        self.unique_id
    }

    fn deliver(&self, response: ServicerResponse) -> Result<()> {
        self.send(response)
    }

    fn kick(&self, reason: &str) {
        ServicerSession::kick(self, reason)
    }
}

/// Uninstalls that overtook their install.
///
/// Install and uninstall travel on separate queues, so the controller may
/// hand a session's uninstall to the registry first. The registry records it
/// here and the later install is dropped. Entries go away once consumed or
/// once nothing holds the session any more.
pub(crate) struct EarlyUninstalls<S> {
    entries: HashMap<SessionId, Weak<S>>,
}

impl<S> EarlyUninstalls<S> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn record(&mut self, id: SessionId, session: &Arc<S>) {
        self.entries.retain(|_, s| s.strong_count() > 0);
        self.entries.insert(id, Arc::downgrade(session));
    }

    /// True when `id` was uninstalled before this install. Consumes the entry.
    pub fn take(&mut self, id: SessionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Two-level `key -> session id -> session` map.
pub(crate) struct SessionTable<K, S> {
    entries: HashMap<K, HashMap<SessionId, Arc<S>>>,
}

impl<K, S> SessionTable<K, S>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    S: Member,
{
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Returns true when `session` is the first one under `key`.
    pub fn insert(&mut self, key: K, session: Arc<S>) -> bool {
        let inner = self.entries.entry(key).or_default();
        let first = inner.is_empty();
        inner.insert(session.session_id(), session);
        first
    }

    /// Returns true when this removal left `key` without sessions.
    pub fn remove(&mut self, key: &K, session_id: SessionId) -> bool {
        let Some(inner) = self.entries.get_mut(key) else {
            return false;
        };
        if inner.remove(&session_id).is_none() {
            return false;
        }
        if inner.is_empty() {
            self.entries.remove(key);
            return true;
        }
        false
    }

    pub fn remove_key(&mut self, key: &K) -> Vec<Arc<S>> {
        self.entries
            .remove(key)
            .map(|inner| inner.into_values().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &K, session_id: SessionId) -> bool {
        self.entries
            .get(key)
            .is_some_and(|inner| inner.contains_key(&session_id))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self, key: &K) -> usize {
        self.entries.get(key).map_or(0, HashMap::len)
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Send `response` to every session under `key` except `exclude`.
    ///
    /// Sessions that cannot take the response are kicked and removed; the rest
    /// still receive it. Returns true when pruning left `key` empty.
    pub fn broadcast(
        &mut self,
        key: &K,
        exclude: Option<SessionId>,
        response: &S::Response,
    ) -> bool {
        let Some(inner) = self.entries.get_mut(key) else {
            return false;
        };
        inner.retain(|id, session| {
            if Some(*id) == exclude {
                return true;
            }
            deliver_or_kick(session.as_ref(), response.clone())
        });
        if inner.is_empty() {
            self.entries.remove(key);
            return true;
        }
        false
    }

    /// Send to every session in the table accepted by `filter`. Returns the
    /// keys that pruning emptied.
    pub fn broadcast_where<F>(&mut self, filter: F, response: &S::Response) -> Vec<K>
    where
        F: Fn(&S) -> bool,
    {
        let mut emptied = Vec::new();
        for (key, inner) in self.entries.iter_mut() {
            inner.retain(|_, session| {
                !filter(session.as_ref()) || deliver_or_kick(session.as_ref(), response.clone())
            });
            if inner.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in &emptied {
            self.entries.remove(key);
        }
        emptied
    }
}

fn deliver_or_kick<S: Member + ?Sized>(session: &S, response: S::Response) -> bool {
    match session.deliver(response) {
        Ok(()) => true,
        Err(e) => {
            debug!(session = session.session_id(), error = %e, "dropping session");
            session.kick(REASON_SEND_FAILED);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talk_store::{ScopeTags, SequentialIds};

    fn session(
        ids: &SequentialIds,
        talk: &str,
        cap: usize,
    ) -> (Arc<CustomerSession>, tokio::sync::mpsc::Receiver<CustomerResponse>) {
        CustomerSession::new(ids, 1, ScopeTags::unrestricted(), talk, false, cap)
    }

    #[test]
    fn early_uninstall_is_consumed_once() {
        let ids = SequentialIds::default();
        let mut early = EarlyUninstalls::new();
        let (a, _ra) = session(&ids, "t", 4);

        early.record(a.unique_id, &a);
        assert!(early.take(a.unique_id));
        assert!(!early.take(a.unique_id));
    }

    #[test]
    fn early_uninstalls_of_dropped_sessions_are_forgotten() {
        let ids = SequentialIds::default();
        let mut early = EarlyUninstalls::new();
        let (a, _ra) = session(&ids, "t", 4);
        let (b, _rb) = session(&ids, "t", 4);

        early.record(a.unique_id, &a);
        drop(a);
        early.record(b.unique_id, &b);
        assert_eq!(early.len(), 1);
        assert!(early.take(b.unique_id));
    }

    #[test]
    fn last_removal_prunes_key() {
        let ids = SequentialIds::default();
        let mut table = SessionTable::new();
        let (a, _ra) = session(&ids, "t", 4);
        let (b, _rb) = session(&ids, "t", 4);

        assert!(table.insert("t".to_string(), a.clone()));
        assert!(!table.insert("t".to_string(), b.clone()));
        assert!(!table.remove(&"t".to_string(), a.unique_id));
        // removing twice is not an emptying event
        assert!(!table.remove(&"t".to_string(), a.unique_id));
        assert!(table.remove(&"t".to_string(), b.unique_id));
        assert_eq!(table.key_count(), 0);
    }

    #[test]
    fn broadcast_skips_sender_and_prunes_failures() {
        let ids = SequentialIds::default();
        let mut table = SessionTable::new();
        let key = "t".to_string();
        let (sender, mut r_sender) = session(&ids, "t", 4);
        let (full, _r_full) = session(&ids, "t", 1);
        let (ok, mut r_ok) = session(&ids, "t", 4);
        for s in [&sender, &full, &ok] {
            table.insert(key.clone(), s.clone());
        }
        full.send(CustomerResponse::Close { talk_id: "x".into() }).unwrap();

        let msg = CustomerResponse::Close { talk_id: "t".into() };
        assert!(!table.broadcast(&key, Some(sender.unique_id), &msg));

        assert_eq!(table.len(&key), 2);
        assert!(!table.contains(&key, full.unique_id));
        assert_eq!(r_ok.try_recv().unwrap(), msg);
        assert!(r_sender.try_recv().is_err());
    }

    #[test]
    fn filtered_broadcast_reports_emptied_keys() {
        let ids = SequentialIds::default();
        let mut table = SessionTable::new();
        let (gone, rx) = session(&ids, "a", 4);
        drop(rx);
        let (kept, mut r_kept) = session(&ids, "b", 4);
        table.insert("a".to_string(), gone);
        table.insert("b".to_string(), kept);

        let close = CustomerResponse::Close { talk_id: "z".into() };
        let emptied = table.broadcast_where(|_| true, &close);
        assert_eq!(emptied, vec!["a".to_string()]);
        assert!(table.contains_key(&"b".to_string()));
        assert!(r_kept.try_recv().is_ok());
    }
}
