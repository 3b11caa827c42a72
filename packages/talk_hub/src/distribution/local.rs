use std::sync::Arc;

use async_trait::async_trait;
use talk_store::{TalkMessage, TalkStore};
use tracing::debug;

use super::{
    CustomerDistribution, CustomerObserver, Distribution, Observers, ServicerDistribution,
    ServicerObserver,
};
use crate::error::Result;
use crate::session::SessionId;

/// Single-process distribution. One instance serves both registries and every
/// event is handed to both observers before the call returns.
pub struct LocalDistribution {
    store: Arc<dyn TalkStore>,
    observers: Observers,
}

impl LocalDistribution {
    pub fn new(store: Arc<dyn TalkStore>) -> Self {
        Self {
            store,
            observers: Observers::default(),
        }
    }
}

#[async_trait]
impl Distribution for LocalDistribution {
    fn store(&self) -> Arc<dyn TalkStore> {
        self.store.clone()
    }

    async fn load(&self) -> Result<()> {
        Ok(())
    }

    // Every event reaches this process already.
    fn add_tracked_talk(&self, _talk_id: &str) -> Result<()> {
        Ok(())
    }

    fn remove_tracked_talk(&self, _talk_id: &str) {}

    fn send_message(&self, sender: SessionId, talk_id: &str, message: &TalkMessage) {
        if let Some(ob) = self.observers.customer() {
            ob.on_message_incoming(sender, talk_id, message);
        }
        if let Some(ob) = self.observers.servicer() {
            ob.on_message_incoming(sender, talk_id, message);
        }
    }
}

impl CustomerDistribution for LocalDistribution {
    fn set_customer_observer(&self, observer: Arc<dyn CustomerObserver>) {
        self.observers.set_customer(observer);
    }

    fn send_talk_closed(&self, talk_id: &str) {
        if let Some(ob) = self.observers.customer() {
            ob.on_talk_closed(talk_id);
        }
        if let Some(ob) = self.observers.servicer() {
            ob.on_talk_closed(talk_id);
        }
    }

    fn send_talk_created(&self, talk_id: &str) {
        match self.observers.servicer() {
            Some(ob) => ob.on_talk_created(talk_id),
            None => debug!(talk_id = %talk_id, "no servicer observer for talk creation"),
        }
    }
}

impl ServicerDistribution for LocalDistribution {
    fn set_servicer_observer(&self, observer: Arc<dyn ServicerObserver>) {
        self.observers.set_servicer(observer);
    }

    fn send_servicer_attached(&self, talk_id: &str, servicer_id: u64) {
        if let Some(ob) = self.observers.servicer() {
            ob.on_servicer_attached(talk_id, servicer_id);
        }
    }

    fn send_servicer_detached(&self, talk_id: &str, servicer_id: u64) {
        if let Some(ob) = self.observers.servicer() {
            ob.on_servicer_detached(talk_id, servicer_id);
        }
    }
}
