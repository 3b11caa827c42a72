//! Message distribution between processes.
//!
//! Registries never talk to each other directly. They publish talk events
//! through a [`Distribution`] and receive every event (their own included) back
//! through an observer registered once at setup. [`LocalDistribution`] loops
//! events straight back inside one process; [`BrokerDistribution`] goes
//! through a message broker so several processes can share the load.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use talk_store::{TalkMessage, TalkStore};
use tracing::warn;

use crate::error::Result;
use crate::session::SessionId;

mod broker;
mod local;

pub use broker::BrokerDistribution;
pub use local::LocalDistribution;

/// Events a customer registry reacts to.
pub trait CustomerObserver: Send + Sync {
    fn on_message_incoming(&self, sender: SessionId, talk_id: &str, message: &TalkMessage);
    fn on_talk_closed(&self, talk_id: &str);
}

/// Events a servicer registry reacts to.
pub trait ServicerObserver: Send + Sync {
    fn on_message_incoming(&self, sender: SessionId, talk_id: &str, message: &TalkMessage);
    fn on_talk_created(&self, talk_id: &str);
    fn on_talk_closed(&self, talk_id: &str);
    fn on_servicer_attached(&self, talk_id: &str, servicer_id: u64);
    fn on_servicer_detached(&self, talk_id: &str, servicer_id: u64);
}

#[async_trait]
pub trait Distribution: Send + Sync {
    fn store(&self) -> Arc<dyn TalkStore>;

    /// Called once before the owning controller starts.
    async fn load(&self) -> Result<()>;

    /// Start receiving events for `talk_id`.
    fn add_tracked_talk(&self, talk_id: &str) -> Result<()>;

    fn remove_tracked_talk(&self, talk_id: &str);

    fn send_message(&self, sender: SessionId, talk_id: &str, message: &TalkMessage);
}

pub trait CustomerDistribution: Distribution {
    fn set_customer_observer(&self, observer: Arc<dyn CustomerObserver>);
    fn send_talk_closed(&self, talk_id: &str);
    fn send_talk_created(&self, talk_id: &str);
}

pub trait ServicerDistribution: Distribution {
    fn set_servicer_observer(&self, observer: Arc<dyn ServicerObserver>);
    fn send_servicer_attached(&self, talk_id: &str, servicer_id: u64);
    fn send_servicer_detached(&self, talk_id: &str, servicer_id: u64);
}

/// Single-assignment slots for the observers a distribution dispatches to.
#[derive(Default)]
pub struct Observers {
    customer: OnceLock<Arc<dyn CustomerObserver>>,
    servicer: OnceLock<Arc<dyn ServicerObserver>>,
}

impl Observers {
    pub fn set_customer(&self, observer: Arc<dyn CustomerObserver>) {
        if self.customer.set(observer).is_err() {
            warn!("customer observer already set, ignoring");
        }
    }

    pub fn set_servicer(&self, observer: Arc<dyn ServicerObserver>) {
        if self.servicer.set(observer).is_err() {
            warn!("servicer observer already set, ignoring");
        }
    }

    pub fn customer(&self) -> Option<&Arc<dyn CustomerObserver>> {
        self.customer.get()
    }

    pub fn servicer(&self) -> Option<&Arc<dyn ServicerObserver>> {
        self.servicer.get()
    }
}
