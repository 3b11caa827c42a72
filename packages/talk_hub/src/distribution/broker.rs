use std::sync::Arc;

use async_trait::async_trait;
use talk_store::{TalkMessage, TalkStore};
use tracing::{debug, warn};

use super::{
    CustomerDistribution, CustomerObserver, Distribution, ServicerDistribution, ServicerObserver,
};
use crate::broker::{
    BrokerTransport, CATCH_ALL_CHANNEL, Envelope, EnvelopePayload, SERVICER_CHANNEL,
};
use crate::error::Result;
use crate::session::SessionId;

/// Distribution over a message broker. Each registry gets its own instance,
/// since the transport's role decides which broadcast channel it listens on.
pub struct BrokerDistribution {
    store: Arc<dyn TalkStore>,
    transport: BrokerTransport,
}

impl BrokerDistribution {
    pub fn new(store: Arc<dyn TalkStore>, transport: BrokerTransport) -> Self {
        Self { store, transport }
    }

    pub fn transport(&self) -> &BrokerTransport {
        &self.transport
    }

    fn message_channel(&self) -> &'static str {
        if self.transport.shared_channel() {
            CATCH_ALL_CHANNEL
        } else {
            ""
        }
    }

    fn publish(&self, envelope: Envelope) {
        let talk_id = envelope.talk_id.clone();
        if let Err(e) = self.transport.send(envelope) {
            warn!(talk_id = %talk_id, error = %e, "envelope dropped");
        }
    }
}

#[async_trait]
impl Distribution for BrokerDistribution {
    fn store(&self) -> Arc<dyn TalkStore> {
        self.store.clone()
    }

    async fn load(&self) -> Result<()> {
        debug!(
            role = ?self.transport.role(),
            shared = self.transport.shared_channel(),
            "broker distribution loaded"
        );
        Ok(())
    }

    fn add_tracked_talk(&self, talk_id: &str) -> Result<()> {
        self.transport.add_track(talk_id)
    }

    fn remove_tracked_talk(&self, talk_id: &str) {
        self.transport.remove_track(talk_id)
    }

    fn send_message(&self, sender: SessionId, talk_id: &str, message: &TalkMessage) {
        self.publish(Envelope::new(
            talk_id,
            self.message_channel(),
            EnvelopePayload::Message {
                sender_session_id: sender,
                message: message.clone(),
            },
        ));
    }
}

impl CustomerDistribution for BrokerDistribution {
    fn set_customer_observer(&self, observer: Arc<dyn CustomerObserver>) {
        self.transport.observers().set_customer(observer);
    }

    // Closure concerns customers and servicers alike.
    fn send_talk_closed(&self, talk_id: &str) {
        self.publish(Envelope::new(talk_id, CATCH_ALL_CHANNEL, EnvelopePayload::TalkClosed));
    }

    fn send_talk_created(&self, talk_id: &str) {
        self.publish(Envelope::new(
            talk_id,
            SERVICER_CHANNEL,
            EnvelopePayload::TalkCreated {
                talk_id: talk_id.to_string(),
            },
        ));
    }
}

impl ServicerDistribution for BrokerDistribution {
    fn set_servicer_observer(&self, observer: Arc<dyn ServicerObserver>) {
        self.transport.observers().set_servicer(observer);
    }

    fn send_servicer_attached(&self, talk_id: &str, servicer_id: u64) {
        self.publish(Envelope::new(
            talk_id,
            SERVICER_CHANNEL,
            EnvelopePayload::ServicerAttached { servicer_id },
        ));
    }

    fn send_servicer_detached(&self, talk_id: &str, servicer_id: u64) {
        self.publish(Envelope::new(
            talk_id,
            SERVICER_CHANNEL,
            EnvelopePayload::ServicerDetached { servicer_id },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Role, TransportOptions};
    use std::sync::Mutex;
    use std::time::Duration;
    use talk_store::MemoryTalkStore;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl ServicerObserver for Events {
        fn on_message_incoming(&self, sender: SessionId, talk_id: &str, _message: &TalkMessage) {
            self.0.lock().unwrap().push(format!("msg:{sender}:{talk_id}"));
        }
        fn on_talk_created(&self, talk_id: &str) {
            self.0.lock().unwrap().push(format!("created:{talk_id}"));
        }
        fn on_talk_closed(&self, talk_id: &str) {
            self.0.lock().unwrap().push(format!("closed:{talk_id}"));
        }
        fn on_servicer_attached(&self, talk_id: &str, servicer_id: u64) {
            self.0.lock().unwrap().push(format!("attach:{talk_id}:{servicer_id}"));
        }
        fn on_servicer_detached(&self, talk_id: &str, servicer_id: u64) {
            self.0.lock().unwrap().push(format!("detach:{talk_id}:{servicer_id}"));
        }
    }

    async fn wait_for_len(events: &Events, len: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while events.0.lock().unwrap().len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events did not arrive");
    }

    fn distribution(
        broker: &MemoryBroker,
        role: Role,
        shared: bool,
        cancel: &CancellationToken,
    ) -> BrokerDistribution {
        let transport = BrokerTransport::start(
            Arc::new(broker.connector()),
            role,
            TransportOptions {
                retry_interval: Duration::from_millis(20),
                shared_channel: shared,
                ..Default::default()
            },
            cancel.clone(),
        );
        BrokerDistribution::new(Arc::new(MemoryTalkStore::default()), transport)
    }

    #[tokio::test]
    async fn customer_events_reach_servicer_process() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let customer = distribution(&broker, Role::Customer, false, &cancel);
        let servicer = distribution(&broker, Role::Servicer, false, &cancel);
        let events = Arc::new(Events::default());
        servicer.set_servicer_observer(events.clone());
        servicer.add_tracked_talk("12").unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.subscriber_count("talk:12") == 0
                || broker.subscriber_count("talk:servicerC") == 0
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        customer.send_talk_created("12");
        wait_for_len(&events, 1).await;
        customer.send_message(3, "12", &TalkMessage::text(1, "c", true, "hello"));
        wait_for_len(&events, 2).await;
        servicer.send_servicer_attached("12", 8);
        wait_for_len(&events, 3).await;

        assert_eq!(
            *events.0.lock().unwrap(),
            vec!["created:12", "msg:3:12", "attach:12:8"]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn shared_channel_routes_messages_through_catch_all() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let customer = distribution(&broker, Role::Customer, true, &cancel);
        let servicer = distribution(&broker, Role::Servicer, true, &cancel);
        let events = Arc::new(Events::default());
        servicer.set_servicer_observer(events.clone());
        // no per-talk subscription in shared mode
        servicer.add_tracked_talk("77").unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.subscriber_count("talk:C") < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        customer.send_message(4, "77", &TalkMessage::text(1, "c", true, "hi"));
        wait_for_len(&events, 1).await;
        assert_eq!(broker.subscriber_count("talk:77"), 0);
        assert_eq!(*events.0.lock().unwrap(), vec!["msg:4:77"]);
        cancel.cancel();
    }
}
