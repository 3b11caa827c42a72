//! Broker-backed fanout between processes.

pub mod amqp;
pub mod connector;
pub mod envelope;
pub mod memory;
pub mod transport;

pub use amqp::AmqpConnector;
pub use connector::{BrokerConnection, BrokerConnector, BrokerPublisher, Deliveries};
pub use envelope::{
    CATCH_ALL_CHANNEL, CUSTOMER_CHANNEL, Envelope, EnvelopePayload, SERVICER_CHANNEL,
};
pub use memory::{MemoryBroker, MemoryConnector};
pub use transport::{BrokerTransport, LinkState, Role, TransportOptions};
