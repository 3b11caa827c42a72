//! AMQP 0-9-1 broker (RabbitMQ) via lapin.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::connector::{BrokerConnection, BrokerConnector, BrokerPublisher, Deliveries};
use crate::error::{HubError, Result};

fn transport_error(e: lapin::Error) -> HubError {
    HubError::TransportBroken(e.to_string())
}

// Talk exchanges come and go with the talks; nothing about them is durable.
fn exchange_options() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: false,
        auto_delete: true,
        ..Default::default()
    }
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(exchange, ExchangeKind::Fanout, exchange_options(), FieldTable::default())
        .await
        .map_err(transport_error)
}

pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let conn = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(transport_error)?;

        let broken = CancellationToken::new();
        let signal = broken.clone();
        conn.on_error(move |e| {
            error!(error = %e, "amqp connection error");
            signal.cancel();
        });

        Ok(Arc::new(AmqpConnection { conn, broken }))
    }
}

struct AmqpConnection {
    conn: Connection,
    broken: CancellationToken,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn broken(&self) -> CancellationToken {
        self.broken.clone()
    }

    async fn open_publisher(&self) -> Result<Box<dyn BrokerPublisher>> {
        let channel = self.conn.create_channel().await.map_err(transport_error)?;
        Ok(Box::new(AmqpPublisher {
            channel,
            broken: self.broken.child_token(),
        }))
    }

    async fn subscribe(&self, exchange: &str) -> Result<Deliveries> {
        let channel = self.conn.create_channel().await.map_err(transport_error)?;
        declare_exchange(&channel, exchange).await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        channel
            .queue_bind(
                queue.name().as_str(),
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        debug!(exchange = %exchange, queue = queue.name().as_str(), "amqp consumer started");

        // The stream owns the channel; dropping it closes the subscription.
        let deliveries = consumer.map(move |delivery| {
            let _channel = &channel;
            delivery.map(|d| d.data).map_err(transport_error)
        });
        Ok(deliveries.boxed())
    }
}

struct AmqpPublisher {
    channel: Channel,
    broken: CancellationToken,
}

#[async_trait]
impl BrokerPublisher for AmqpPublisher {
    fn broken(&self) -> CancellationToken {
        self.broken.clone()
    }

    async fn publish(&self, exchange: &str, payload: &[u8]) -> Result<()> {
        let published = async {
            declare_exchange(&self.channel, exchange).await?;
            self.channel
                .basic_publish(
                    exchange,
                    "",
                    BasicPublishOptions::default(),
                    payload,
                    BasicProperties::default(),
                )
                .await
                .map_err(transport_error)?;
            Ok::<(), HubError>(())
        }
        .await;

        // A failed publish leaves the channel closed on the server side.
        if published.is_err() {
            self.broken.cancel();
        }
        published
    }
}
