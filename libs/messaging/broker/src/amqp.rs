//! AMQP 0-9-1 adapter over `lapin`

use crate::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ConfirmationStream, Connector,
    Delivery, DeliveryStream, PublishProperties,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use types::{CloseReason, Confirmation, ExchangeKind};

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(io) => BrokerError::ConnectionFailed(io.to_string()),
            lapin::Error::InvalidConnectionState(state) => BrokerError::ConnectionClosed(
                CloseReason::connection_lost(format!("connection is {:?}", state)),
            ),
            lapin::Error::InvalidChannelState(state) => BrokerError::ChannelClosed {
                channel: 0,
                reason: CloseReason::connection_lost(format!("channel is {:?}", state)),
            },
            other => {
                let text = other.to_string();
                if text.contains("PRECONDITION_FAILED") {
                    BrokerError::PreconditionFailed(text)
                } else if text.contains("NOT_FOUND") {
                    BrokerError::NotFound(text)
                } else {
                    BrokerError::Protocol(text)
                }
            }
        }
    }
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn basic_properties(properties: &PublishProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(app_id) = &properties.app_id {
        basic = basic.with_app_id(app_id.clone().into());
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.clone().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.clone().into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(2);
    }
    basic
}

/// Connects to a real broker
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let inner = lapin::Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::connection_failed(e.to_string()))?;

        let (close_tx, close_rx) = watch::channel(None);
        let close_tx = Arc::new(close_tx);

        let on_error_tx = close_tx.clone();
        inner.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            let _ = on_error_tx.send(Some(CloseReason::connection_lost(err.to_string())));
        });

        debug!("AMQP connection established");
        Ok(Arc::new(AmqpConnection {
            inner,
            close_tx,
            close_rx,
        }))
    }
}

pub struct AmqpConnection {
    inner: lapin::Connection,
    close_tx: Arc<watch::Sender<Option<CloseReason>>>,
    close_rx: watch::Receiver<Option<CloseReason>>,
}

impl std::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("connected", &self.inner.status().connected())
            .finish()
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let inner = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel {
            inner,
            publish_seq: AtomicU64::new(0),
            confirms: Mutex::new(None),
        }))
    }

    fn is_open(&self) -> bool {
        self.close_rx.borrow().is_none() && self.inner.status().connected()
    }

    async fn closed(&self) -> CloseReason {
        let mut rx = self.close_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::connection_lost("connection handle dropped");
            }
        }
    }

    async fn close(&self, reason: CloseReason) -> BrokerResult<()> {
        let result = self.inner.close(reason.code, &reason.text).await;
        let _ = self.close_tx.send(Some(reason));
        result.map_err(BrokerError::from)
    }
}

pub struct AmqpChannel {
    inner: lapin::Channel,
    publish_seq: AtomicU64,
    confirms: Mutex<Option<mpsc::UnboundedSender<Confirmation>>>,
}

impl std::fmt::Debug for AmqpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpChannel")
            .field("id", &self.inner.id())
            .field("publish_seq", &self.publish_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl AmqpChannel {
    fn tag_channel(&self, err: lapin::Error) -> BrokerError {
        match BrokerError::from(err) {
            BrokerError::ChannelClosed { reason, .. } => BrokerError::ChannelClosed {
                channel: self.inner.id(),
                reason,
            },
            other => other,
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()> {
        self.inner
            .exchange_declare(
                exchange,
                lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.tag_channel(e))
    }

    async fn queue_declare(&self, queue: &str, durable: bool) -> BrokerResult<String> {
        let declared = self
            .inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.tag_channel(e))?;
        Ok(declared.name().as_str().to_string())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.tag_channel(e))
    }

    async fn confirm_select(&self) -> BrokerResult<ConfirmationStream> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| self.tag_channel(e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.publish_seq.store(0, Ordering::SeqCst);
        *self.confirms.lock() = Some(tx);
        Ok(rx)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()> {
        let pending = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                basic_properties(properties),
            )
            .await;
        let pending = match pending {
            Ok(pending) => pending,
            Err(err) => {
                // Broker-side confirm numbering is unknown from here on
                if self.confirms.lock().take().is_some() {
                    debug!(channel = self.inner.id(), "Confirm stream ended after failed publish");
                }
                return Err(self.tag_channel(err));
            }
        };

        let Some(confirms) = self.confirms.lock().clone() else {
            return Ok(());
        };
        let sequence = self.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(async move {
            match pending.await {
                Ok(confirmation) if confirmation.is_nack() => {
                    let _ = confirms.send(Confirmation::nack(sequence));
                }
                Ok(_) => {
                    let _ = confirms.send(Confirmation::ack(sequence));
                }
                // Channel went away; the publish stays unconfirmed
                Err(err) => debug!(sequence, error = %err, "Publisher confirm lost"),
            }
        });
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.tag_channel(e))?;

        let stream = consumer.map(|item| {
            item.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                body: delivery.data,
            })
            .map_err(BrokerError::from)
        });
        Ok(stream.boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.tag_channel(e))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| self.tag_channel(e))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| self.tag_channel(e))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.confirms.lock().take();
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(types::REPLY_SUCCESS, "channel closed by relay")
            .await
            .map_err(|e| self.tag_channel(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_mapping() {
        let props = PublishProperties::json("relay-publisher").with_message_id("abc");
        let basic = basic_properties(&props);

        assert_eq!(basic.delivery_mode(), &Some(2));
        assert_eq!(
            basic.message_id().as_ref().map(|s| s.as_str()),
            Some("abc")
        );
        assert_eq!(
            basic.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
    }
}
