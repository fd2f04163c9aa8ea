// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! This module implements the transport contract of [`crate::transport`] with
//! lapin. It establishes connections, creates channels, converts headers between
//! the crate's representation and AMQP field tables, and turns lapin's error
//! callbacks and consumer cancellations into [`ChannelEvent`] notifications.

use crate::{
    errors::AmqpError,
    publisher::JSON_CONTENT_TYPE,
    transport::{
        Acker, BrokerChannel, BrokerConnection, ChannelEvent, Delivery, DeliveryStream,
        HeaderValue, Headers, Transport,
    },
};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error};
use uuid::Uuid;

/// Opens lapin connections.
pub struct LapinTransport {
    connection_name: String,
}

impl LapinTransport {
    /// Creates a transport whose connections are announced to the broker as `connection_name`.
    pub fn new(connection_name: &str) -> Arc<LapinTransport> {
        Arc::new(LapinTransport {
            connection_name: connection_name.to_owned(),
        })
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (errors, _) = broadcast::channel(4);
        let notify = errors.clone();
        conn.on_error(move |err| {
            let _ = notify.send(err.to_string());
        });

        Ok(Arc::new(LapinConnection { inner: conn, errors }))
    }
}

struct LapinConnection {
    inner: Connection,
    errors: broadcast::Sender<String>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.inner.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;
        debug!(id = channel.id(), "channel created");

        let (events_tx, events) = mpsc::unbounded_channel();
        let on_error = events_tx.clone();
        channel.on_error(move |err| {
            let _ = on_error.send(ChannelEvent::Closed {
                initiated_by_server: true,
                reason: err.to_string(),
            });
        });

        Ok(Arc::new(LapinChannel {
            inner: channel,
            events_tx,
            notifications: Mutex::new(Notifications {
                events,
                connection_errors: self.errors.subscribe(),
            }),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::CloseError(err.to_string())
        })
    }
}

struct Notifications {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    connection_errors: broadcast::Receiver<String>,
}

struct LapinChannel {
    inner: Channel,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    notifications: Mutex<Notifications>,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        let deliveries = consumer.map(|result| {
            Some(
                result
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string())),
            )
        });

        // lapin ends the stream of a channel that is still open only when the
        // broker cancels the consumer.
        let status = self.inner.status().clone();
        let events = self.events_tx.clone();
        let tag = consumer_tag.to_owned();
        let cancelled = stream::once(async move {
            if status.connected() {
                let _ = events.send(ChannelEvent::Cancelled { consumer_tag: tag });
            }
            None
        });

        Ok(deliveries.chain(cancelled).filter_map(future::ready).boxed())
    }

    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(to_field_table(headers)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let _ = self.events_tx.send(ChannelEvent::Closed {
            initiated_by_server: false,
            reason: "closed by client".to_owned(),
        });

        self.inner.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the channel");
            AmqpError::CloseError(err.to_string())
        })
    }

    async fn closed(&self) -> ChannelEvent {
        let mut guard = self.notifications.lock().await;
        let notifications = &mut *guard;

        tokio::select! {
            Some(event) = notifications.events.recv() => event,
            Ok(reason) = notifications.connection_errors.recv() => ChannelEvent::Closed {
                initiated_by_server: true,
                reason,
            },
            else => ChannelEvent::Closed {
                initiated_by_server: false,
                reason: "notification sources dropped".to_owned(),
            },
        }
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    Delivery::new(
        delivery.delivery_tag,
        delivery.data,
        headers,
        Box::new(LapinAcker(delivery.acker)),
    )
}

/// Converts crate headers to an AMQP field table.
fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Timestamp(v) => AMQPValue::Timestamp(*v),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts an AMQP field table to crate headers, skipping nested values.
fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => {
                    HeaderValue::LongString(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(v) => HeaderValue::LongString(v.to_string()),
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                AMQPValue::ShortShortInt(v) => HeaderValue::LongLongInt(i64::from(*v)),
                AMQPValue::ShortShortUInt(v) => HeaderValue::LongLongInt(i64::from(*v)),
                AMQPValue::ShortInt(v) => HeaderValue::LongLongInt(i64::from(*v)),
                AMQPValue::ShortUInt(v) => HeaderValue::LongLongInt(i64::from(*v)),
                AMQPValue::LongInt(v) => HeaderValue::LongLongInt(i64::from(*v)),
                AMQPValue::LongUInt(v) => HeaderValue::LongLongInt(i64::from(*v)),
                AMQPValue::LongLongInt(v) => HeaderValue::LongLongInt(*v),
                AMQPValue::Timestamp(v) => HeaderValue::Timestamp(*v),
                _ => return None,
            };

            Some((key.as_str().to_owned(), value))
        })
        .collect()
}
