// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Contract
//!
//! The connection manager, publisher and consumer only talk to the broker
//! through the traits in this module. [`crate::amqp`] implements them on top of
//! lapin; tests implement them in memory.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// A single message header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    LongString(String),
    LongLongInt(i64),
    Bool(bool),
    /// Seconds since the Unix epoch, the broker's native time format.
    Timestamp(u64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::LongString(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

/// Message headers, keyed by header name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Stream of deliveries produced by a consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Notification raised by a channel when it stops being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel was closed, either by us or by the broker.
    Closed {
        initiated_by_server: bool,
        reason: String,
    },
    /// The broker cancelled a consumer running on the channel.
    Cancelled { consumer_tag: String },
}

impl ChannelEvent {
    /// Whether the event describes a failure that the connection manager must recover from.
    pub fn requires_reconnect(&self) -> bool {
        match self {
            ChannelEvent::Closed {
                initiated_by_server,
                ..
            } => *initiated_by_server,
            ChannelEvent::Cancelled { .. } => true,
        }
    }
}

/// Opens connections to a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel opened on a [`BrokerConnection`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Caps the number of unacknowledged deliveries.
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    /// Starts a manual-ack, non-exclusive consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Publishes `body` on the default exchange, routed to `routing_key`.
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), AmqpError>;

    /// Closes the channel locally. Waiters on [`BrokerChannel::closed`] observe a
    /// close that was not initiated by the server.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Resolves with the first close or cancel notification of the channel.
    async fn closed(&self) -> ChannelEvent;
}

/// Settles one delivery with the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// One message received from the broker.
///
/// Settling a delivery consumes it, so it cannot be acknowledged twice.
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub headers: Headers,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: Vec<u8>, headers: Headers, acker: Box<dyn Acker>) -> Self {
        Delivery {
            delivery_tag,
            data,
            headers,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("headers", &self.headers)
            .finish()
    }
}
