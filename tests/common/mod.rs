// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport contract, with hooks to inject
//! deliveries, server-side closes and consumer cancellations.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rabbitmq_commands::{
    command::Command,
    errors::AmqpError,
    transport::{
        Acker, BrokerChannel, BrokerConnection, ChannelEvent, Delivery, DeliveryStream,
        Headers, Transport,
    },
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl Published {
    pub fn command(&self) -> Command {
        Command::try_decode(&self.body).expect("published body is a command")
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|value| value.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack(u64),
    Reject { tag: u64, requeue: bool },
}

impl Settlement {
    pub fn tag(&self) -> u64 {
        match self {
            Settlement::Ack(tag) => *tag,
            Settlement::Reject { tag, .. } => *tag,
        }
    }
}

#[derive(Default)]
struct State {
    dials: Vec<String>,
    refuse_dials: bool,
    fail_publishes: bool,
    next_tag: u64,
    next_channel: usize,
    published: Vec<Published>,
    settlements: Vec<Settlement>,
    qos: Vec<(u16, bool)>,
    subscriptions: Vec<(String, String)>,
    channels_opened: usize,
    channels_closed: usize,
    connections_closed: usize,
    channel_events: HashMap<usize, mpsc::UnboundedSender<ChannelEvent>>,
    consuming: HashMap<String, (usize, String)>,
    feeds: HashMap<String, mpsc::UnboundedSender<Delivery>>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn refuse_dials(&self, refuse: bool) {
        self.with(|s| s.refuse_dials = refuse);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.with(|s| s.fail_publishes = fail);
    }

    pub fn dials(&self) -> Vec<String> {
        self.with(|s| s.dials.clone())
    }

    pub fn published(&self) -> Vec<Published> {
        self.with(|s| s.published.clone())
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.with(|s| s.settlements.clone())
    }

    pub fn qos(&self) -> Vec<(u16, bool)> {
        self.with(|s| s.qos.clone())
    }

    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.with(|s| s.subscriptions.clone())
    }

    pub fn channels_opened(&self) -> usize {
        self.with(|s| s.channels_opened)
    }

    pub fn channels_closed(&self) -> usize {
        self.with(|s| s.channels_closed)
    }

    pub fn connections_closed(&self) -> usize {
        self.with(|s| s.connections_closed)
    }

    /// Pushes `body` to the consumer currently subscribed to `queue` and returns its delivery tag.
    pub fn deliver(&self, queue: &str, body: &[u8]) -> u64 {
        self.with(|s| {
            s.next_tag += 1;
            let tag = s.next_tag;
            let acker = MemoryAcker {
                tag,
                state: self.state.clone(),
            };
            let delivery = Delivery::new(tag, body.to_vec(), Headers::new(), Box::new(acker));

            s.feeds
                .get(queue)
                .expect("a consumer is subscribed")
                .send(delivery)
                .expect("the consumer is listening");
            tag
        })
    }

    pub fn deliver_command(&self, queue: &str, command: &Command) -> u64 {
        self.deliver(queue, &command.encode().unwrap())
    }

    /// Simulates the broker dropping the connection: every open channel is
    /// closed by the server and every delivery stream ends.
    pub fn sever(&self) {
        self.with(|s| {
            s.feeds.clear();
            s.consuming.clear();
            for (_, events) in s.channel_events.drain() {
                let _ = events.send(ChannelEvent::Closed {
                    initiated_by_server: true,
                    reason: "CONNECTION_FORCED - broker forced connection closure".to_owned(),
                });
            }
        });
    }

    /// Simulates the broker cancelling the consumer of `queue`, for example because the queue was deleted.
    pub fn cancel(&self, queue: &str) {
        self.with(|s| {
            s.feeds.remove(queue);
            if let Some((channel, tag)) = s.consuming.remove(queue) {
                if let Some(events) = s.channel_events.get(&channel) {
                    let _ = events.send(ChannelEvent::Cancelled { consumer_tag: tag });
                }
            }
        });
    }

    pub async fn wait_until(&self, what: &str, mut done: impl FnMut(&MemoryBroker) -> bool) {
        let waiting = async {
            while !done(self) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        if tokio::time::timeout(WAIT_LIMIT, waiting).await.is_err() {
            panic!("timed out waiting for {}", what);
        }
    }

    pub async fn wait_for_subscriptions(&self, queue: &str, count: usize) {
        self.wait_until("subscriptions", |b| {
            b.subscriptions().iter().filter(|(q, _)| q == queue).count() >= count
                && b.with(|s| s.feeds.contains_key(queue))
        })
        .await;
    }

    pub async fn wait_for_settlements(&self, count: usize) -> Vec<Settlement> {
        self.wait_until("settlements", |b| b.settlements().len() >= count)
            .await;
        self.settlements()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let refused = self.with(|s| {
            s.dials.push(uri.to_owned());
            s.refuse_dials
        });

        if refused {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let (events_tx, events) = mpsc::unbounded_channel();

        let id = self.broker.with(|s| {
            s.next_channel += 1;
            s.channels_opened += 1;
            s.channel_events.insert(s.next_channel, events_tx.clone());
            s.next_channel
        });

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            events_tx,
            events: tokio::sync::Mutex::new(events),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.with(|s| s.connections_closed += 1);
        Ok(())
    }
}

struct MemoryChannel {
    id: usize,
    broker: MemoryBroker,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.broker.with(|s| s.qos.push((prefetch_count, global)));
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let (feed, deliveries) = mpsc::unbounded_channel::<Delivery>();

        self.broker.with(|s| {
            s.subscriptions
                .push((queue.to_owned(), consumer_tag.to_owned()));
            s.feeds.insert(queue.to_owned(), feed);
            s.consuming
                .insert(queue.to_owned(), (self.id, consumer_tag.to_owned()));
        });

        Ok(stream::unfold(deliveries, |mut deliveries| async move {
            deliveries
                .recv()
                .await
                .map(|delivery| (Ok(delivery), deliveries))
        })
        .boxed())
    }

    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), AmqpError> {
        self.broker.with(|s| {
            if s.fail_publishes {
                return Err(AmqpError::PublishingError("channel blocked".to_owned()));
            }

            s.published.push(Published {
                queue: routing_key.to_owned(),
                body: body.to_vec(),
                headers: headers.clone(),
            });
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.with(|s| {
            s.channels_closed += 1;
            s.channel_events.remove(&self.id);
        });

        let _ = self.events_tx.send(ChannelEvent::Closed {
            initiated_by_server: false,
            reason: "closed by client".to_owned(),
        });
        Ok(())
    }

    async fn closed(&self) -> ChannelEvent {
        self.events
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(ChannelEvent::Closed {
                initiated_by_server: false,
                reason: "dropped".to_owned(),
            })
    }
}

struct MemoryAcker {
    tag: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .settlements
            .push(Settlement::Ack(self.tag));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.state.lock().unwrap().settlements.push(Settlement::Reject {
            tag: self.tag,
            requeue,
        });
        Ok(())
    }
}
