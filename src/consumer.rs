// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Command Consumer
//!
//! This module consumes commands from a queue and runs them through the
//! registered handlers, one delivery at a time. For each delivery it:
//! 1. Decodes the body into a [`Command`] (malformed bodies decode to an empty
//!    handler and travel to the dead-letter queue in the `body` header)
//! 2. Looks up the handler registered for `command.handler`
//! 3. Invokes it, catching panics at the handler boundary
//! 4. Acknowledges successes, republishes failures with an incremented attempt
//!    counter after a backoff, and routes exhausted, unrecognized or panicking
//!    commands to `<queue>.deadletter`
//! 5. Settles the delivery exactly once, whatever happened before. When the
//!    republish itself fails, retryable failures are requeued and everything
//!    else is acknowledged
//!
//! The consumer publishes through its own [`Publisher`], never through the
//! monitored channel it consumes from.

use crate::{
    command::Command,
    connection::ConnectionManager,
    errors::AmqpError,
    handler::{invoke, CommandHandler, HandlerFailure},
    otel,
    publisher::Publisher,
    retry::Backoff,
    transport::{Delivery, DeliveryStream, HeaderValue, Headers},
};
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Suffix of the queue receiving commands that must not be retried.
pub const DEAD_LETTER_SUFFIX: &str = ".deadletter";

/// Unacknowledged deliveries a consumer may hold.
pub const PREFETCH_COUNT: u16 = 1;

pub const WORKER_ID_HEADER: &str = "workerId";
pub const COMMAND_ID_HEADER: &str = "commandId";
pub const ERROR_HEADER: &str = "error";
pub const ATTEMPT_HEADER: &str = "attempt";
/// Raw body of a delivery that could not be decoded.
pub const BODY_HEADER: &str = "body";

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// Result of routing and running one command.
#[derive(Debug)]
enum Outcome {
    Unrecognized,
    Handled(Result<(), HandlerFailure>),
}

/// What to do with a delivery before settling it.
///
/// A republish that fails requeues the delivery only for retryable outcomes.
/// Dead-lettered panics and unrecognized handlers are acknowledged anyway.
#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    Acknowledge,
    Republish {
        queue: String,
        command: Command,
        error: String,
        delay: Duration,
        requeue_on_failure: bool,
    },
}

fn resolve(queue: &str, mut command: Command, outcome: Outcome, backoff: &Backoff) -> Resolution {
    match outcome {
        Outcome::Handled(Ok(())) => Resolution::Acknowledge,
        Outcome::Unrecognized => Resolution::Republish {
            queue: dead_letter_queue(queue),
            error: format!("Unrecognized handler: `{}`", command.handler),
            command,
            delay: Duration::ZERO,
            requeue_on_failure: false,
        },
        Outcome::Handled(Err(failure @ HandlerFailure::Unexpected(_))) => Resolution::Republish {
            queue: dead_letter_queue(queue),
            command,
            error: failure.description(),
            delay: Duration::ZERO,
            requeue_on_failure: false,
        },
        Outcome::Handled(Err(failure @ HandlerFailure::Reported(_))) => {
            let attempt = command.record_attempt();
            let target = if command.retry.exhausted() {
                warn!(attempt, limit = command.retry.limit, "retry limit - message is sent to deadletter queue");
                dead_letter_queue(queue)
            } else {
                queue.to_owned()
            };

            Resolution::Republish {
                queue: target,
                command,
                error: failure.description(),
                delay: backoff.delay(attempt),
                requeue_on_failure: true,
            }
        }
    }
}

/// Short correlation id carried in the `commandId` header. Logs prefix it with `CID-`.
fn new_command_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(10);
    id
}

/// Consumes commands from a queue and dispatches them to registered handlers.
pub struct Consumer {
    id: String,
    manager: Arc<ConnectionManager>,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    publisher: Publisher,
    backoff: Backoff,
    stop: watch::Sender<bool>,
}

impl Consumer {
    /// Creates a consumer identified by `id`, used as its consumer tag and in
    /// the headers of every command it republishes.
    pub fn new(id: &str, manager: Arc<ConnectionManager>) -> Consumer {
        let (stop, _) = watch::channel(false);

        Consumer {
            id: id.to_owned(),
            publisher: Publisher::new(manager.clone()),
            manager,
            handlers: RwLock::new(HashMap::default()),
            backoff: Backoff::default(),
            stop,
        }
    }

    /// Replaces the default backoff of one second per attempt.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registers `handler` for commands whose `handler` field is `name`.
    /// A later registration under the same name replaces the earlier one.
    pub fn add_handler<H>(&self, name: &str, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Arc::new(handler));
    }

    /// Subscribes to `queue` on the manager's monitored channel with a prefetch of one.
    pub async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let channel = self.manager.channel()?;

        channel.qos(PREFETCH_COUNT, true).await?;
        let deliveries = channel.consume(queue, &self.id).await?;

        info!(queue, consumer = self.id, "consumer started, waiting for messages...");
        Ok(deliveries)
    }

    /// Processes `deliveries` sequentially until the stream ends or [`Consumer::stop`] is called.
    pub async fn process(&self, queue: &str, mut deliveries: DeliveryStream) -> Result<(), AmqpError> {
        let mut stop = self.stop.subscribe();

        loop {
            if *stop.borrow_and_update() {
                info!(queue, consumer = self.id, "consumer stopped");
                return Ok(());
            }

            tokio::select! {
                _ = stop.changed() => continue,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.handle_message(delivery, queue).await,
                    Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                    None => {
                        info!(queue, consumer = self.id, "delivery stream closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Subscribes to `queue` and processes its deliveries. Blocks for the
    /// lifetime of the subscription.
    pub async fn consume(&self, queue: &str) -> Result<(), AmqpError> {
        let deliveries = self.subscribe(queue).await?;
        self.process(queue, deliveries).await
    }

    /// Resubscribes to `queue` after every reconnect of the manager.
    ///
    /// The subscription is in place before the manager reports the reconnect
    /// as complete; deliveries are then processed on a spawned task.
    pub fn resume_on_reconnect(self: &Arc<Self>, queue: &str) {
        let consumer = Arc::downgrade(self);
        let queue = queue.to_owned();

        self.manager.add_reconnect_event(move || {
            let consumer = consumer.clone();
            let queue = queue.clone();

            async move {
                let Some(consumer) = consumer.upgrade() else {
                    return;
                };

                match consumer.subscribe(&queue).await {
                    Ok(deliveries) => {
                        tokio::spawn(async move {
                            if let Err(err) = consumer.process(&queue, deliveries).await {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        });
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue, "failure to resume consuming")
                    }
                }
            }
        });
    }

    /// Stops processing before the next delivery. A stopped consumer stays stopped.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    async fn handle_message(&self, delivery: Delivery, queue: &str) {
        let started = Instant::now();
        let command_id = new_command_id();
        let span = info_span!("command", worker_id = %self.id, command_id = %format!("CID-{}", command_id));

        let (command, undecodable) = match Command::try_decode(&delivery.data) {
            Ok(command) => (command, None),
            Err(err) => {
                span.in_scope(|| warn!(error = err.to_string(), "failure to decode command"));
                (
                    Command::new(),
                    Some(String::from_utf8_lossy(&delivery.data).into_owned()),
                )
            }
        };

        self.run_pipeline(delivery, queue, command, &command_id, undecodable.as_deref())
            .instrument(span.clone())
            .await;

        span.in_scope(|| {
            info!(
                elapsed = format!("{:.4}", started.elapsed().as_secs_f64()),
                "=== command was performed"
            )
        });
    }

    async fn run_pipeline(
        &self,
        delivery: Delivery,
        queue: &str,
        command: Command,
        command_id: &str,
        undecodable: Option<&str>,
    ) {
        info!(
            queue,
            body = %String::from_utf8_lossy(&delivery.data),
            "message received from queue"
        );

        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &command.handler);

        let outcome = match self.handler(&command.handler) {
            None => {
                warn!(handler = command.handler, "handler is unrecognized, message is sent to deadletter queue");
                Outcome::Unrecognized
            }
            Some(handler) => Outcome::Handled(invoke(handler.as_ref(), command.clone()).await),
        };

        match &outcome {
            Outcome::Handled(Err(HandlerFailure::Reported(errors))) => {
                for err in errors {
                    warn!(error = err.to_string(), "handler failure");
                }
            }
            Outcome::Handled(Err(HandlerFailure::Unexpected(panic))) => {
                error!(panic, "%% panic error %% - message is sent to deadletter queue");
            }
            _ => {}
        }

        let mut requeue_on_failure = false;
        let settled = match resolve(queue, command, outcome, &self.backoff) {
            Resolution::Acknowledge => {
                span.set_status(Status::Ok);
                Ok(())
            }
            Resolution::Republish {
                queue: target,
                command,
                error,
                delay,
                requeue_on_failure: requeue,
            } => {
                requeue_on_failure = requeue;
                span.set_status(Status::Error {
                    description: Cow::from(error.clone()),
                });

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                self.republish(&ctx, &target, &command, command_id, &error, undecodable)
                    .await
            }
        };

        match settled {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                }
            }
            Err(err) if requeue_on_failure => {
                error!(error = err.to_string(), "failure to republish command, requeuing msg");
                span.record_error(&err);
                if let Err(err) = delivery.reject(true).await {
                    error!(error = err.to_string(), "error whiling requeuing msg");
                }
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    body = %String::from_utf8_lossy(&delivery.data),
                    "failure to publish to deadletter queue, message is dropped"
                );
                span.record_error(&err);
                if let Err(err) = delivery.ack().await {
                    error!(error = err.to_string(), "error whiling ack msg");
                }
            }
        }

        span.end();
    }

    async fn republish(
        &self,
        ctx: &Context,
        queue: &str,
        command: &Command,
        command_id: &str,
        error: &str,
        undecodable: Option<&str>,
    ) -> Result<(), AmqpError> {
        let body = command.encode()?;

        let mut headers = Headers::new();
        headers.insert(WORKER_ID_HEADER.to_owned(), HeaderValue::from(self.id.as_str()));
        headers.insert(COMMAND_ID_HEADER.to_owned(), HeaderValue::from(command_id));
        headers.insert(ERROR_HEADER.to_owned(), HeaderValue::from(error));
        headers.insert(
            ATTEMPT_HEADER.to_owned(),
            HeaderValue::from(i64::from(command.retry.attempt)),
        );
        if let Some(body) = undecodable {
            headers.insert(BODY_HEADER.to_owned(), HeaderValue::from(body));
        }

        self.publisher.publish(ctx, queue, &body, &mut headers).await
    }
}
