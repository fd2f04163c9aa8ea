// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages on the default exchange, routed by queue
//! name. Every publish acquires its own short-lived channel from the
//! [`ConnectionManager`] and closes it afterwards, so a stuck publish can never
//! block the manager's monitored channel. OpenTelemetry context is propagated
//! through the message headers.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    otel,
    transport::{HeaderValue, Headers},
};
use chrono::Utc;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header stamped on every published message.
pub const PUBLISHED_AT_HEADER: &str = "publishedAt";

/// Publishes messages through short-lived channels of a [`ConnectionManager`].
#[derive(Clone)]
pub struct Publisher {
    manager: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Publisher {
        Publisher { manager }
    }

    /// Publishes `message` to `queue`.
    ///
    /// `headers` is updated in place with the `publishedAt` timestamp and the
    /// trace context of `ctx`; pass a copy if the caller's map must stay untouched.
    ///
    /// # Returns
    /// Ok(()) on success, or the channel or publishing error
    pub async fn publish(
        &self,
        ctx: &Context,
        queue: &str,
        message: &[u8],
        headers: &mut Headers,
    ) -> Result<(), AmqpError> {
        let channel = self.manager.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), queue, "failure to open a publishing channel");
            err
        })?;

        otel::inject(ctx, headers);
        headers.insert(
            PUBLISHED_AT_HEADER.to_owned(),
            HeaderValue::Timestamp(Utc::now().timestamp().max(0) as u64),
        );

        let result = channel.publish(queue, message, headers).await;

        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "failure to close the publishing channel");
        }

        if result.is_ok() {
            debug!(queue, "message published");
        }

        result
    }
}
