// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Command Messaging Adapter
//!
//! This module provides the error type shared by every broker-facing operation.
//! The `AmqpError` enum represents all failure scenarios that can occur during
//! connection, channel, publishing, consuming and acknowledgment operations.
//! Handler failures are not broker errors and live in [`crate::handler`].

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the broker operation that failed. Variants carrying a
/// `String` keep the underlying transport's description for logging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error closing a channel or a connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// An operation required a live connection but none is established
    #[error("not connected")]
    NotConnected,

    /// The configured port does not contain a usable port number
    #[error("invalid port `{0}`")]
    InvalidPortError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error reported by an open delivery stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(String),

    /// Error serializing a command envelope
    #[error("failure to serialize command `{0}`")]
    SerializeCommandError(String),

    /// The connection could not be rebuilt after a failure
    #[error("failure to reconnect `{0}`")]
    ReconnectError(String),
}
