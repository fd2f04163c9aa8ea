// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Command Envelope
//!
//! A `Command` is the unit of work carried in a message body: the name of the
//! handler that must process it, an opaque payload and the retry bookkeeping
//! that travels with the message across republishes.
//!
//! Commands are encoded as JSON with field names preserved, so any
//! implementation sharing the queue can read them back.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Retry limit assigned to newly created commands.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Retry bookkeeping embedded in every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRetry {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub attempt: u32,
}

fn default_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

impl Default for CommandRetry {
    fn default() -> Self {
        CommandRetry {
            limit: DEFAULT_RETRY_LIMIT,
            attempt: 0,
        }
    }
}

impl CommandRetry {
    fn is_default(&self) -> bool {
        *self == CommandRetry::default()
    }

    /// Whether the attempt counter has reached the configured limit.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.limit
    }
}

/// The application-level unit of work.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub handler: String,
    #[serde(default)]
    pub data: Value,
    // A fresh retry record decodes back to the same defaults, so it is left off the wire.
    #[serde(default, skip_serializing_if = "CommandRetry::is_default")]
    pub retry: CommandRetry,
}

impl Command {
    /// Creates an empty command with the default retry limit and no attempts.
    pub fn new() -> Command {
        Command::default()
    }

    /// Creates a command addressed to `handler` carrying `data`.
    pub fn with_handler(handler: &str, data: Value) -> Command {
        Command {
            handler: handler.to_owned(),
            data,
            retry: CommandRetry::default(),
        }
    }

    /// Overrides the retry limit.
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry.limit = limit;
        self
    }

    /// Serializes the command to its JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::SerializeCommandError(err.to_string()))
    }

    /// Strict decoding, for callers that want to see the parse error.
    pub fn try_decode(bytes: &[u8]) -> Result<Command, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Tolerant decoding used by the consumer.
    ///
    /// Malformed input yields a command with an empty handler, which the
    /// consumer then routes to the dead-letter queue as unrecognized.
    pub fn decode(bytes: &[u8]) -> Command {
        match Command::try_decode(bytes) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = err.to_string(), "failure to decode command");
                Command::new()
            }
        }
    }

    /// Records one more failed handling attempt.
    pub fn record_attempt(&mut self) -> u32 {
        self.retry.attempt = self.retry.attempt.saturating_add(1);
        self.retry.attempt
    }
}
