// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Command Handlers
//!
//! Handlers receive a decoded [`Command`] and return the ordered list of errors
//! they ran into; an empty list means success. Any async closure with that
//! shape is a handler.
//!
//! [`invoke`] is the boundary between the consumer and handler code. A panic
//! raised while the handler runs is caught there and reported as
//! [`HandlerFailure::Unexpected`], next to the errors the handler returned
//! itself.

use crate::command::Command;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{any::Any, future::Future, panic::AssertUnwindSafe};

/// Error reported by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes commands addressed to one handler name.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Vec<HandlerError>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<HandlerError>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> Vec<HandlerError> {
        (self)(command).await
    }
}

/// Why a handler invocation did not succeed.
#[derive(Debug)]
pub enum HandlerFailure {
    /// The handler returned one or more errors. Retryable.
    Reported(Vec<HandlerError>),
    /// The handler panicked. Never retried.
    Unexpected(String),
}

impl HandlerFailure {
    /// Description carried in the `error` header of the republished command.
    pub fn description(&self) -> String {
        match self {
            HandlerFailure::Reported(errors) => errors
                .first()
                .map(|err| err.to_string())
                .unwrap_or_default(),
            HandlerFailure::Unexpected(panic) => format!("Panic error: {}", panic),
        }
    }
}

/// Runs `handler` on `command`, turning returned errors and panics into a [`HandlerFailure`].
pub async fn invoke(handler: &dyn CommandHandler, command: Command) -> Result<(), HandlerFailure> {
    match AssertUnwindSafe(handler.handle(command)).catch_unwind().await {
        Ok(errors) if errors.is_empty() => Ok(()),
        Ok(errors) => Err(HandlerFailure::Reported(errors)),
        Err(panic) => Err(HandlerFailure::Unexpected(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
