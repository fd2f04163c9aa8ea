// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Consumes commands from the `test` queue and greets whoever they name.
//!
//! ```bash
//! RABBITMQ_HOST=localhost RABBITMQ_PORT=5672 cargo run --example consumer
//! ```

use rabbitmq_commands::{
    amqp::LapinTransport,
    command::Command,
    config::Config,
    connection::ConnectionManager,
    consumer::Consumer,
    handler::HandlerError,
    logging,
};
use std::{process::ExitCode, sync::Arc};
use tracing::{error, info};

const QUEUE: &str = "test";

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_from_env();

    let config = Config::from_env();
    let transport = LapinTransport::new(&config.connection_name);
    let manager = ConnectionManager::new(config, transport);

    if let Err(err) = manager.connect().await {
        error!(error = err.to_string(), "failure to connect");
        return ExitCode::FAILURE;
    }

    let consumer = Arc::new(Consumer::new("worker-1", manager.clone()));
    consumer.add_handler("myHandler", |command: Command| async move {
        match command.data.get("name").and_then(|name| name.as_str()) {
            Some(name) => {
                info!(name, "hello");
                Vec::<HandlerError>::new()
            }
            None => vec!["command carries no name".into()],
        }
    });
    consumer.resume_on_reconnect(QUEUE);

    let worker = consumer.clone();
    tokio::spawn(async move {
        if let Err(err) = worker.consume(QUEUE).await {
            error!(error = err.to_string(), "failure to consume");
        }
    });

    tokio::select! {
        err = manager.wait_for_failure() => {
            error!(error = err.to_string(), "connection lost for good, exiting");
            ExitCode::FAILURE
        }
        _ = tokio::signal::ctrl_c() => {
            consumer.stop();
            if let Err(err) = manager.close().await {
                error!(error = err.to_string(), "failure to close the connection");
            }
            ExitCode::SUCCESS
        }
    }
}
