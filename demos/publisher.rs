// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Publishes one `myHandler` command to the `test` queue.

use opentelemetry::Context;
use rabbitmq_commands::{
    amqp::LapinTransport,
    command::Command,
    config::Config,
    connection::ConnectionManager,
    logging,
    publisher::Publisher,
    transport::Headers,
};
use serde_json::json;
use std::process::ExitCode;
use tracing::{error, info};

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

    let command = Command::with_handler("myHandler", json!({"name": "John", "surname": "Snow"}));
    let body = match command.encode() {
        Ok(body) => body,
        Err(err) => {
            error!(error = err.to_string(), "failure to encode command");
            return ExitCode::FAILURE;
        }
    };

    let publisher = Publisher::new(manager.clone());
    let result = publisher
        .publish(&Context::current(), "test", &body, &mut Headers::new())
        .await;

    if let Err(err) = manager.close().await {
        error!(error = err.to_string(), "failure to close the connection");
    }

    match result {
        Ok(()) => {
            info!("command published");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to publish");
            ExitCode::FAILURE
        }
    }
}
