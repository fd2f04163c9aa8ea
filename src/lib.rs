// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod amqp;
pub mod command;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod logging;
pub mod publisher;
pub mod retry;
pub mod transport;
