// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
pub(crate) mod testing;

pub mod channel;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod control;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod rpc_client;
pub mod rpc_server;
pub mod session;
pub mod topology;
pub mod transport;
