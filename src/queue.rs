// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue and Binding Definitions
//!
//! This module provides the queue declaration parameters and the bindings
//! that connect queues (or other exchanges) to a source exchange.

use crate::message::{Arguments, HeaderValue};
use serde::Deserialize;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_ARGS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_ARGS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_ARGS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_ARGS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_ARGS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a queue with its declaration parameters.
///
/// An empty name asks the broker to generate one; the generated name is
/// returned by the declaration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    #[serde(rename = "auto_delete")]
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) arguments: Arguments,
}

impl QueueDefinition {
    /// Creates a new non-durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// A broker-named, exclusive, auto-delete queue, as used for RPC replies.
    pub fn anonymous() -> QueueDefinition {
        QueueDefinition::new("").exclusive().delete()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Checks for existence instead of creating the queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Adds a declaration argument such as `x-queue-type`.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    pub fn ttl(self, ttl: i32) -> Self {
        self.argument(AMQP_ARGS_MESSAGE_TTL, ttl)
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i32) -> Self {
        self.argument(AMQP_ARGS_MAX_LENGTH, max)
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.argument(AMQP_ARGS_MAX_LENGTH_BYTES, max_bytes)
    }

    /// Dead-letters rejected and expired messages to `exchange` with `routing_key`.
    pub fn dead_letter(self, exchange: &str, routing_key: &str) -> Self {
        self.argument(AMQP_ARGS_DEAD_LETTER_EXCHANGE, exchange)
            .argument(AMQP_ARGS_DEAD_LETTER_ROUTING_KEY, routing_key)
    }
}

/// What a binding attaches to its source exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingTarget {
    Queue(String),
    Exchange(String),
}

impl BindingTarget {
    pub fn name(&self) -> &str {
        match self {
            BindingTarget::Queue(name) | BindingTarget::Exchange(name) => name,
        }
    }
}

/// Binding of a queue or exchange to a source exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BindingDefinition {
    pub(crate) destination: BindingTarget,
    pub(crate) exchange: String,
    #[serde(default)]
    pub(crate) routing_key: String,
    #[serde(default)]
    pub(crate) arguments: Arguments,
}

impl BindingDefinition {
    /// Binds `queue` to `exchange` with an empty routing key.
    pub fn queue(queue: &str, exchange: &str) -> BindingDefinition {
        BindingDefinition {
            destination: BindingTarget::Queue(queue.to_owned()),
            exchange: exchange.to_owned(),
            routing_key: String::new(),
            arguments: Arguments::default(),
        }
    }

    /// Binds the `destination` exchange to the `source` exchange.
    pub fn exchange(destination: &str, source: &str) -> BindingDefinition {
        BindingDefinition {
            destination: BindingTarget::Exchange(destination.to_owned()),
            exchange: source.to_owned(),
            routing_key: String::new(),
            arguments: Arguments::default(),
        }
    }

    /// Sets the routing key the binding matches on.
    ///
    /// # Parameters
    /// * `key` - Routing key or topic pattern
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    pub fn destination(&self) -> &BindingTarget {
        &self.destination
    }

    pub fn source(&self) -> &str {
        &self.exchange
    }
}
