// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The contract between the consume loop and user code. A handler receives
//! the trace context of the delivery and a [`ConsumerMessage`]; it must not
//! keep anything from the message or the channel beyond the call.

use crate::message::{Delivery, Envelope};
use async_trait::async_trait;
use opentelemetry::Context;
use thiserror::Error;

/// What the consumer does with a delivery after its handler returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Positive acknowledgement
    #[default]
    Ack,
    /// Reject and drop (or dead-letter) the message
    Reject,
    /// Reject and put the message back on the queue
    Requeue,
}

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        HandlerError(value.to_owned())
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        HandlerError(value)
    }
}

/// A delivery as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    /// Queue the delivery was consumed from
    pub queue: String,
    pub delivery: Delivery,
    /// Decoded body, when the producer flagged it as serialized
    pub value: Option<serde_json::Value>,
}

impl ConsumerMessage {
    pub fn new(queue: &str, delivery: Delivery) -> Self {
        ConsumerMessage {
            queue: queue.to_owned(),
            delivery,
            value: None,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.envelope.body
    }

    pub fn envelope(&self) -> &Envelope {
        &self.delivery.envelope
    }
}

/// Handler of a fire-and-forget consumer.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage)
        -> Result<HandlerOutcome, HandlerError>;
}

/// Handler of an RPC server; the returned bytes are sent back to the caller.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<Vec<u8>, HandlerError>;
}

/// Adapts a plain function into a [`ConsumerHandler`] or [`RpcHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ConsumerHandler for FnHandler<F>
where
    F: Fn(&ConsumerMessage) -> Result<HandlerOutcome, HandlerError> + Send + Sync,
{
    async fn exec(
        &self,
        _ctx: &Context,
        msg: &ConsumerMessage,
    ) -> Result<HandlerOutcome, HandlerError> {
        (self.0)(msg)
    }
}

#[async_trait]
impl<F> RpcHandler for FnHandler<F>
where
    F: Fn(&ConsumerMessage) -> Result<Vec<u8>, HandlerError> + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<Vec<u8>, HandlerError> {
        (self.0)(msg)
    }
}
