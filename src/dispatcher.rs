// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatch
//!
//! A [`Dispatcher`] is the strategy a consumer uses to turn a delivery into
//! handler calls and broker acknowledgements. [`HandlerDispatcher`] backs the
//! fire-and-forget consumer; the RPC server plugs in
//! [`crate::rpc_server::RpcDispatcher`] instead.

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, HandlerError, HandlerOutcome},
    transport::BrokerChannel,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

/// Result of handing one delivery to its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// The handler failed; the delivery has been acknowledged anyway
    HandlerFailed(HandlerError),
}

/// Routes deliveries of the registered queues to their handlers.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Queues to subscribe to, in subscription order.
    fn queues(&self) -> Vec<String>;

    /// Handles `msg` and settles it on `channel`.
    ///
    /// Errors are transport failures only; handler failures are reported
    /// through [`DispatchOutcome::HandlerFailed`] or turned into replies.
    async fn dispatch(
        &self,
        ctx: &Context,
        channel: &dyn BrokerChannel,
        msg: &ConsumerMessage,
    ) -> Result<DispatchOutcome, AmqpError>;
}

/// Queue name to [`ConsumerHandler`] mapping of a fire-and-forget consumer.
#[derive(Clone, Default)]
pub struct HandlerDispatcher {
    handlers: BTreeMap<String, Arc<dyn ConsumerHandler>>,
}

impl HandlerDispatcher {
    pub fn new() -> Self {
        HandlerDispatcher::default()
    }

    /// Registers `handler` for deliveries from `queue`.
    pub fn register(mut self, queue: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.handlers.insert(queue.to_owned(), handler);
        self
    }
}

#[async_trait]
impl Dispatcher for HandlerDispatcher {
    fn queues(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    async fn dispatch(
        &self,
        ctx: &Context,
        channel: &dyn BrokerChannel,
        msg: &ConsumerMessage,
    ) -> Result<DispatchOutcome, AmqpError> {
        let delivery_tag = msg.delivery.delivery_tag;

        let Some(handler) = self.handlers.get(&msg.queue) else {
            warn!(queue = %msg.queue, "removing message from queue - reason: no handler");
            channel.ack(delivery_tag).await?;
            return Ok(DispatchOutcome::Handled);
        };

        match handler.exec(ctx, msg).await {
            Ok(HandlerOutcome::Ack) => {
                debug!("message successfully processed");
                channel.ack(delivery_tag).await?;
            }
            Ok(HandlerOutcome::Reject) => {
                debug!("message rejected by handler");
                channel.reject(delivery_tag, false).await?;
            }
            Ok(HandlerOutcome::Requeue) => {
                debug!("message requeued by handler");
                channel.reject(delivery_tag, true).await?;
            }
            Err(err) => {
                channel.ack(delivery_tag).await?;
                return Ok(DispatchOutcome::HandlerFailed(err));
            }
        }

        Ok(DispatchOutcome::Handled)
    }
}
