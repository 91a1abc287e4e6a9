// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The runtime objects talk to the broker only through these two traits.
//! [`crate::channel`] implements them on top of lapin; tests replace them
//! with mocks.

use crate::{
    config::QosOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Envelope},
    queue::{BindingDefinition, QueueDefinition},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

#[cfg(test)]
use mockall::automock;

/// A broker session that channels are multiplexed on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the session is currently established.
    fn is_connected(&self) -> bool;

    /// Opens a new channel on the current session.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Tears the session down and establishes it again.
    ///
    /// Every channel opened before the reconnect becomes unusable.
    async fn reconnect(&self) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A multiplexed sub-session used for one unit of publish/consume work.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Channel number, or `None` once the channel is no longer open.
    fn id(&self) -> Option<u16>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Check-only declaration; reports existence without creating anything.
    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError>;

    /// Declares a queue and returns its name (broker-generated for anonymous queues).
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind(&self, binding: &BindingDefinition) -> Result<(), AmqpError>;

    async fn basic_qos(&self, qos: &QosOptions) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError>;

    /// Subscribes to `queue`; deliveries become available through [`BrokerChannel::wait`].
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Whether at least one subscription is active on the channel.
    fn is_consuming(&self) -> bool;

    /// Waits for the next delivery of any subscription on the channel.
    ///
    /// With a timeout, returns [`AmqpError::IdleTimeout`] when nothing arrives
    /// in time. Without one, waits for as long as it takes.
    async fn wait(&self, timeout: Option<Duration>) -> Result<Delivery, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
