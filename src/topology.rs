// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares the broker topology: exchanges, queues and the
//! bindings between them. Declarations are idempotent, so runtime objects
//! with auto-declare enabled re-issue them before every operation.
//!
//! The main components are:
//! - `Topology` trait: what runtime objects need from a topology manager
//! - `AmqpTopology`: the configured set of declarations
//! - `TopologyDefinition`: the configuration-file shape of a topology

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{BindingDefinition, QueueDefinition},
    transport::BrokerChannel,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Declares exchanges, then queues, then bindings on `channel`.
    ///
    /// Stops at the first declaration the broker rejects; whatever was
    /// declared before the failure stays declared.
    async fn declare_all(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError>;

    /// Reports whether the exchange exists without altering broker state.
    ///
    /// Advisory only: the exchange may disappear between this check and
    /// a subsequent publish.
    async fn exchange_exists(
        &self,
        channel: &dyn BrokerChannel,
        name: &str,
    ) -> Result<bool, AmqpError>;
}

/// Topology as it appears in configuration files.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TopologyDefinition {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<BindingDefinition>,
}

/// The configured declarations, keyed by name for exchanges and queues.
///
/// Built once while loading configuration and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) exchanges: BTreeMap<String, ExchangeDefinition>,
    pub(crate) queues: BTreeMap<String, QueueDefinition>,
    pub(crate) bindings: Vec<BindingDefinition>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Adds an exchange; a later definition with the same name replaces it.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.insert(def.name.clone(), def);
        self
    }

    /// Adds a queue; a later definition with the same name replaces it.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.insert(def.name.clone(), def);
        self
    }

    pub fn binding(mut self, binding: BindingDefinition) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    async fn declare_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for (name, def) in &self.exchanges {
            debug!("creating exchange: {}", name);
            channel.exchange_declare(def).await?;
            debug!("exchange: {} was created", name);
        }

        Ok(())
    }

    async fn declare_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for (name, def) in &self.queues {
            debug!("creating queue: {}", name);
            channel.queue_declare(def).await?;
            debug!("queue: {} was created", name);
        }

        Ok(())
    }

    async fn declare_bindings(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in &self.bindings {
            debug!(
                "binding: {} to the exchange: {} with the key: {}",
                binding.destination.name(),
                binding.exchange,
                binding.routing_key
            );
            channel.bind(binding).await?;
        }

        Ok(())
    }
}

impl From<TopologyDefinition> for AmqpTopology {
    fn from(def: TopologyDefinition) -> Self {
        let topology = def
            .exchanges
            .into_iter()
            .fold(AmqpTopology::new(), AmqpTopology::exchange);
        let topology = def.queues.into_iter().fold(topology, AmqpTopology::queue);

        def.bindings
            .into_iter()
            .fold(topology, AmqpTopology::binding)
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    async fn declare_all(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if self.is_empty() {
            return Ok(());
        }

        self.declare_exchanges(channel).await?;
        self.declare_queues(channel).await?;
        self.declare_bindings(channel).await
    }

    async fn exchange_exists(
        &self,
        channel: &dyn BrokerChannel,
        name: &str,
    ) -> Result<bool, AmqpError> {
        // the default exchange always exists and cannot be declared
        if name.is_empty() {
            return Ok(true);
        }

        channel.exchange_exists(name).await
    }
}
