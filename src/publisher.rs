// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides the [`Publisher`] role and the fire-and-forget
//! [`Producer`]. The request/reply variant lives in [`crate::rpc_client`];
//! both share [`PublishCore`], which runs the pre-publish steps:
//!
//! 1. auto-declare the topology (when enabled)
//! 2. safe mode check of the target exchange (when enabled)
//! 3. serialization of structured payloads
//! 4. merge of the default and caller supplied properties and headers
//!
//! The current OpenTelemetry context is injected into the headers of every
//! published message.

use crate::{
    config::ProducerOptions,
    errors::AmqpError,
    message::{Envelope, HeaderValue, Headers, MessageProperties, Payload, SERIALIZED_HEADER},
    otel,
    session::Session,
    topology::Topology,
    transport::{BrokerChannel, BrokerConnection},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// A message handed to a [`Publisher`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub payload: Payload,
    pub exchange: String,
    pub routing_key: String,
    /// Override the producer defaults
    pub properties: MessageProperties,
    pub headers: Headers,
}

impl PublishMessage {
    pub fn new(exchange: &str, routing_key: &str, payload: impl Into<Payload>) -> Self {
        PublishMessage {
            payload: payload.into(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: MessageProperties::default(),
            headers: Headers::new(),
        }
    }

    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

/// Outbound role shared by producers and RPC clients.
#[async_trait]
pub trait Publisher: Send {
    /// `()` for fire-and-forget producers, the reply body for RPC clients.
    type Reply: Send;

    async fn publish(
        &mut self,
        ctx: &Context,
        msg: PublishMessage,
    ) -> Result<Self::Reply, AmqpError>;
}

/// A message ready to be written on `channel`.
pub(crate) struct Prepared {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) envelope: Envelope,
}

/// Connection, topology and options of an outbound runtime object.
pub(crate) struct PublishCore {
    pub(crate) session: Session,
    topology: Arc<dyn Topology>,
    pub(crate) options: ProducerOptions,
    auto_declare: bool,
}

impl PublishCore {
    pub(crate) fn new(
        connection: Arc<dyn BrokerConnection>,
        topology: Arc<dyn Topology>,
        options: ProducerOptions,
        auto_declare: bool,
    ) -> Self {
        PublishCore {
            session: Session::new(connection),
            topology,
            options,
            auto_declare,
        }
    }

    /// Runs the pre-publish steps and builds the envelope to send.
    ///
    /// Nothing is written to the broker when the safe mode check fails.
    pub(crate) async fn prepare(
        &mut self,
        ctx: &Context,
        msg: PublishMessage,
    ) -> Result<Prepared, AmqpError> {
        let channel = self.session.get_channel().await?;

        if self.auto_declare {
            self.topology.declare_all(channel.as_ref()).await?;
        }

        if self.options.safe
            && !self
                .topology
                .exchange_exists(channel.as_ref(), &msg.exchange)
                .await?
        {
            error!(
                producer = %self.options.name,
                exchange = %msg.exchange,
                "refusing to publish to an undeclared exchange"
            );
            return Err(AmqpError::TopologyMissing(msg.exchange));
        }

        let mut headers = Headers::new();
        otel::inject(ctx, &mut headers);
        headers.extend(msg.headers);

        let body = match msg.payload {
            Payload::Bytes(body) => body,
            Payload::Value(value) => {
                let body = (self.options.serializer)(&value)?;
                headers.insert(SERIALIZED_HEADER.to_owned(), HeaderValue::Int(1));
                body
            }
        };

        let mut properties = MessageProperties::default()
            .with_content_type(&self.options.content_type)
            .with_delivery_mode(self.options.delivery_mode)
            .merge(msg.properties);
        if properties.message_id.is_none() {
            properties.message_id = Some(Uuid::new_v4().to_string());
        }

        Ok(Prepared {
            channel,
            exchange: msg.exchange,
            routing_key: msg.routing_key,
            envelope: Envelope {
                body,
                properties,
                headers,
            },
        })
    }
}

/// Fire-and-forget publisher.
pub struct Producer {
    core: PublishCore,
}

impl Producer {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        topology: Arc<dyn Topology>,
        options: ProducerOptions,
        auto_declare: bool,
    ) -> Self {
        Producer {
            core: PublishCore::new(connection, topology, options, auto_declare),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.options.name
    }

    /// Re-establishes the connection; the next publish uses a fresh channel.
    pub async fn renew(&mut self) -> Result<(), AmqpError> {
        self.core.session.renew().await
    }

    pub async fn close(&mut self) {
        self.core.session.close().await
    }
}

#[async_trait]
impl Publisher for Producer {
    type Reply = ();

    async fn publish(&mut self, ctx: &Context, msg: PublishMessage) -> Result<(), AmqpError> {
        let prepared = self.core.prepare(ctx, msg).await?;

        prepared
            .channel
            .basic_publish(&prepared.exchange, &prepared.routing_key, &prepared.envelope)
            .await?;

        debug!(
            producer = %self.core.options.name,
            exchange = %prepared.exchange,
            routing_key = %prepared.routing_key,
            "message published"
        );

        Ok(())
    }
}
