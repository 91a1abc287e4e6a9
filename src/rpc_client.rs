// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! Request/reply over the broker. Every call declares a private reply queue,
//! publishes the request with a fresh correlation id and waits until the
//! matching reply arrives. There is no timeout: a missing responder blocks
//! the caller forever, so callers needing a deadline wrap the call in one.
//!
//! An [`RpcClient`] serves one call at a time (`publish` takes `&mut self`).

use crate::{
    codec::decompress,
    config::ProducerOptions,
    errors::AmqpError,
    publisher::{Prepared, PublishCore, PublishMessage, Publisher},
    queue::QueueDefinition,
    topology::Topology,
    transport::{BrokerChannel, BrokerConnection},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct RpcClient {
    core: PublishCore,
}

impl RpcClient {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        topology: Arc<dyn Topology>,
        options: ProducerOptions,
        auto_declare: bool,
    ) -> Self {
        RpcClient {
            core: PublishCore::new(connection, topology, options, auto_declare),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.options.name
    }

    pub async fn renew(&mut self) -> Result<(), AmqpError> {
        self.core.session.renew().await
    }

    pub async fn close(&mut self) {
        self.core.session.close().await
    }

    async fn call(
        &self,
        channel: &dyn BrokerChannel,
        prepared: Prepared,
        reply_queue: &str,
    ) -> Result<Vec<u8>, AmqpError> {
        let correlation_id = Uuid::new_v4().to_string();

        let mut envelope = prepared.envelope;
        envelope.properties.correlation_id = Some(correlation_id.clone());
        envelope.properties.reply_to = Some(reply_queue.to_owned());

        channel
            .basic_publish(&prepared.exchange, &prepared.routing_key, &envelope)
            .await?;
        debug!(
            client = %self.core.options.name,
            correlation_id = %correlation_id,
            reply_to = reply_queue,
            "rpc request sent"
        );

        loop {
            let delivery = channel.wait(None).await?;

            if delivery.envelope.properties.correlation_id.as_deref() != Some(&correlation_id) {
                debug!(
                    correlation_id = ?delivery.envelope.properties.correlation_id,
                    "discarding reply of another request"
                );
                continue;
            }

            let reply = delivery.envelope;
            if reply.is_compressed() {
                return decompress(&reply.body);
            }

            return Ok(reply.body);
        }
    }
}

#[async_trait]
impl Publisher for RpcClient {
    type Reply = Vec<u8>;

    async fn publish(&mut self, ctx: &Context, msg: PublishMessage) -> Result<Vec<u8>, AmqpError> {
        let prepared = self.core.prepare(ctx, msg).await?;
        let channel = prepared.channel.clone();

        let reply_queue = channel.queue_declare(&QueueDefinition::anonymous()).await?;
        let consumer_tag = format!("{}-rpc-{}", self.core.options.name, Uuid::new_v4().simple());
        channel.basic_consume(&reply_queue, &consumer_tag, true).await?;

        match self.call(channel.as_ref(), prepared, &reply_queue).await {
            Ok(body) => {
                channel.basic_cancel(&consumer_tag).await?;
                Ok(body)
            }
            Err(err) => {
                if let Err(cancel_err) = channel.basic_cancel(&consumer_tag).await {
                    warn!(
                        consumer_tag = %consumer_tag,
                        error = cancel_err.to_string(),
                        "failed to cancel reply consumer"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::compress,
        message::{Delivery, Envelope, MessageProperties, COMPRESSED_HEADER},
        testing::{connection_with, open_channel},
        topology::AmqpTopology,
        transport::MockBrokerChannel,
    };
    use std::sync::Mutex;

    /// Requests seen by the broker, plus the consumer tags of the reply subscriptions.
    #[derive(Default, Clone)]
    struct Calls {
        requests: Arc<Mutex<Vec<Envelope>>>,
        tags: Arc<Mutex<Vec<String>>>,
        cancelled: Arc<Mutex<Vec<String>>>,
    }

    fn reply_plumbing(channel: &mut MockBrokerChannel, calls: &Calls) {
        channel.expect_exchange_exists().returning(|_| Ok(true));
        channel
            .expect_queue_declare()
            .withf(|def| def.name.is_empty() && def.exclusive && def.delete)
            .returning(|_| Ok("amq.gen-reply".to_owned()));

        let tags = calls.tags.clone();
        channel
            .expect_basic_consume()
            .withf(|queue, _, no_ack| queue == "amq.gen-reply" && *no_ack)
            .returning(move |_, tag, _| {
                tags.lock().unwrap().push(tag.to_owned());
                Ok(())
            });

        let cancelled = calls.cancelled.clone();
        channel.expect_basic_cancel().returning(move |tag| {
            cancelled.lock().unwrap().push(tag.to_owned());
            Ok(())
        });

        let requests = calls.requests.clone();
        channel
            .expect_basic_publish()
            .returning(move |_, _, envelope| {
                requests.lock().unwrap().push(envelope.clone());
                Ok(())
            });
    }

    /// Answers every request with a stray reply first, then `body`.
    fn responder(channel: &mut MockBrokerChannel, calls: &Calls, body: Vec<u8>, compressed: bool) {
        let requests = calls.requests.clone();
        let mut stray_sent = false;
        channel.expect_wait().returning(move |_| {
            let request = requests.lock().unwrap().last().cloned().unwrap();

            if !stray_sent {
                stray_sent = true;
                let stray = Envelope::new(b"not yours".to_vec())
                    .with_properties(MessageProperties::default().with_correlation_id("stray"));
                return Ok(Delivery {
                    envelope: stray,
                    ..Default::default()
                });
            }
            stray_sent = false;

            let correlation_id = request.properties.correlation_id.unwrap();
            let mut reply = Envelope::new(body.clone()).with_properties(
                MessageProperties::default().with_correlation_id(&correlation_id),
            );
            if compressed {
                reply = reply.with_header(COMPRESSED_HEADER, 1);
            }

            Ok(Delivery {
                envelope: reply,
                ..Default::default()
            })
        });
    }

    fn client(channel: MockBrokerChannel) -> RpcClient {
        RpcClient::new(
            connection_with(channel),
            Arc::new(AmqpTopology::new()),
            ProducerOptions::new("billing"),
            false,
        )
    }

    #[tokio::test]
    async fn returns_the_matching_reply() {
        let calls = Calls::default();
        let mut channel = open_channel();
        reply_plumbing(&mut channel, &calls);
        responder(&mut channel, &calls, b"pong".to_vec(), false);
        let mut client = client(channel);

        let reply = client
            .publish(&Context::new(), PublishMessage::new("rpc", "ping", "ping"))
            .await
            .unwrap();

        assert_eq!(reply, b"pong");
        let requests = calls.requests.lock().unwrap();
        assert_eq!(requests[0].properties.reply_to.as_deref(), Some("amq.gen-reply"));
        assert_eq!(*calls.cancelled.lock().unwrap(), *calls.tags.lock().unwrap());
    }

    #[tokio::test]
    async fn decompresses_flagged_replies() {
        let calls = Calls::default();
        let mut channel = open_channel();
        reply_plumbing(&mut channel, &calls);
        responder(&mut channel, &calls, compress(b"large report").unwrap(), true);
        let mut client = client(channel);

        let reply = client
            .publish(&Context::new(), PublishMessage::new("rpc", "report", "q"))
            .await
            .unwrap();

        assert_eq!(reply, b"large report");
    }

    #[tokio::test]
    async fn every_call_gets_fresh_identifiers() {
        let calls = Calls::default();
        let mut channel = open_channel();
        reply_plumbing(&mut channel, &calls);
        responder(&mut channel, &calls, b"pong".to_vec(), false);
        let mut client = client(channel);

        for _ in 0..2 {
            client
                .publish(&Context::new(), PublishMessage::new("rpc", "ping", "ping"))
                .await
                .unwrap();
        }

        let requests = calls.requests.lock().unwrap();
        assert_ne!(requests[0].properties.correlation_id, requests[1].properties.correlation_id);
        let tags = calls.tags.lock().unwrap();
        assert_ne!(tags[0], tags[1]);
        assert!(tags[0].starts_with("billing-rpc-"));
    }

    #[tokio::test]
    async fn cancels_the_reply_consumer_on_failure() {
        let calls = Calls::default();
        let mut channel = open_channel();
        reply_plumbing(&mut channel, &calls);
        channel
            .expect_wait()
            .returning(|_| Err(AmqpError::ChannelClosed("broker went away".to_owned())));
        let mut client = client(channel);

        let err = client
            .publish(&Context::new(), PublishMessage::new("rpc", "ping", "ping"))
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::ChannelClosed("broker went away".to_owned()));
        assert_eq!(calls.cancelled.lock().unwrap().len(), 1);
    }
}
