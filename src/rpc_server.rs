// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Server
//!
//! A consumer whose handlers produce a response for each request. The
//! response goes back through the default exchange to the request's
//! `reply_to` queue, carrying the request's correlation id. A failing handler
//! still produces a reply, with an error description as body.

use crate::{
    codec::compress,
    consumer::Consumer,
    dispatcher::{DispatchOutcome, Dispatcher},
    errors::AmqpError,
    handler::{ConsumerMessage, RpcHandler},
    message::{Envelope, MessageProperties, COMPRESSED_HEADER},
    transport::BrokerChannel,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Longest response preview written to the logs
const RESPONSE_PREVIEW_LEN: usize = 500;

/// Consumer answering requests with [`RpcHandler`]s.
pub type RpcServer = Consumer<RpcDispatcher>;

#[derive(Clone, Default)]
pub struct RpcDispatcher {
    handlers: BTreeMap<String, Arc<dyn RpcHandler>>,
    compressed: bool,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        RpcDispatcher::default()
    }

    pub fn register(mut self, queue: &str, handler: Arc<dyn RpcHandler>) -> Self {
        self.handlers.insert(queue.to_owned(), handler);
        self
    }

    /// Compress successful responses with zlib.
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    async fn respond(
        &self,
        ctx: &Context,
        handler: &dyn RpcHandler,
        msg: &ConsumerMessage,
    ) -> Result<(Vec<u8>, bool), AmqpError> {
        let response = match handler.exec(ctx, msg).await {
            Ok(response) => response,
            Err(err) => {
                error!(queue = %msg.queue, error = err.to_string(), "rpc handler failed");
                return Ok((format!("error: {err}").into_bytes(), false));
            }
        };

        debug!(queue = %msg.queue, response = %preview(&response), "rpc response");

        if !self.compressed {
            return Ok((response, false));
        }

        let body = compress(&response)?;
        debug!(
            original_size = response.len(),
            compressed_size = body.len(),
            "rpc response compressed"
        );

        Ok((body, true))
    }
}

#[async_trait]
impl Dispatcher for RpcDispatcher {
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
            warn!(queue = %msg.queue, "removing request from queue - reason: no handler");
            channel.ack(delivery_tag).await?;
            return Ok(DispatchOutcome::Handled);
        };

        let (body, compressed) = self.respond(ctx, handler.as_ref(), msg).await?;

        let request = &msg.envelope().properties;
        match request.reply_to.as_deref().filter(|to| !to.is_empty()) {
            Some(reply_to) => {
                let mut properties = MessageProperties::default();
                properties.correlation_id = request.correlation_id.clone();

                let mut reply = Envelope::new(body).with_properties(properties);
                if compressed {
                    reply = reply.with_header(COMPRESSED_HEADER, 1);
                }

                channel.basic_publish("", reply_to, &reply).await?;
            }
            None => warn!(queue = %msg.queue, "request without reply_to, nothing to answer"),
        }

        channel.ack(delivery_tag).await?;

        Ok(DispatchOutcome::Handled)
    }
}

fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= RESPONSE_PREVIEW_LEN {
        return text.into_owned();
    }

    let mut cut: String = text.chars().take(RESPONSE_PREVIEW_LEN).collect();
    cut.push_str("...");
    cut
}
