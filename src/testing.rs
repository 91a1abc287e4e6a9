// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broker doubles shared by the unit tests.

use crate::{
    errors::AmqpError,
    message::{Delivery, Envelope},
    transport::{BrokerChannel, BrokerConnection, MockBrokerChannel, MockBrokerConnection},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// `(exchange, routing key, envelope)` of every publish seen by a mock channel.
pub(crate) type Published = Arc<Mutex<Vec<(String, String, Envelope)>>>;

/// A mock channel that reports itself open.
pub(crate) fn open_channel() -> MockBrokerChannel {
    let mut channel = MockBrokerChannel::new();
    channel.expect_id().return_const(Some(1u16));
    channel
}

/// A connected mock connection handing out `channel` on every open.
pub(crate) fn connection_with(channel: MockBrokerChannel) -> Arc<dyn BrokerConnection> {
    let channel: Arc<dyn BrokerChannel> = Arc::new(channel);

    let mut conn = MockBrokerConnection::new();
    conn.expect_is_connected().return_const(true);
    conn.expect_open_channel()
        .returning(move || Ok(channel.clone()));
    conn.expect_reconnect().returning(|| Ok(()));
    conn.expect_close().returning(|| Ok(()));

    Arc::new(conn)
}

/// Records every publish on `channel`.
pub(crate) fn record_publishes(channel: &mut MockBrokerChannel) -> Published {
    let published = Published::default();
    let sink = published.clone();
    channel
        .expect_basic_publish()
        .returning(move |exchange, routing_key, envelope| {
            sink.lock()
                .unwrap()
                .push((exchange.to_owned(), routing_key.to_owned(), envelope.clone()));
            Ok(())
        });

    published
}

/// Serves `script` from `wait`, then reports the channel closed.
pub(crate) fn script_waits(
    channel: &mut MockBrokerChannel,
    script: Vec<Result<Delivery, AmqpError>>,
) {
    let script = Arc::new(Mutex::new(VecDeque::from(script)));
    channel.expect_wait().returning(move |_| {
        script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AmqpError::ChannelClosed("script exhausted".to_owned())))
    });
}

pub(crate) fn delivery(consumer_tag: &str, delivery_tag: u64, body: &[u8]) -> Delivery {
    Delivery {
        consumer_tag: consumer_tag.to_owned(),
        delivery_tag,
        envelope: Envelope::new(body.to_vec()),
        ..Default::default()
    }
}
