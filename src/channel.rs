// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel
//!
//! lapin-backed implementations of [`BrokerConnection`] and [`BrokerChannel`].
//! The connection can be re-established in place; the channel multiplexes the
//! delivery streams of all its subscriptions so that a single `wait` call
//! yields the next delivery of any of them.

use crate::{
    config::{QosOptions, RabbitMQConfigs},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Envelope, HeaderValue, Headers, MessageProperties},
    queue::{BindingDefinition, BindingTarget, QueueDefinition},
    transport::{BrokerChannel, BrokerConnection},
};
use async_trait::async_trait;
use futures_util::stream::{BoxStream, SelectAll, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

type DeliveryStream = BoxStream<'static, (String, Result<lapin::message::Delivery, lapin::Error>)>;

/// A broker connection that can be re-established in place.
pub struct AmqpConnection {
    uri: AMQPUri,
    name: String,
    inner: RwLock<Arc<Connection>>,
}

impl AmqpConnection {
    /// Connects to the broker described by `cfg`.
    ///
    /// # Example
    /// ```ignore
    /// let conn = AmqpConnection::connect(&RabbitMQConfigs::from_env()?).await?;
    /// ```
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Arc<AmqpConnection>, AmqpError> {
        let uri = cfg.amqp_uri();
        let conn = dial(&uri, &cfg.app_name).await?;

        Ok(Arc::new(AmqpConnection {
            uri,
            name: cfg.app_name.clone(),
            inner: RwLock::new(Arc::new(conn)),
        }))
    }

    fn current(&self) -> Result<Arc<Connection>, AmqpError> {
        self.inner
            .read()
            .map(|conn| conn.clone())
            .map_err(|_| AmqpError::InternalError)
    }
}

async fn dial(uri: &AMQPUri, name: &str) -> Result<Connection, AmqpError> {
    debug!("creating amqp connection...");
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(name.to_owned()));

    match Connection::connect_uri(uri.clone(), options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(conn)
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.current()
            .map(|conn| conn.status().connected())
            .unwrap_or(false)
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let conn = self.current()?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(AmqpChannel::new(channel, conn)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn reconnect(&self) -> Result<(), AmqpError> {
        let old = self.current()?;
        if old.status().connected() {
            if let Err(err) = old.close(REPLY_SUCCESS, "reconnecting").await {
                warn!(error = err.to_string(), "failure to close connection before reconnect");
            }
        }

        let fresh = Arc::new(dial(&self.uri, &self.name).await?);
        let mut inner = self.inner.write().map_err(|_| AmqpError::InternalError)?;
        *inner = fresh;

        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let conn = self.current()?;
        if !conn.status().connected() {
            return Ok(());
        }

        conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close connection");
            AmqpError::ChannelClosed(err.to_string())
        })
    }
}

/// A lapin channel plus the merged delivery streams of its subscriptions.
pub struct AmqpChannel {
    channel: Channel,
    connection: Arc<Connection>,
    deliveries: tokio::sync::Mutex<SelectAll<DeliveryStream>>,
    consumers: Mutex<HashSet<String>>,
}

impl AmqpChannel {
    fn new(channel: Channel, connection: Arc<Connection>) -> Self {
        AmqpChannel {
            channel,
            connection,
            deliveries: tokio::sync::Mutex::new(SelectAll::new()),
            consumers: Mutex::new(HashSet::new()),
        }
    }

    fn forget_consumer(&self, consumer_tag: &str) {
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.remove(consumer_tag);
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> Option<u16> {
        self.channel
            .status()
            .connected()
            .then(|| self.channel.id())
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                to_field_table(&def.arguments),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange = def.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError> {
        // a failed passive declare closes the channel it ran on
        let scratch = self.connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the scratch channel");
            AmqpError::ChannelError
        })?;

        let result = scratch
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        let check = ExchangeCheck::of(&result);
        if check != ExchangeCheck::Missing {
            if let Err(err) = scratch.close(REPLY_SUCCESS, "OK").await {
                debug!(error = err.to_string(), "failure to close scratch channel");
            }
        }

        match (check, result) {
            (ExchangeCheck::Exists, _) => Ok(true),
            (ExchangeCheck::Missing, _) => Ok(false),
            (_, result) => {
                if let Err(err) = result {
                    error!(
                        error = err.to_string(),
                        exchange = name,
                        "error to check the exchange"
                    );
                }
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                to_field_table(&def.arguments),
            )
            .await
        {
            Ok(queue) => Ok(queue.name().as_str().to_owned()),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
        }
    }

    async fn bind(&self, binding: &BindingDefinition) -> Result<(), AmqpError> {
        let result = match &binding.destination {
            BindingTarget::Queue(queue) => {
                self.channel
                    .queue_bind(
                        queue,
                        &binding.exchange,
                        &binding.routing_key,
                        QueueBindOptions::default(),
                        to_field_table(&binding.arguments),
                    )
                    .await
            }
            BindingTarget::Exchange(destination) => {
                self.channel
                    .exchange_bind(
                        destination,
                        &binding.exchange,
                        &binding.routing_key,
                        ExchangeBindOptions::default(),
                        to_field_table(&binding.arguments),
                    )
                    .await
            }
        };

        result.map_err(|err| {
            error!(error = err.to_string(), "error to bind to exchange");
            AmqpError::BindingError(
                binding.destination.name().to_owned(),
                binding.exchange.clone(),
            )
        })
    }

    async fn basic_qos(&self, qos: &QosOptions) -> Result<(), AmqpError> {
        if qos.prefetch_size > 0 {
            debug!(
                prefetch_size = qos.prefetch_size,
                "prefetch size is not supported by the broker and is ignored"
            );
        }

        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                to_basic_properties(&envelope.properties, &envelope.headers),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(), AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        let tag = consumer_tag.to_owned();
        let stream = consumer.map(move |result| (tag.clone(), result)).boxed();
        self.deliveries.lock().await.push(stream);

        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.insert(consumer_tag.to_owned());
        }

        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let known = self
            .consumers
            .lock()
            .map(|consumers| consumers.contains(consumer_tag))
            .unwrap_or(false);
        if !known {
            return Ok(());
        }

        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })?;
        self.forget_consumer(consumer_tag);

        Ok(())
    }

    fn is_consuming(&self) -> bool {
        let subscribed = self
            .consumers
            .lock()
            .map(|consumers| !consumers.is_empty())
            .unwrap_or(false);

        subscribed && self.channel.status().connected()
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<Delivery, AmqpError> {
        let mut deliveries = self.deliveries.lock().await;

        let next = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, deliveries.next())
                .await
                .map_err(|_| AmqpError::IdleTimeout)?,
            None => deliveries.next().await,
        };

        match next {
            Some((consumer_tag, Ok(delivery))) => Ok(from_lapin_delivery(consumer_tag, delivery)),
            Some((consumer_tag, Err(err))) => {
                error!(error = err.to_string(), consumer_tag, "errors consume msg");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
            None => Err(AmqpError::ChannelClosed(
                "no active subscription on the channel".to_owned(),
            )),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), requeue, "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.clear();
        }
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelClosed(err.to_string()))
    }
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => match i32::try_from(*v) {
            Ok(small) => AMQPValue::LongInt(small),
            Err(_) => AMQPValue::LongLongInt(*v),
        },
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
    }
}

/// Result of a passive exchange declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeCheck {
    Exists,
    /// The broker answered NOT_FOUND and closed the channel
    Missing,
    Failed,
}

impl ExchangeCheck {
    fn of(result: &Result<(), lapin::Error>) -> Self {
        match result {
            Ok(()) => ExchangeCheck::Exists,
            Err(lapin::Error::ProtocolError(err))
                if matches!(err.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
            {
                ExchangeCheck::Missing
            }
            Err(_) => ExchangeCheck::Failed,
        }
    }
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    let value = match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Timestamp(v) => HeaderValue::Int(i64::try_from(*v).ok()?),
        AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::ShortString(v) => HeaderValue::Str(v.as_str().to_owned()),
        AMQPValue::LongString(v) => {
            HeaderValue::Str(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        _ => return None,
    };

    Some(value)
}

fn to_field_table(values: &BTreeMap<String, HeaderValue>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = values
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), to_amqp_value(value)))
        .collect();

    FieldTable::from(table)
}

fn short(value: &Option<String>) -> Option<ShortString> {
    value.as_ref().map(|v| ShortString::from(v.clone()))
}

fn to_basic_properties(props: &MessageProperties, headers: &Headers) -> BasicProperties {
    let mut out = BasicProperties::default();

    if let Some(v) = short(&props.content_type) {
        out = out.with_content_type(v);
    }
    if let Some(v) = short(&props.content_encoding) {
        out = out.with_content_encoding(v);
    }
    if let Some(v) = props.delivery_mode {
        out = out.with_delivery_mode(v);
    }
    if let Some(v) = props.priority {
        out = out.with_priority(v);
    }
    if let Some(v) = short(&props.correlation_id) {
        out = out.with_correlation_id(v);
    }
    if let Some(v) = short(&props.reply_to) {
        out = out.with_reply_to(v);
    }
    if let Some(v) = short(&props.expiration) {
        out = out.with_expiration(v);
    }
    if let Some(v) = short(&props.message_id) {
        out = out.with_message_id(v);
    }
    if let Some(v) = short(&props.kind) {
        out = out.with_kind(v);
    }
    if let Some(v) = short(&props.app_id) {
        out = out.with_app_id(v);
    }
    if !headers.is_empty() {
        out = out.with_headers(to_field_table(headers));
    }

    out
}

fn owned(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|v| v.as_str().to_owned())
}

fn from_lapin_delivery(consumer_tag: String, delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;

    let headers: Headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    from_amqp_value(value).map(|v| (key.as_str().to_owned(), v))
                })
                .collect()
        })
        .unwrap_or_default();

    let properties = MessageProperties {
        content_type: owned(props.content_type()),
        content_encoding: owned(props.content_encoding()),
        delivery_mode: *props.delivery_mode(),
        priority: *props.priority(),
        correlation_id: owned(props.correlation_id()),
        reply_to: owned(props.reply_to()),
        expiration: owned(props.expiration()),
        message_id: owned(props.message_id()),
        kind: owned(props.kind()),
        app_id: owned(props.app_id()),
    };

    Delivery {
        consumer_tag,
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        envelope: Envelope {
            body: delivery.data,
            properties,
            headers,
        },
    }
}
