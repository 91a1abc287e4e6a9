// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module provides the consume loop shared by queue consumers and RPC
//! servers. A [`Consumer`] subscribes to every queue its [`Dispatcher`]
//! knows, waits for deliveries and hands each of them to the dispatcher,
//! which runs the handler and settles the message with the broker.
//!
//! The loop stops when:
//! - a stop is requested through [`ConsumerControl`] (or a signal),
//! - the configured number of messages has been consumed,
//! - the process memory reaches the configured ceiling.
//!
//! Both limits use 0 as "unlimited". Each delivery is processed inside an
//! OpenTelemetry consumer span built from the trace context in its headers.

use crate::{
    config::{ConsumerOptions, SignalHandling},
    control::{listen_for_signals, ConsumerControl},
    dispatcher::{DispatchOutcome, Dispatcher, HandlerDispatcher},
    errors::AmqpError,
    handler::ConsumerMessage,
    memory::{MemoryProbe, ProcessMemory},
    message::Delivery,
    otel::{self, CONSUMER_TRACER},
    session::Session,
    topology::Topology,
    transport::{BrokerChannel, BrokerConnection},
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Exit code of a consumer that stopped on its own terms
pub const NORMAL_EXIT_CODE: i32 = 0;

/// How a consume loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeExit {
    /// Stop requested or a limit was reached
    Normal,
    /// No delivery within the idle timeout; carries the configured exit code
    IdleTimeout(i32),
}

impl ConsumeExit {
    pub fn code(&self) -> i32 {
        match self {
            ConsumeExit::Normal => NORMAL_EXIT_CODE,
            ConsumeExit::IdleTimeout(code) => *code,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumerState {
    #[default]
    Idle,
    Declaring,
    Consuming,
    Draining,
    Stopped,
}

/// Inbound role shared by queue consumers and RPC servers.
#[async_trait]
pub trait Subscriber: Send {
    /// Subscribes and processes deliveries until a stop condition fires.
    async fn consume(&mut self) -> Result<ConsumeExit, AmqpError>;

    /// Cancels every subscription. Calling it again has no effect.
    async fn stop_consuming(&mut self) -> Result<(), AmqpError>;

    /// Stops for good: later loops exit before waiting for deliveries.
    async fn stop_daemon(&mut self) -> Result<(), AmqpError>;

    /// Cancels the subscriptions, renews the connection and subscribes again.
    async fn restart_daemon(&mut self) -> Result<(), AmqpError>;

    /// Messages consumed since the last setup.
    fn consumed(&self) -> u64;
}

/// Fire-and-forget consumer.
pub type QueueConsumer = Consumer<HandlerDispatcher>;

enum LoopEvent {
    Stop,
    Restart,
    Delivery(Result<Delivery, AmqpError>),
}

pub struct Consumer<D: Dispatcher> {
    session: Session,
    topology: Arc<dyn Topology>,
    options: ConsumerOptions,
    auto_declare: bool,
    dispatcher: D,
    control: ConsumerControl,
    memory: Arc<dyn MemoryProbe>,
    tracer: BoxedTracer,
    state: ConsumerState,
    /// Consumer tag to queue name, for the current subscriptions
    queues_by_tag: HashMap<String, String>,
    consumed: u64,
    force_stop: bool,
}

impl<D: Dispatcher> Consumer<D> {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        topology: Arc<dyn Topology>,
        options: ConsumerOptions,
        auto_declare: bool,
        dispatcher: D,
    ) -> Self {
        Consumer {
            session: Session::new(connection),
            topology,
            options,
            auto_declare,
            dispatcher,
            control: ConsumerControl::new(),
            memory: Arc::new(ProcessMemory::new()),
            tracer: global::tracer(CONSUMER_TRACER),
            state: ConsumerState::Idle,
            queues_by_tag: HashMap::new(),
            consumed: 0,
            force_stop: false,
        }
    }

    /// Replaces the probe used to enforce the memory limit.
    pub fn with_memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    /// A handle to stop or restart the loop from another task.
    pub fn control(&self) -> ConsumerControl {
        self.control.clone()
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub async fn close(&mut self) {
        self.session.close().await
    }

    async fn setup(&mut self) -> Result<(), AmqpError> {
        let queues = self.dispatcher.queues();
        if queues.is_empty() {
            return Err(AmqpError::ConfigurationError(format!(
                "consumer `{}` has no handler",
                self.options.name
            )));
        }
        if queues.iter().any(String::is_empty) {
            return Err(AmqpError::ConfigurationError(format!(
                "consumer `{}` has a handler without queue name",
                self.options.name
            )));
        }

        self.state = ConsumerState::Declaring;
        self.consumed = 0;
        self.queues_by_tag.clear();

        let channel = self.session.get_channel().await?;

        if self.auto_declare {
            self.topology.declare_all(channel.as_ref()).await?;
        }

        if let Some(qos) = &self.options.qos {
            channel.basic_qos(qos).await?;
        }

        let run_id = Uuid::new_v4().simple().to_string();
        for queue in queues {
            let consumer_tag = format!("{}-{}-{}", queue, self.options.name, run_id);
            channel.basic_consume(&queue, &consumer_tag, false).await?;
            debug!(queue = %queue, consumer_tag = %consumer_tag, "subscribed");
            self.queues_by_tag.insert(consumer_tag, queue);
        }

        self.state = ConsumerState::Consuming;
        info!(
            consumer = %self.options.name,
            subscriptions = self.queues_by_tag.len(),
            "consumer started"
        );

        Ok(())
    }

    async fn run(&mut self) -> Result<ConsumeExit, AmqpError> {
        self.setup().await?;

        loop {
            let channel = self.session.get_channel().await?;
            if !channel.is_consuming() {
                break;
            }

            if self.maybe_stop_consumer().await? {
                break;
            }

            let control = self.control.clone();
            let idle_timeout = self.options.idle_timeout;
            let event = tokio::select! {
                biased;
                _ = control.stopped() => LoopEvent::Stop,
                _ = control.restart_requested() => LoopEvent::Restart,
                delivery = channel.wait(idle_timeout) => LoopEvent::Delivery(delivery),
            };

            match event {
                LoopEvent::Stop => continue,
                LoopEvent::Restart => self.restart_daemon().await?,
                LoopEvent::Delivery(Ok(delivery)) => {
                    self.on_delivery(channel.as_ref(), delivery).await?
                }
                LoopEvent::Delivery(Err(AmqpError::IdleTimeout)) => {
                    return self.on_idle_timeout().await;
                }
                LoopEvent::Delivery(Err(err)) => {
                    error!(error = err.to_string(), "failure waiting for deliveries");
                    return Err(err);
                }
            }
        }

        self.state = ConsumerState::Stopped;
        Ok(ConsumeExit::Normal)
    }

    /// Stops the subscriptions when a stop condition holds.
    ///
    /// Returns true when the loop must end.
    async fn maybe_stop_consumer(&mut self) -> Result<bool, AmqpError> {
        if self.force_stop || self.control.is_stopped() {
            self.stop_daemon().await?;
            return Ok(true);
        }

        let limit = self.options.messages_limit;
        let reason = if limit > 0 && self.consumed >= limit {
            "messages limit reached"
        } else if self.options.memory_limit > 0
            && self.memory.current_usage() >= self.options.memory_limit
        {
            "memory limit reached"
        } else {
            return Ok(false);
        };

        info!(
            consumer = %self.options.name,
            consumed = self.consumed,
            reason,
            "stopping consumer"
        );
        self.stop_consuming().await?;

        Ok(true)
    }

    async fn on_idle_timeout(&mut self) -> Result<ConsumeExit, AmqpError> {
        let Some(code) = self.options.idle_timeout_exit_code else {
            error!(consumer = %self.options.name, "idle timeout reached");
            return Err(AmqpError::IdleTimeout);
        };

        info!(consumer = %self.options.name, code, "idle timeout reached, exiting");
        if let Err(err) = self.stop_consuming().await {
            warn!(error = err.to_string(), "failed to cancel subscriptions on idle exit");
        }

        Ok(ConsumeExit::IdleTimeout(code))
    }

    async fn on_delivery(
        &mut self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) -> Result<(), AmqpError> {
        let Some(queue) = self.queues_by_tag.get(&delivery.consumer_tag).cloned() else {
            warn!(
                consumer_tag = %delivery.consumer_tag,
                "removing message from queue - reason: unknown consumer tag"
            );
            channel.ack(delivery.delivery_tag).await?;
            return Ok(());
        };

        let (ctx, mut span) = otel::new_span(&delivery.envelope.headers, &self.tracer, &queue);

        debug!(
            queue = %queue,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "received message"
        );

        let mut msg = ConsumerMessage::new(&queue, delivery);
        if msg.envelope().is_serialized() {
            match (self.options.deserializer)(msg.body()) {
                Ok(value) => msg.value = Some(value),
                Err(err) => warn!(error = err.to_string(), "failed to decode message body"),
            }
        }

        let outcome = match self.dispatcher.dispatch(&ctx, channel, &msg).await {
            Ok(outcome) => outcome,
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                return Err(err);
            }
        };

        self.consumed += 1;

        match outcome {
            DispatchOutcome::Handled => span.set_status(Status::Ok),
            DispatchOutcome::HandlerFailed(err) => {
                error!(queue = %queue, error = err.to_string(), "error handling message");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });

                if !self.options.proceed_on_exception {
                    return Err(AmqpError::HandlerError(err.0));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<D: Dispatcher> Subscriber for Consumer<D> {
    async fn consume(&mut self) -> Result<ConsumeExit, AmqpError> {
        let listener = match self.options.signals {
            SignalHandling::Enabled => Some(listen_for_signals(self.control.clone())),
            SignalHandling::Disabled => None,
        };

        let result = self.run().await;

        if let Some(listener) = listener {
            listener.abort();
        }

        result
    }

    async fn stop_consuming(&mut self) -> Result<(), AmqpError> {
        if self.queues_by_tag.is_empty() {
            return Ok(());
        }

        self.state = ConsumerState::Draining;
        let channel = self.session.get_channel().await?;

        // tags whose cancel failed stay tracked so a later stop retries them
        let mut first_err = None;
        let tags: Vec<String> = self.queues_by_tag.keys().cloned().collect();
        for consumer_tag in tags {
            match channel.basic_cancel(&consumer_tag).await {
                Ok(()) => {
                    self.queues_by_tag.remove(&consumer_tag);
                    debug!(consumer_tag = %consumer_tag, "subscription cancelled");
                }
                Err(err) => {
                    warn!(
                        consumer_tag = %consumer_tag,
                        error = err.to_string(),
                        "failed to cancel subscription"
                    );
                    first_err.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_err {
            return Err(err);
        }
        self.state = ConsumerState::Stopped;

        Ok(())
    }

    async fn stop_daemon(&mut self) -> Result<(), AmqpError> {
        self.force_stop = true;
        self.control.stop();
        self.stop_consuming().await?;

        info!(consumer = %self.options.name, "consumer daemon terminated");
        Ok(())
    }

    async fn restart_daemon(&mut self) -> Result<(), AmqpError> {
        self.stop_consuming().await?;
        self.session.renew().await?;
        self.setup().await?;

        info!(consumer = %self.options.name, "consumer daemon restarted");
        Ok(())
    }

    fn consumed(&self) -> u64 {
        self.consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::QosOptions,
        handler::{FnHandler, HandlerError, HandlerOutcome},
        queue::QueueDefinition,
        testing::{connection_with, delivery, open_channel},
        topology::AmqpTopology,
        transport::{MockBrokerChannel, MockBrokerConnection},
    };
    use std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Mutex,
        },
        time::Duration,
    };

    enum Step {
        Message(&'static [u8]),
        Stranger,
        Fail(AmqpError),
    }

    /// What the mock broker saw.
    #[derive(Default, Clone)]
    struct Broker {
        tags: Arc<Mutex<Vec<String>>>,
        cancelled: Arc<Mutex<Vec<String>>>,
        acked: Arc<Mutex<Vec<u64>>>,
    }

    /// Serves `script` to the latest subscription, then reports the channel closed.
    fn broker(channel: &mut MockBrokerChannel, script: Vec<Step>) -> Broker {
        let broker = Broker::default();
        channel.expect_is_consuming().return_const(true);

        let tags = broker.tags.clone();
        channel
            .expect_basic_consume()
            .withf(|_, _, no_ack| !*no_ack)
            .returning(move |_, tag, _| {
                tags.lock().unwrap().push(tag.to_owned());
                Ok(())
            });

        let cancelled = broker.cancelled.clone();
        channel.expect_basic_cancel().returning(move |tag| {
            cancelled.lock().unwrap().push(tag.to_owned());
            Ok(())
        });

        let acked = broker.acked.clone();
        channel.expect_ack().returning(move |tag| {
            acked.lock().unwrap().push(tag);
            Ok(())
        });

        let tags = broker.tags.clone();
        let mut script = script.into_iter();
        let mut delivery_tag = 0;
        channel.expect_wait().returning(move |_| {
            delivery_tag += 1;
            let current = tags.lock().unwrap().last().cloned().unwrap_or_default();
            match script.next() {
                Some(Step::Message(body)) => Ok(delivery(&current, delivery_tag, body)),
                Some(Step::Stranger) => Ok(delivery("stranger", delivery_tag, b"?")),
                Some(Step::Fail(err)) => Err(err),
                None => Err(AmqpError::ChannelClosed("script exhausted".to_owned())),
            }
        });

        broker
    }

    fn messages(n: usize) -> Vec<Step> {
        (0..n).map(|_| Step::Message(b"job")).collect()
    }

    fn outcome_handler(outcome: Result<HandlerOutcome, HandlerError>) -> HandlerDispatcher {
        HandlerDispatcher::new().register(
            "jobs",
            Arc::new(FnHandler(
                move |_: &ConsumerMessage| -> Result<HandlerOutcome, HandlerError> {
                    outcome.clone()
                },
            )),
        )
    }

    fn consumer(channel: MockBrokerChannel, options: ConsumerOptions) -> QueueConsumer {
        Consumer::new(
            connection_with(channel),
            Arc::new(AmqpTopology::new()),
            options,
            false,
            outcome_handler(Ok(HandlerOutcome::Ack)),
        )
        .with_memory_probe(Arc::new(|| 0u64))
    }

    #[tokio::test]
    async fn stops_after_the_messages_limit() {
        let mut channel = open_channel();
        let broker = broker(&mut channel, messages(5));
        let mut consumer = consumer(channel, ConsumerOptions::new("worker").messages_limit(3));

        let exit = consumer.consume().await.unwrap();

        assert_eq!(exit, ConsumeExit::Normal);
        assert_eq!(exit.code(), NORMAL_EXIT_CODE);
        assert_eq!(consumer.consumed(), 3);
        assert_eq!(*broker.acked.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn memory_ceiling_stops_before_next_delivery() {
        let mut channel = open_channel();
        let broker = broker(&mut channel, messages(2));
        let usage = Arc::new(AtomicU64::new(100));
        let current = usage.clone();
        let mut consumer = consumer(channel, ConsumerOptions::new("worker").memory_limit(1_000))
            .with_memory_probe(Arc::new(move || current.load(Ordering::SeqCst)));
        usage.store(5_000, Ordering::SeqCst);

        let exit = consumer.consume().await.unwrap();

        assert_eq!(exit, ConsumeExit::Normal);
        assert_eq!(consumer.consumed(), 0);
        assert!(broker.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_limits_mean_unlimited() {
        let mut channel = open_channel();
        let broker = broker(&mut channel, messages(4));
        let mut consumer = consumer(channel, ConsumerOptions::new("worker"));

        let err = consumer.consume().await.unwrap_err();

        assert!(matches!(err, AmqpError::ChannelClosed(_)));
        assert_eq!(consumer.consumed(), 4);
        assert_eq!(broker.acked.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn idle_timeout_returns_the_configured_code() {
        let mut channel = open_channel();
        let broker = broker(&mut channel, vec![Step::Fail(AmqpError::IdleTimeout)]);
        let options = ConsumerOptions::new("worker")
            .idle_timeout(Duration::from_millis(10))
            .idle_timeout_exit_code(3);
        let mut consumer = consumer(channel, options);

        let exit = consumer.consume().await.unwrap();

        assert_eq!(exit, ConsumeExit::IdleTimeout(3));
        assert_eq!(exit.code(), 3);
        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idle_timeout_without_code_is_an_error() {
        let mut channel = open_channel();
        broker(&mut channel, vec![Step::Fail(AmqpError::IdleTimeout)]);
        let options = ConsumerOptions::new("worker").idle_timeout(Duration::from_millis(10));
        let mut consumer = consumer(channel, options);

        let err = consumer.consume().await.unwrap_err();

        assert_eq!(err, AmqpError::IdleTimeout);
    }

    #[tokio::test]
    async fn handler_failures_are_acked_and_counted() {
        let mut channel = open_channel();
        let broker = broker(&mut channel, messages(3));
        let mut consumer = Consumer::new(
            connection_with(channel),
            Arc::new(AmqpTopology::new()),
            ConsumerOptions::new("worker").messages_limit(2),
            false,
            outcome_handler(Err("boom".into())),
        )
        .with_memory_probe(Arc::new(|| 0u64));

        let exit = consumer.consume().await.unwrap();

        assert_eq!(exit, ConsumeExit::Normal);
        assert_eq!(consumer.consumed(), 2);
        assert_eq!(*broker.acked.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn handler_failure_ends_the_loop_when_not_proceeding() {
        let mut channel = open_channel();
        let broker = broker(&mut channel, messages(3));
        let mut consumer = Consumer::new(
            connection_with(channel),
            Arc::new(AmqpTopology::new()),
            ConsumerOptions::new("worker").proceed_on_exception(false),
            false,
            outcome_handler(Err("boom".into())),
        )
        .with_memory_probe(Arc::new(|| 0u64));

        let err = consumer.consume().await.unwrap_err();

        assert_eq!(err, AmqpError::HandlerError("boom".to_owned()));
        assert_eq!(*broker.acked.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn requeue_outcome_rejects_with_requeue() {
        let mut channel = open_channel();
        channel
            .expect_reject()
            .withf(|_, requeue| *requeue)
            .times(2)
            .returning(|_, _| Ok(()));
        let broker = broker(&mut channel, messages(2));
        let mut consumer = Consumer::new(
            connection_with(channel),
            Arc::new(AmqpTopology::new()),
            ConsumerOptions::new("worker").messages_limit(2),
            false,
            outcome_handler(Ok(HandlerOutcome::Requeue)),
        )
        .with_memory_probe(Arc::new(|| 0u64));

        consumer.consume().await.unwrap();

        assert!(broker.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_consumer_tag_is_acked_and_not_counted() {
        let mut channel = open_channel();
        let broker = broker(
            &mut channel,
            vec![Step::Stranger, Step::Message(b"job")],
        );
        let mut consumer = consumer(channel, ConsumerOptions::new("worker").messages_limit(1));

        consumer.consume().await.unwrap();

        assert_eq!(consumer.consumed(), 1);
        assert_eq!(*broker.acked.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn serialized_bodies_are_decoded_for_handlers() {
        let mut channel = open_channel();
        channel.expect_is_consuming().return_const(true);
        let tags = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = tags.clone();
        channel.expect_basic_consume().returning(move |_, tag, _| {
            sink.lock().unwrap().push(tag.to_owned());
            Ok(())
        });
        channel.expect_basic_cancel().returning(|_| Ok(()));
        channel.expect_ack().returning(|_| Ok(()));
        channel.expect_wait().returning(move |_| {
            let tag = tags.lock().unwrap()[0].clone();
            let mut delivery = delivery(&tag, 1, br#"{"id":7}"#);
            delivery.envelope = delivery
                .envelope
                .with_header(crate::message::SERIALIZED_HEADER, 1);
            Ok(delivery)
        });

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let dispatcher = HandlerDispatcher::new().register(
            "jobs",
            Arc::new(FnHandler(
                move |msg: &ConsumerMessage| -> Result<HandlerOutcome, HandlerError> {
                    *sink.lock().unwrap() = msg.value.clone();
                    Ok(HandlerOutcome::Ack)
                },
            )),
        );
        let mut consumer = Consumer::new(
            connection_with(channel),
            Arc::new(AmqpTopology::new()),
            ConsumerOptions::new("worker").messages_limit(1),
            false,
            dispatcher,
        )
        .with_memory_probe(Arc::new(|| 0u64));

        consumer.consume().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(serde_json::json!({"id": 7})));
    }

    #[tokio::test]
    async fn stopping_twice_cancels_once() {
        let mut channel = open_channel();
        let broker = broker(&mut channel, messages(1));
        let mut consumer = consumer(channel, ConsumerOptions::new("worker").messages_limit(1));

        consumer.consume().await.unwrap();
        consumer.stop_consuming().await.unwrap();
        consumer.stop_daemon().await.unwrap();

        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_request_ends_the_loop() {
        let mut channel = open_channel();
        let broker = broker(&mut channel, messages(3));
        let mut consumer = consumer(channel, ConsumerOptions::new("worker"));
        consumer.control().stop();

        let exit = consumer.consume().await.unwrap();

        assert_eq!(exit, ConsumeExit::Normal);
        assert_eq!(consumer.consumed(), 0);
        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);

        // the stop persists across loops
        consumer.consume().await.unwrap();
        assert_eq!(consumer.consumed(), 0);
    }

    #[tokio::test]
    async fn consumer_tags_are_unique_per_setup() {
        let mut channel = open_channel();
        let broker = broker(&mut channel, messages(1));
        let mut consumer = consumer(channel, ConsumerOptions::new("worker").messages_limit(1));
        consumer.control().restart();

        consumer.consume().await.unwrap();

        let tags = broker.tags.lock().unwrap();
        assert_eq!(tags.len(), 2);
        assert!(tags[0].starts_with("jobs-worker-"));
        assert!(tags[1].starts_with("jobs-worker-"));
        assert_ne!(tags[0], tags[1]);
        assert_eq!(*broker.cancelled.lock().unwrap(), *tags);
        assert_eq!(consumer.consumed(), 1);
    }

    #[tokio::test]
    async fn setup_declares_topology_and_applies_qos() {
        let mut channel = open_channel();
        channel
            .expect_queue_declare()
            .times(1)
            .returning(|def| Ok(def.name.clone()));
        channel
            .expect_basic_qos()
            .withf(|qos| qos.prefetch_count == 10)
            .times(1)
            .returning(|_| Ok(()));
        broker(&mut channel, messages(1));
        let mut consumer = Consumer::new(
            connection_with(channel),
            Arc::new(AmqpTopology::new().queue(QueueDefinition::new("jobs").durable())),
            ConsumerOptions::new("worker")
                .messages_limit(1)
                .qos(QosOptions {
                    prefetch_count: 10,
                    ..Default::default()
                }),
            true,
            outcome_handler(Ok(HandlerOutcome::Ack)),
        )
        .with_memory_probe(Arc::new(|| 0u64));

        consumer.consume().await.unwrap();
    }

    #[tokio::test]
    async fn failed_cancel_is_retried_by_the_next_stop() {
        let mut channel = open_channel();
        channel.expect_is_consuming().return_const(true);
        channel.expect_basic_consume().returning(|_, _, _| Ok(()));
        let cancelled = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = cancelled.clone();
        let mut calls = 0;
        channel.expect_basic_cancel().returning(move |tag| {
            calls += 1;
            if calls == 1 {
                return Err(AmqpError::CancelConsumerError(tag.to_owned()));
            }
            sink.lock().unwrap().push(tag.to_owned());
            Ok(())
        });
        let handler = |_: &ConsumerMessage| -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Ack)
        };
        let dispatcher = HandlerDispatcher::new()
            .register("audit", Arc::new(FnHandler(handler)))
            .register("jobs", Arc::new(FnHandler(handler)));
        let mut consumer = Consumer::new(
            connection_with(channel),
            Arc::new(AmqpTopology::new()),
            ConsumerOptions::new("worker"),
            false,
            dispatcher,
        )
        .with_memory_probe(Arc::new(|| 0u64));
        consumer.setup().await.unwrap();

        let first = consumer.stop_consuming().await;

        assert!(matches!(first, Err(AmqpError::CancelConsumerError(_))));
        assert_eq!(consumer.state(), ConsumerState::Draining);
        assert_eq!(cancelled.lock().unwrap().len(), 1);

        consumer.stop_consuming().await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        let cancelled = cancelled.lock().unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.iter().any(|tag| tag.starts_with("audit-worker-")));
        assert!(cancelled.iter().any(|tag| tag.starts_with("jobs-worker-")));
    }

    #[tokio::test]
    async fn missing_handlers_fail_before_touching_the_broker() {
        let mut consumer = Consumer::new(
            Arc::new(MockBrokerConnection::new()),
            Arc::new(AmqpTopology::new()),
            ConsumerOptions::new("worker"),
            true,
            HandlerDispatcher::new(),
        );

        let err = consumer.consume().await.unwrap_err();

        assert!(matches!(err, AmqpError::ConfigurationError(_)));
        assert_eq!(consumer.state(), ConsumerState::Idle);
    }
}
