// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Runtime
//!
//! This module provides the error type shared by every runtime object. The
//! `AmqpError` enum covers configuration mistakes, topology declaration
//! failures, transport failures reported by the broker library, idle
//! timeouts, handler failures and payload codec failures.

use thiserror::Error;

/// Represents errors that can occur while publishing or consuming.
///
/// Variants carry plain strings instead of the transport error itself, so
/// callers can compare errors directly in assertions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid runtime configuration, detected before any broker interaction
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel or its connection was closed while in use
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a destination to a source exchange
    #[error("failure to bind `{0}` to exchange `{1}`")]
    BindingError(String, String),

    /// Safe mode found that the target exchange is not declared in the broker
    #[error("exchange `{0}` is not declared in the broker (safe mode is on)")]
    TopologyMissing(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error serializing or deserializing a payload
    #[error("failure to encode payload: {0}")]
    SerializationError(String),

    /// Error compressing or decompressing a payload
    #[error("failure to compress payload: {0}")]
    CompressionError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting or requeuing a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error subscribing a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error receiving a delivery
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// No delivery arrived within the configured idle timeout
    #[error("idle timeout reached while waiting for messages")]
    IdleTimeout,

    /// A handler failed and the consumer is configured to stop on failures
    #[error("handler failure: {0}")]
    HandlerError(String),
}
