// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Broker-independent representation of what goes over the wire: the body,
//! the basic properties and the application headers. Runtime objects build
//! an [`Envelope`] per publish and receive a [`Delivery`] per consumed message.
//! Nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header flag marking a body produced by the producer's serializer
pub const SERIALIZED_HEADER: &str = "rabbitmq.serialized";
/// Header flag marking a zlib compressed body
pub const COMPRESSED_HEADER: &str = "rabbitmq.compressed";

/// Persistent delivery mode
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// Transient delivery mode
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// A scalar value carried in application headers or declaration arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    /// Whether the value reads as a raised flag (`1`, `true`, `"1"`).
    pub fn is_truthy(&self) -> bool {
        match self {
            HeaderValue::Bool(v) => *v,
            HeaderValue::Int(v) => *v != 0,
            HeaderValue::Float(v) => *v != 0.0,
            HeaderValue::Str(v) => !v.is_empty() && v != "0",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(value as i64)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

/// Application headers of a message.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Extra arguments for queue, exchange and binding declarations.
pub type Arguments = BTreeMap<String, HeaderValue>;

/// Returns true when `key` is present in `headers` with a raised flag.
pub fn has_flag(headers: &Headers, key: &str) -> bool {
    headers.get(key).map(HeaderValue::is_truthy).unwrap_or(false)
}

/// Basic properties of a message.
///
/// Every field is optional; `None` means "not set on the wire".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub app_id: Option<String>,
}

impl MessageProperties {
    pub fn with_content_type(mut self, value: &str) -> Self {
        self.content_type = Some(value.to_owned());
        self
    }

    pub fn with_delivery_mode(mut self, value: u8) -> Self {
        self.delivery_mode = Some(value);
        self
    }

    pub fn with_priority(mut self, value: u8) -> Self {
        self.priority = Some(value);
        self
    }

    pub fn with_correlation_id(mut self, value: &str) -> Self {
        self.correlation_id = Some(value.to_owned());
        self
    }

    pub fn with_reply_to(mut self, value: &str) -> Self {
        self.reply_to = Some(value.to_owned());
        self
    }

    pub fn with_expiration(mut self, value: &str) -> Self {
        self.expiration = Some(value.to_owned());
        self
    }

    pub fn with_message_id(mut self, value: &str) -> Self {
        self.message_id = Some(value.to_owned());
        self
    }

    pub fn with_kind(mut self, value: &str) -> Self {
        self.kind = Some(value.to_owned());
        self
    }

    pub fn with_app_id(mut self, value: &str) -> Self {
        self.app_id = Some(value.to_owned());
        self
    }

    /// Overlays `other` on top of `self`; values set in `other` win.
    pub fn merge(self, other: MessageProperties) -> MessageProperties {
        MessageProperties {
            content_type: other.content_type.or(self.content_type),
            content_encoding: other.content_encoding.or(self.content_encoding),
            delivery_mode: other.delivery_mode.or(self.delivery_mode),
            priority: other.priority.or(self.priority),
            correlation_id: other.correlation_id.or(self.correlation_id),
            reply_to: other.reply_to.or(self.reply_to),
            expiration: other.expiration.or(self.expiration),
            message_id: other.message_id.or(self.message_id),
            kind: other.kind.or(self.kind),
            app_id: other.app_id.or(self.app_id),
        }
    }
}

/// A message as published or delivered: body, properties and headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub headers: Headers,
}

impl Envelope {
    pub fn new(body: Vec<u8>) -> Self {
        Envelope {
            body,
            ..Default::default()
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn is_serialized(&self) -> bool {
        has_flag(&self.headers, SERIALIZED_HEADER)
    }

    pub fn is_compressed(&self) -> bool {
        has_flag(&self.headers, COMPRESSED_HEADER)
    }
}

/// A message handed out by the broker to one of the channel's subscriptions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub envelope: Envelope,
}

/// What a producer is asked to send.
///
/// `Bytes` is sent as is. `Value` goes through the producer's serializer and
/// the envelope is flagged with [`SERIALIZED_HEADER`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Value(serde_json::Value),
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Bytes(value.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Bytes(value.into_bytes())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Value(value)
    }
}
