// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Runtime Configuration
//!
//! Connection settings for the broker and the per-instance options that the
//! configuration layer hands to producers and consumers. Option structs
//! carry the documented defaults and builder methods; nothing here talks to
//! the broker.

use crate::{
    codec::{json_deserializer, json_serializer, Deserializer, Serializer},
    errors::AmqpError,
    message::DELIVERY_MODE_PERSISTENT,
};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::{env, time::Duration};

/// Default content type of published messages
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";
/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Reported to the broker as the connection name
    pub app_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            app_name: "amqp-runtime".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Reads `RABBITMQ_*` variables (and `APP_NAME`), loading a `.env` file
    /// first when one is present. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, AmqpError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfigs::default();

        if let Some(host) = lookup("RABBITMQ_HOST") {
            cfg.host = host;
        }
        if let Some(port) = lookup("RABBITMQ_PORT") {
            cfg.port = port.parse().map_err(|_| {
                AmqpError::ConfigurationError(format!("RABBITMQ_PORT `{}` is not a port", port))
            })?;
        }
        if let Some(user) = lookup("RABBITMQ_USER") {
            cfg.user = user;
        }
        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            cfg.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            cfg.vhost = vhost;
        }
        if let Some(name) = lookup("APP_NAME") {
            cfg.app_name = name;
        }

        Ok(cfg)
    }

    /// Builds the broker URI for these settings.
    ///
    /// Credentials and vhost are kept as structured fields, so reserved
    /// characters in them never reach a URI parser.
    ///
    /// # Returns
    /// The `AMQPUri` handed to the lapin connection
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..Default::default()
        }
    }
}

/// Quality of service limits applied to a consumer's channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QosOptions {
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global: bool,
}

/// Per-instance producer options.
#[derive(Clone)]
pub struct ProducerOptions {
    pub name: String,
    pub content_type: String,
    pub delivery_mode: u8,
    /// Check that the target exchange exists before every publish
    pub safe: bool,
    pub serializer: Serializer,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions {
            name: "unnamed".to_owned(),
            content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            delivery_mode: DELIVERY_MODE_PERSISTENT,
            safe: true,
            serializer: json_serializer(),
        }
    }
}

impl ProducerOptions {
    pub fn new(name: &str) -> Self {
        ProducerOptions {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn delivery_mode(mut self, mode: u8) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Checks that the target exchange exists before every publish.
    ///
    /// # Parameters
    /// * `safe` - Whether to run the check
    pub fn safe(mut self, safe: bool) -> Self {
        self.safe = safe;
        self
    }

    pub fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }
}

/// Whether a consumer listens to process signals while consuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalHandling {
    Enabled,
    #[default]
    Disabled,
}

/// Per-instance consumer options.
#[derive(Clone)]
pub struct ConsumerOptions {
    pub name: String,
    pub qos: Option<QosOptions>,
    /// `None` waits for deliveries forever
    pub idle_timeout: Option<Duration>,
    /// Returned by the loop instead of an error when the idle timeout fires
    pub idle_timeout_exit_code: Option<i32>,
    /// Keep consuming when a handler fails
    pub proceed_on_exception: bool,
    /// Stop after this many messages; 0 means unlimited
    pub messages_limit: u64,
    /// Stop once the process uses this many bytes; 0 means unlimited
    pub memory_limit: u64,
    pub signals: SignalHandling,
    pub deserializer: Deserializer,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            name: "unnamed".to_owned(),
            qos: None,
            idle_timeout: None,
            idle_timeout_exit_code: None,
            proceed_on_exception: true,
            messages_limit: 0,
            memory_limit: 0,
            signals: SignalHandling::Disabled,
            deserializer: json_deserializer(),
        }
    }
}

impl ConsumerOptions {
    pub fn new(name: &str) -> Self {
        ConsumerOptions {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Applies `basic.qos` limits to the consumer's channel.
    ///
    /// # Parameters
    /// * `qos` - Prefetch limits
    ///
    /// # Returns
    /// Self for method chaining
    pub fn qos(mut self, qos: QosOptions) -> Self {
        self.qos = Some(qos);
        self
    }

    /// Gives up waiting after `timeout` without a delivery.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Makes an idle timeout a normal exit carrying `code`.
    ///
    /// # Parameters
    /// * `code` - Exit code reported by [`crate::consumer::ConsumeExit::code`]
    pub fn idle_timeout_exit_code(mut self, code: i32) -> Self {
        self.idle_timeout_exit_code = Some(code);
        self
    }

    pub fn proceed_on_exception(mut self, proceed: bool) -> Self {
        self.proceed_on_exception = proceed;
        self
    }

    pub fn messages_limit(mut self, limit: u64) -> Self {
        self.messages_limit = limit;
        self
    }

    /// Stops the loop once resident memory reaches `bytes`.
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn signals(mut self, signals: SignalHandling) -> Self {
        self.signals = signals;
        self
    }

    pub fn deserializer(mut self, deserializer: Deserializer) -> Self {
        self.deserializer = deserializer;
        self
    }
}
