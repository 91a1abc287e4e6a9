// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing mechanism of the broker: they decide which
//! queues receive a published message. This module defines the exchange
//! types and a builder for exchange declarations.

use crate::message::{Arguments, HeaderValue};
use serde::Deserialize;

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_ARGS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in the broker.
///
/// - Direct: routes on an exact match of the routing key
/// - Fanout: broadcasts to all bound queues
/// - Topic: routes on wildcard patterns of the routing key
/// - Headers: routes on header values instead of the routing key
/// - XMessageDelayed: delayed delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of an exchange with its declaration parameters.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) kind: ExchangeKind,
    #[serde(rename = "auto_delete")]
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) arguments: Arguments,
}

impl ExchangeDefinition {
    /// Creates a new direct, non-durable exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Sets the exchange type to Fanout.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Sets the exchange type to Topic.
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin on the broker.
    pub fn direct_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.arguments.insert(
            AMQP_ARGS_DELAYED_EXCHANGE_TYPE.to_owned(),
            HeaderValue::from("direct"),
        );
        self
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin on the broker.
    pub fn fanout_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.arguments.insert(
            AMQP_ARGS_DELAYED_EXCHANGE_TYPE.to_owned(),
            HeaderValue::from("fanout"),
        );
        self
    }

    /// Replaces all declaration arguments.
    ///
    /// # Parameters
    /// * `arguments` - Arguments sent with the declare
    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    /// Adds a single declaration argument.
    ///
    /// # Parameters
    /// * `key` - The argument name, e.g. `alternate-exchange`
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Checks for existence instead of creating the exchange.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Declares without waiting for the broker's confirmation.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_exchange_carries_its_underlying_type() {
        let def = ExchangeDefinition::new("events").fanout_delayed().durable();

        assert_eq!(def.kind, ExchangeKind::XMessageDelayed);
        assert_eq!(
            def.arguments.get(AMQP_ARGS_DELAYED_EXCHANGE_TYPE),
            Some(&HeaderValue::from("fanout"))
        );
        assert!(def.durable);
    }

    #[test]
    fn deserializes_from_configuration() {
        let def: ExchangeDefinition = serde_json::from_str(
            r#"{"name": "orders", "type": "topic", "durable": true, "arguments": {"alternate-exchange": "ae"}}"#,
        )
        .unwrap();

        assert_eq!(def.name(), "orders");
        assert_eq!(def.kind, ExchangeKind::Topic);
        assert!(def.durable);
        assert!(!def.delete);
        assert_eq!(def.arguments.len(), 1);
    }
}
