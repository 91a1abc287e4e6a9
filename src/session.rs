// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Channel Lifecycle
//!
//! Every runtime object owns one [`Session`]: its broker connection plus at
//! most one channel, created on first use and rebuilt whenever it stops
//! being usable.

use crate::{
    errors::AmqpError,
    transport::{BrokerChannel, BrokerConnection},
};
use std::sync::Arc;
use tracing::debug;

/// A connection together with its lazily opened channel.
pub struct Session {
    connection: Arc<dyn BrokerConnection>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl Session {
    /// Creates a session without opening a channel.
    ///
    /// # Parameters
    /// * `connection` - The broker connection the channel will be opened on
    pub fn new(connection: Arc<dyn BrokerConnection>) -> Self {
        Session {
            connection,
            channel: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Returns the current channel, opening a new one if there is none or the
    /// current one has lost its identity.
    pub async fn get_channel(&mut self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if let Some(channel) = &self.channel {
            if channel.id().is_some() {
                return Ok(channel.clone());
            }
        }

        let channel = self.connection.open_channel().await?;
        self.channel = Some(channel.clone());

        Ok(channel)
    }

    /// Re-establishes the connection unless it is already down.
    ///
    /// The channel built on the old connection is dropped; the next
    /// [`Session::get_channel`] opens a fresh one.
    pub async fn renew(&mut self) -> Result<(), AmqpError> {
        if !self.connection.is_connected() {
            return Ok(());
        }

        self.channel = None;
        self.connection.reconnect().await
    }

    /// Closes the channel, then the connection, ignoring shutdown errors.
    ///
    /// Safe to call any number of times.
    pub async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "ignoring channel close failure");
            }
        }

        if self.connection.is_connected() {
            if let Err(err) = self.connection.close().await {
                debug!(error = err.to_string(), "ignoring connection close failure");
            }
        }
    }
}
