// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Control
//!
//! Stop and restart requests for a running consume loop. A [`ConsumerControl`]
//! is cheap to clone; any clone can be handed to another task (or to the
//! signal listener) and used while the loop is blocked waiting for deliveries.

use std::sync::Arc;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ConsumerControl {
    stop: CancellationToken,
    restart: Arc<Notify>,
}

impl ConsumerControl {
    pub fn new() -> Self {
        ConsumerControl::default()
    }

    /// Asks the loop to stop after the delivery in progress.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Asks the loop to renew its connection and subscribe again.
    pub fn restart(&self) {
        self.restart.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once [`ConsumerControl::stop`] has been called.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Resolves on the next [`ConsumerControl::restart`] request.
    pub async fn restart_requested(&self) {
        self.restart.notified().await
    }
}

/// Spawns a task turning process signals into control requests.
///
/// SIGTERM and SIGINT stop the loop, SIGHUP restarts it. The caller aborts
/// the returned handle once the loop is over.
#[cfg(unix)]
pub(crate) fn listen_for_signals(control: ConsumerControl) -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (Ok(mut term), Ok(mut int), Ok(mut hup)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        ) else {
            tracing::error!("failed to install signal handlers");
            return;
        };

        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!(signal = "SIGTERM", "stop requested");
                    control.stop();
                }
                _ = int.recv() => {
                    info!(signal = "SIGINT", "stop requested");
                    control.stop();
                }
                _ = hup.recv() => {
                    info!(signal = "SIGHUP", "restart requested");
                    control.restart();
                }
            }
        }
    })
}

#[cfg(not(unix))]
pub(crate) fn listen_for_signals(control: ConsumerControl) -> JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = "ctrl-c", "stop requested");
            control.stop();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_is_seen_by_every_clone() {
        let control = ConsumerControl::new();
        let other = control.clone();

        other.stop();

        assert!(control.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), control.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn restart_request_is_remembered_until_awaited() {
        let control = ConsumerControl::new();

        control.restart();

        tokio::time::timeout(Duration::from_secs(1), control.restart_requested())
            .await
            .unwrap();
        assert!(!control.is_stopped());
    }
}
