// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! The `ConnectionManager` owns the broker connection and one monitored
//! channel. A background monitor waits for the channel's close or cancel
//! notifications; when the broker takes the channel away, the manager tears
//! down the dead resources, establishes new ones and runs every registered
//! reconnect callback, in registration order, before it reports itself
//! connected again.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//!                                                        \-> Failed
//! ```

use crate::{
    config::{Config, ReconnectPolicy},
    errors::AmqpError,
    transport::{BrokerChannel, BrokerConnection, ChannelEvent, Transport},
};
use futures_util::{future::BoxFuture, FutureExt};
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// A resumption action run after every successful reconnect.
pub type ReconnectCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The connection was lost and could not be rebuilt. Terminal.
    Failed(String),
}

#[derive(Clone)]
struct Live {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Owns the broker connection, its monitored channel and the reconnect callbacks.
pub struct ConnectionManager {
    config: Config,
    transport: Arc<dyn Transport>,
    live: RwLock<Option<Live>>,
    listeners: Mutex<Vec<ReconnectCallback>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Creates a disconnected manager. Call [`ConnectionManager::connect`] to establish the connection.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Arc<ConnectionManager> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new(ConnectionManager {
            config,
            transport,
            live: RwLock::new(None),
            listeners: Mutex::new(vec![]),
            monitor: Mutex::new(None),
            state,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Registers a callback run after every successful reconnect.
    ///
    /// Callbacks may be registered at any time, including before the first
    /// connect, and are kept for the lifetime of the manager.
    pub fn add_reconnect_event<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: ReconnectCallback = Arc::new(move || callback().boxed());
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Opens the connection and the monitored channel.
    ///
    /// A failure here is fatal for the caller: nothing is retained and the
    /// manager stays disconnected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.current().is_some() {
            debug!("amqp connection already established");
            return Ok(());
        }

        self.state.send_replace(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                self.state.send_replace(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Returns the monitored channel of the live connection.
    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.current()
            .map(|live| live.channel)
            .ok_or(AmqpError::NotConnected)
    }

    /// Opens a new channel on the live connection.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let live = self.current().ok_or(AmqpError::NotConnected)?;
        live.connection.open_channel().await
    }

    /// Closes the channel and the connection without triggering a reconnect.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = monitor {
            handle.abort();
        }

        let live = self.take_live();
        self.state.send_replace(ConnectionState::Disconnected);

        if let Some(live) = live {
            live.channel.close().await?;
            live.connection.close().await?;
            info!("amqp connection closed");
        }

        Ok(())
    }

    /// Waits until the manager gives up on the connection and returns the reason.
    pub async fn wait_for_failure(&self) -> AmqpError {
        let mut state = self.state.subscribe();

        loop {
            if let ConnectionState::Failed(reason) = state.borrow_and_update().clone() {
                return AmqpError::ReconnectError(reason);
            }

            if state.changed().await.is_err() {
                return AmqpError::InternalError;
            }
        }
    }

    fn current(&self) -> Option<Live> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_live(&self) -> Option<Live> {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn establish(self: &Arc<Self>) -> Result<(), AmqpError> {
        let uri = self.config.uri()?;

        let connection = self.transport.dial(&uri).await.map_err(|err| {
            error!(
                error = err.to_string(),
                host = self.config.host,
                "failure to connect"
            );
            err
        })?;
        info!(host = self.config.host, "new amqp connection was successfully established");

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "failure to create the monitored channel");
                if let Err(err) = connection.close().await {
                    debug!(error = err.to_string(), "failure to close the connection");
                }
                return Err(err);
            }
        };
        info!("new amqp channel was successfully created");

        *self.live.write().unwrap_or_else(PoisonError::into_inner) = Some(Live {
            connection,
            channel: channel.clone(),
        });

        // The previous monitor, if any, has already returned or is the task running this reconnect.
        let handle = tokio::spawn(monitor(Arc::downgrade(self), channel));
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(())
    }

    fn reconnect(self: Arc<Self>, event: ChannelEvent) -> BoxFuture<'static, ()> {
        async move {
            self.state.send_replace(ConnectionState::Reconnecting);
            if let Some(stale) = self.take_live() {
                if let Err(err) = stale.connection.close().await {
                    debug!(error = err.to_string(), "failure to close the stale connection");
                }
            }

            if self.config.reconnect == ReconnectPolicy::FailFast {
                let reason = format!("connection lost ({:?}), worker must be restarted", event);
                error!(reason, "reconnect disabled");
                self.state.send_replace(ConnectionState::Failed(reason));
                return;
            }

            if let Err(err) = self.establish().await {
                error!(error = err.to_string(), "failure to reconnect");
                self.state
                    .send_replace(ConnectionState::Failed(err.to_string()));
                return;
            }

            let listeners = self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for listener in &listeners {
                listener().await;
            }

            self.state.send_replace(ConnectionState::Connected);
            info!(callbacks = listeners.len(), "amqp connection recovered");
        }
        .boxed()
    }
}

async fn monitor(manager: Weak<ConnectionManager>, channel: Arc<dyn BrokerChannel>) {
    let event = channel.closed().await;

    if !event.requires_reconnect() {
        debug!(event = ?event, "monitored channel closed by client");
        return;
    }

    warn!(event = ?event, "monitored channel lost - reconnect");
    if let Some(manager) = manager.upgrade() {
        manager.reconnect(event).await;
    }
}
