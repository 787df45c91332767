pub mod options;
pub mod session;
pub mod subscriptions;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_tls::TlsError;
use rumqttc::{AsyncClient, ConnectReturnCode};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::BrokerConfig;
use session::{Backoff, SessionTask};
use subscriptions::{Subscriptions, clamp_qos, normalize_topics};

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;
/// Messages buffered between the event loop and the handler.
const DELIVERY_CAPACITY: usize = 256;
/// How long shutdown waits for the DISCONNECT to go out.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid TLS settings: {0}")]
    Tls(#[from] TlsError),
    #[error("broker did not acknowledge the connection within {0:?}")]
    Timeout(Duration),
    #[error("broker refused the connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("session ended before the broker acknowledged the connection")]
    Closed,
    #[error("connection manager has been shut down")]
    ShutDown,
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// A PUBLISH as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// Receives every inbound message, in order, on the delivery task.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: InboundMessage);
}

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

/// Tears a half-open session down if `connect` is dropped before it settles.
struct PendingSession<'a> {
    client: AsyncClient,
    cancel: CancellationToken,
    tasks: [AbortHandle; 2],
    state: &'a watch::Sender<SessionState>,
    armed: bool,
}

impl PendingSession<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSession<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("connect abandoned before the broker answered, tearing down session");
        let _ = self.client.try_disconnect();
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
        self.state.send_replace(SessionState::Disconnected);
    }
}

/// Owns the broker session and the desired subscription set.
pub struct ConnectionManager {
    config: BrokerConfig,
    handler: Arc<dyn MessageHandler>,
    subscriptions: Subscriptions,
    state: watch::Sender<SessionState>,
    session: Mutex<Option<Session>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Must be called from within a tokio runtime.
    pub fn new(config: BrokerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(SessionState::Disconnected);

        Self {
            config,
            handler,
            subscriptions: Subscriptions::spawn(cancel.clone()),
            state,
            session: Mutex::new(None),
            cancel,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Adds topic filters to the desired set.
    ///
    /// Filters are subscribed immediately when connected, otherwise on the
    /// next successful connection, and again after every reconnect. Returns
    /// how many non-empty filters were accepted.
    pub fn subscribe<I, S>(&self, topics: I, qos: i64) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics = normalize_topics(topics);
        let count = topics.len();
        if count > 0 {
            self.subscriptions.add(topics, clamp_qos(qos));
        }
        count
    }

    /// Current desired subscription set.
    pub async fn subscriptions(&self) -> Vec<(String, rumqttc::QoS)> {
        self.subscriptions.snapshot().await
    }

    /// Opens the session and waits up to `timeout` for the broker's acknowledgment.
    ///
    /// On failure, or if the returned future is dropped before it completes,
    /// everything that was started is torn down again, so the manager is left
    /// disconnected and `connect` may be retried.
    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    pub async fn connect(&self, timeout: Duration) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::ShutDown);
        }

        let mut slot = self.session.lock().await;
        if slot.is_some() {
            debug!("already connected");
            return Ok(());
        }

        let options = options::mqtt_options(&self.config)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let cancel = self.cancel.child_token();
        let (ack_tx, ack_rx) = oneshot::channel();
        let (deliveries, delivery_rx) = mpsc::channel(DELIVERY_CAPACITY);

        self.state.send_replace(SessionState::Connecting);
        info!(transport = ?self.config.transport, tls = self.config.tls, "connecting to broker");

        let delivery = tokio::spawn(session::deliver(
            delivery_rx,
            self.handler.clone(),
            cancel.clone(),
        ));
        let task = tokio::spawn(
            SessionTask {
                client: client.clone(),
                eventloop,
                subscriptions: self.subscriptions.clone(),
                state: self.state.clone(),
                deliveries,
                first_ack: Some(ack_tx),
                backoff: Backoff::new(
                    Duration::from_secs(self.config.reconnect_min_delay_secs),
                    Duration::from_secs(self.config.reconnect_max_delay_secs),
                ),
                cancel: cancel.clone(),
            }
            .run(),
        );

        let pending = PendingSession {
            client: client.clone(),
            cancel: cancel.clone(),
            tasks: [task.abort_handle(), delivery.abort_handle()],
            state: &self.state,
            armed: true,
        };

        let outcome = match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::Timeout(timeout)),
        };

        match outcome {
            Ok(()) => {
                pending.disarm();
                *slot = Some(Session {
                    client,
                    cancel,
                    task,
                    delivery,
                });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "connect failed, tearing down session");
                let _ = client.try_disconnect();
                cancel.cancel();
                let _ = task.await;
                let _ = delivery.await;
                pending.disarm();
                self.state.send_replace(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Stops accepting messages, disconnects and stops every background task.
    ///
    /// Terminal: the manager cannot be reconnected afterwards. A message
    /// already being handled finishes first.
    pub async fn shutdown(&self) {
        let session = self.session.lock().await.take();

        if let Some(Session {
            client,
            cancel,
            mut task,
            delivery,
        }) = session
        {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "could not queue disconnect");
            }
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                debug!("disconnect not confirmed in time");
                cancel.cancel();
                let _ = task.await;
            }
            cancel.cancel();
            let _ = delivery.await;
        }

        self.cancel.cancel();
        self.state.send_replace(SessionState::Disconnected);
        info!("connection manager shut down");
    }
}
