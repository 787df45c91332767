use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing, Packet};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::subscriptions::Subscriptions;
use super::{InboundMessage, MessageHandler, SessionError, SessionState};

/// Doubling delay between reconnect attempts, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Drives one rumqttc event loop until cancelled.
pub(crate) struct SessionTask {
    pub client: AsyncClient,
    pub eventloop: EventLoop,
    pub subscriptions: Subscriptions,
    pub state: watch::Sender<SessionState>,
    pub deliveries: mpsc::Sender<InboundMessage>,
    /// Resolved on the first CONNACK, or on the first fatal error before it.
    pub first_ack: Option<oneshot::Sender<Result<(), SessionError>>>,
    pub backoff: Backoff,
    pub cancel: CancellationToken,
}

impl SessionTask {
    pub async fn run(mut self) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    self.backoff.reset();
                    self.state.send_replace(SessionState::Connected);
                    info!(session_present = ack.session_present, "connected to broker");
                    self.subscriptions.session_up(self.client.clone());
                    if let Some(first_ack) = self.first_ack.take() {
                        let _ = first_ack.send(Ok(()));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        qos: publish.qos as u8,
                        retain: publish.retain,
                    };
                    if self.deliveries.send(message).await.is_err() {
                        debug!("delivery task has stopped");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    info!(pkid = suback.pkid, codes = ?suback.return_codes, "subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("broker sent disconnect");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("disconnected from broker");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    if !self.on_connection_error(err).await {
                        break;
                    }
                }
            }
        }

        self.subscriptions.session_down();
    }

    /// Returns whether the loop should keep polling.
    async fn on_connection_error(&mut self, err: ConnectionError) -> bool {
        self.subscriptions.session_down();

        if self.first_ack.is_some() {
            if let ConnectionError::ConnectionRefused(code) = err {
                if let Some(first_ack) = self.first_ack.take() {
                    let _ = first_ack.send(Err(SessionError::Refused(code)));
                }
                return false;
            }
            self.state.send_replace(SessionState::Connecting);
        } else {
            self.state.send_replace(SessionState::Reconnecting);
        }

        let delay = self.backoff.next_delay();
        warn!(
            error = %err,
            retry_in_secs = delay.as_secs_f64(),
            "broker connection failed"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Hands each delivered message to the handler, one at a time and in arrival order.
pub(crate) async fn deliver(
    mut rx: mpsc::Receiver<InboundMessage>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        handler.handle(message).await;
    }
    debug!("delivery stopped");
}
