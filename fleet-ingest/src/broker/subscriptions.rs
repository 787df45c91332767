use std::collections::BTreeMap;

use rumqttc::{AsyncClient, QoS, SubscribeFilter};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maps a configured QoS level onto the valid MQTT range.
pub fn clamp_qos(level: i64) -> QoS {
    match level.clamp(0, 2) {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Trims topic filters and drops the empty ones.
pub fn normalize_topics<I, S>(topics: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    topics
        .into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

enum Command {
    Add(Vec<String>, QoS),
    SessionUp(AsyncClient),
    SessionDown,
    Snapshot(oneshot::Sender<Vec<(String, QoS)>>),
}

/// Handle to the task that owns the desired subscription set.
///
/// Both the public subscribe path and the session's reconnect path talk to
/// the owner through a channel, so the set is only ever touched by one task.
#[derive(Clone)]
pub struct Subscriptions {
    tx: mpsc::UnboundedSender<Command>,
}

impl Subscriptions {
    /// Spawns the owning task; it exits when `cancel` fires.
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let owner = Owner {
            desired: BTreeMap::new(),
            client: None,
        };
        tokio::spawn(owner.run(rx, cancel));
        Self { tx }
    }

    /// Adds filters to the desired set, subscribing right away when a session is up.
    pub fn add(&self, topics: Vec<String>, qos: QoS) {
        self.send(Command::Add(topics, qos));
    }

    /// A session was (re)established; everything desired is subscribed on it.
    pub fn session_up(&self, client: AsyncClient) {
        self.send(Command::SessionUp(client));
    }

    pub fn session_down(&self) {
        self.send(Command::SessionDown);
    }

    /// Current desired set, ordered by topic.
    pub async fn snapshot(&self) -> Vec<(String, QoS)> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx));
        rx.await.unwrap_or_default()
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("subscription owner has stopped");
        }
    }
}

struct Owner {
    desired: BTreeMap<String, QoS>,
    client: Option<AsyncClient>,
}

impl Owner {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Add(topics, qos) => {
                    for topic in &topics {
                        self.desired.insert(topic.clone(), qos);
                    }
                    if self.client.is_some() {
                        let filters = topics.into_iter().map(|t| (t, qos)).collect();
                        self.subscribe(filters).await;
                    } else {
                        debug!(count = topics.len(), "subscriptions queued until connected");
                    }
                }
                Command::SessionUp(client) => {
                    self.client = Some(client);
                    let filters: Vec<(String, QoS)> = self
                        .desired
                        .iter()
                        .map(|(topic, qos)| (topic.clone(), *qos))
                        .collect();
                    if !filters.is_empty() {
                        info!(count = filters.len(), "subscribing to desired topics");
                        self.subscribe(filters).await;
                    }
                }
                Command::SessionDown => self.client = None,
                Command::Snapshot(reply) => {
                    let snapshot = self
                        .desired
                        .iter()
                        .map(|(topic, qos)| (topic.clone(), *qos))
                        .collect();
                    let _ = reply.send(snapshot);
                }
            }
        }
    }

    async fn subscribe(&self, filters: Vec<(String, QoS)>) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        if filters.is_empty() {
            return;
        }

        for (topic, qos) in &filters {
            debug!(topic = %topic, qos = ?qos, "subscribing");
        }
        let filters = filters
            .into_iter()
            .map(|(topic, qos)| SubscribeFilter::new(topic, qos));
        if let Err(e) = client.subscribe_many(filters).await {
            warn!(error = %e, "failed to send subscribe request");
        }
    }
}
