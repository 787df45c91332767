use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{DeviceId, IngestEvent, decode};
use tracing::{debug, error, info, warn};

use crate::broker::{InboundMessage, MessageHandler};
use crate::storage::{
    Applied, ConnectionProvider, DeviceResolver, FailureKind, OsVersionStore, ResolvedDevice,
    SignalStore, StatisticsStore, StatusStore, StorageStore, StoreError, StoreKind,
};

/// What happened to one event on its way through the stores.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub device: Option<ResolvedDevice>,
    pub applied: Vec<(StoreKind, Applied)>,
    pub failures: Vec<(StoreKind, FailureKind)>,
}

impl IngestReport {
    pub fn outcome(&self, store: StoreKind) -> Option<Applied> {
        self.applied
            .iter()
            .find(|(kind, _)| *kind == store)
            .map(|(_, applied)| *applied)
    }
}

/// Decode, resolve identity, fan out to every store, log.
pub struct IngestPipeline {
    resolver: Option<DeviceResolver>,
    stores: Vec<Box<dyn SignalStore>>,
}

impl IngestPipeline {
    pub fn new(resolver: Option<DeviceResolver>, stores: Vec<Box<dyn SignalStore>>) -> Self {
        Self { resolver, stores }
    }

    /// No database: events are decoded and logged only.
    pub fn log_only() -> Self {
        Self::new(None, Vec::new())
    }

    /// The resolver plus the four signal stores, each with its own connection.
    pub fn with_database(provider: Arc<dyn ConnectionProvider>) -> Self {
        let stores: Vec<Box<dyn SignalStore>> = vec![
            Box::new(StatusStore::new(provider.clone())),
            Box::new(OsVersionStore::new(provider.clone())),
            Box::new(StorageStore::new(provider.clone())),
            Box::new(StatisticsStore::new(provider.clone())),
        ];
        Self::new(Some(DeviceResolver::new(provider)), stores)
    }

    /// Runs one decoded event through the resolver and every store.
    ///
    /// A failing store never stops the others.
    pub async fn ingest(&self, event: &IngestEvent) -> IngestReport {
        let mut report = IngestReport::default();
        let Some(resolver) = self.resolver.as_ref() else {
            return report;
        };

        let resolved = match resolver.ensure(event).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                debug!(topic = %event.topic(), "no serial number, nothing to store");
                return report;
            }
            Err(e) => {
                report
                    .failures
                    .push((StoreKind::Devices, report_failure(StoreKind::Devices, event, None, &e)));
                return report;
            }
        };

        if resolved.created {
            info!(
                device_id = %resolved.device_id,
                serial = event.serial().unwrap_or_default(),
                customer = %event.customer,
                location = %event.location,
                machine = %event.machine,
                "new device registered"
            );
        }
        report.device = Some(resolved);

        for store in &self.stores {
            match store.apply(event, resolved.device_id).await {
                Ok(applied) => report.applied.push((store.kind(), applied)),
                Err(e) => {
                    let kind = report_failure(store.kind(), event, Some(resolved.device_id), &e);
                    report.failures.push((store.kind(), kind));
                }
            }
        }

        report
    }

    /// Releases every database handle.
    pub async fn close(&self) {
        if let Some(resolver) = &self.resolver {
            resolver.close().await;
        }
        for store in &self.stores {
            store.close().await;
        }
    }
}

/// Logs a store failure at a level chosen by its kind. Processing always continues.
///
/// `device` is `None` when the identity itself could not be resolved.
fn report_failure(
    store: StoreKind,
    event: &IngestEvent,
    device: Option<DeviceId>,
    err: &StoreError,
) -> FailureKind {
    let kind = err.kind();
    let topic = event.topic();
    let serial = event.serial().unwrap_or("?");
    let device = device.map(|d| d.0);

    match kind {
        FailureKind::Connection => {
            warn!(%store, device, %topic, serial, error = %err, "store unavailable, will reconnect on next message")
        }
        FailureKind::Constraint | FailureKind::Query | FailureKind::Corrupt => {
            error!(%store, device, %topic, serial, %kind, error = %err, "store write failed")
        }
    }
    kind
}

#[async_trait]
impl MessageHandler for IngestPipeline {
    async fn handle(&self, message: InboundMessage) {
        let event = match decode(
            &message.topic,
            &message.payload,
            Some(message.qos),
            Some(message.retain),
        ) {
            Ok(event) => event,
            Err(e) => {
                info!(
                    topic = %message.topic,
                    retain = message.retain,
                    qos = message.qos,
                    bytes = message.payload.len(),
                    reason = %e,
                    "[?] unrecognized topic"
                );
                return;
            }
        };

        let report = self.ingest(&event).await;
        if report.failures.is_empty() {
            info!("{}", event.summary());
        } else {
            warn!(failed = report.failures.len(), "{}", event.summary());
        }
    }
}
