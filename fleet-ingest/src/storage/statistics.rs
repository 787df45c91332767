use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{DeviceId, IngestEvent, coerce};
use serde_json::{Map, Value};
use tracing::info;

use super::provider::{ConnectionProvider, Handle};
use super::{Applied, SignalStore, StoreError, StoreKind};

/// One throughput report. Counters missing from the packet are stored as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct StatisticsRecord {
    pub ts_epoch: i64,
    pub total_items: i64,
    pub no_read: i64,
    pub good_read: i64,
    pub no_dimension: i64,
    pub no_weight: i64,
    pub data_sent: i64,
    pub not_sent: i64,
    pub image_sent: i64,
    pub image_not_sent: i64,
    pub item_out_of_spec: i64,
    pub more_than_1_item: i64,
}

impl StatisticsRecord {
    fn from_payload(ts_epoch: i64, stats: &Map<String, Value>) -> Self {
        let counter = |name: &str| coerce::integer_or_zero(stats.get(name));

        Self {
            ts_epoch,
            total_items: counter("total_items"),
            no_read: counter("no_reads"),
            good_read: counter("good_reads"),
            no_dimension: counter("no_dimensions"),
            no_weight: counter("no_weight"),
            data_sent: counter("sent"),
            not_sent: counter("not_sent"),
            image_sent: counter("image_sent"),
            image_not_sent: counter("image_not_sent"),
            item_out_of_spec: counter("out_of_spec"),
            more_than_1_item: counter("more_than_one_item"),
        }
    }
}

/// Append-only history of statistics packets.
pub struct StatisticsStore {
    handle: Handle,
}

impl StatisticsStore {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            handle: Handle::new(provider, "device_statistics"),
        }
    }

    pub async fn count(&self, device: DeviceId) -> Result<i64, StoreError> {
        let mut conn = self.handle.get().await?;
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM device_statistics WHERE device_id = ?")
            .bind(device.0)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    /// Most recently inserted row for a device.
    pub async fn latest(&self, device: DeviceId) -> Result<Option<StatisticsRecord>, StoreError> {
        let mut conn = self.handle.get().await?;
        let record = sqlx::query_as(
            r#"
            SELECT ts_epoch, total_items, no_read, good_read, no_dimension, no_weight,
                   data_sent, not_sent, image_sent, image_not_sent, item_out_of_spec,
                   more_than_1_item
            FROM device_statistics
            WHERE device_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(device.0)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(record)
    }
}

#[async_trait]
impl SignalStore for StatisticsStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Statistics
    }

    async fn apply(&self, event: &IngestEvent, device: DeviceId) -> Result<Applied, StoreError> {
        if !event.is_subtype("statistics") {
            return Ok(Applied::Skipped);
        }
        let Some(stats) = event.object_field("statistics") else {
            return Ok(Applied::Skipped);
        };

        let time = event.time_or_now();
        let record = StatisticsRecord::from_payload(time.epoch_seconds, stats);
        let mut conn = self.handle.get().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO device_statistics
                (device_id, ts_epoch, ts_datetime, total_items, no_read, good_read,
                 no_dimension, no_weight, data_sent, not_sent, image_sent, image_not_sent,
                 item_out_of_spec, more_than_1_item)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(device.0)
        .bind(record.ts_epoch)
        .bind(time.at.to_string())
        .bind(record.total_items)
        .bind(record.no_read)
        .bind(record.good_read)
        .bind(record.no_dimension)
        .bind(record.no_weight)
        .bind(record.data_sent)
        .bind(record.not_sent)
        .bind(record.image_sent)
        .bind(record.image_not_sent)
        .bind(record.item_out_of_spec)
        .bind(record.more_than_1_item)
        .fetch_one(&mut *conn)
        .await?;

        info!(%device, id, total = record.total_items, "statistics appended");
        Ok(Applied::Inserted { id })
    }

    async fn close(&self) {
        self.handle.close().await;
    }
}
