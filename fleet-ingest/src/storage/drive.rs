use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{DeviceId, DriveLetter, IngestEvent, coerce};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

use super::provider::{ConnectionProvider, Handle};
use super::{Applied, SignalStore, StoreError, StoreKind};

const TABLE: &str = "device_storage_status";

/// Capacity snapshot of one drive of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveRecord {
    pub drive: DriveLetter,
    pub drive_type: Option<String>,
    pub format: Option<String>,
    pub total_gb: Option<f64>,
    pub free_gb: Option<f64>,
    pub used_gb: Option<f64>,
    pub usage_percent: Option<f64>,
    pub ts_epoch: i64,
    pub ts_datetime: String,
}

/// Drive fields as they arrive in a `storage` packet.
struct DriveReport {
    drive_type: Option<String>,
    format: Option<String>,
    total_gb: Option<f64>,
    free_gb: Option<f64>,
    used_gb: Option<f64>,
    usage_percent: Option<f64>,
}

impl DriveReport {
    fn from_payload(info: &Map<String, Value>) -> Self {
        let number = |name: &str| info.get(name).and_then(coerce::float);
        let text = |name: &str| info.get(name).and_then(coerce::text);

        Self {
            drive_type: text("drive_type"),
            format: text("format"),
            total_gb: number("total_gb"),
            free_gb: number("free_gb"),
            used_gb: number("used_gb"),
            usage_percent: number("used_pct"),
        }
    }
}

/// Per-drive capacity, one row per `(device, drive)`.
pub struct StorageStore {
    handle: Handle,
}

impl StorageStore {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            handle: Handle::new(provider, TABLE),
        }
    }

    /// All drives recorded for a device, ordered by letter.
    pub async fn list(&self, device: DeviceId) -> Result<Vec<DriveRecord>, StoreError> {
        let mut conn = self.handle.get().await?;
        let rows = sqlx::query(
            r#"
            SELECT drive, drive_type, format, total_gb, free_gb, used_gb, usage_percent,
                   ts_epoch, ts_datetime
            FROM device_storage_status
            WHERE device_id = ?
            ORDER BY drive
            "#,
        )
        .bind(device.0)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(map_row).collect()
    }
}

fn map_row(row: &SqliteRow) -> Result<DriveRecord, StoreError> {
    let raw: String = row.try_get("drive")?;
    let drive = DriveLetter::parse(&raw).ok_or_else(|| StoreError::Corrupt {
        table: TABLE,
        detail: format!("invalid drive letter {raw:?}"),
    })?;

    Ok(DriveRecord {
        drive,
        drive_type: row.try_get("drive_type")?,
        format: row.try_get("format")?,
        total_gb: row.try_get("total_gb")?,
        free_gb: row.try_get("free_gb")?,
        used_gb: row.try_get("used_gb")?,
        usage_percent: row.try_get("usage_percent")?,
        ts_epoch: row.try_get("ts_epoch")?,
        ts_datetime: row.try_get("ts_datetime")?,
    })
}

#[async_trait]
impl SignalStore for StorageStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Storage
    }

    async fn apply(&self, event: &IngestEvent, device: DeviceId) -> Result<Applied, StoreError> {
        if !event.is_subtype("storage") {
            return Ok(Applied::Skipped);
        }
        let Some(drives) = event.object_field("storage") else {
            return Ok(Applied::Skipped);
        };

        let time = event.time_or_now();
        let ts_datetime = time.at.to_string();
        let mut conn = self.handle.get().await?;
        let mut processed = 0;

        for (key, info) in drives {
            let Some(drive) = DriveLetter::parse(key) else {
                debug!(%device, drive = %key, "skipping unrecognized drive identifier");
                continue;
            };
            let Some(info) = info.as_object() else {
                debug!(%device, %drive, "skipping drive without an info object");
                continue;
            };
            let report = DriveReport::from_payload(info);

            sqlx::query(
                r#"
                INSERT INTO device_storage_status
                    (device_id, drive, drive_type, format, total_gb, free_gb, used_gb,
                     usage_percent, ts_epoch, ts_datetime)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (device_id, drive) DO UPDATE SET
                    drive_type = excluded.drive_type,
                    format = excluded.format,
                    total_gb = excluded.total_gb,
                    free_gb = excluded.free_gb,
                    used_gb = excluded.used_gb,
                    usage_percent = excluded.usage_percent,
                    ts_epoch = excluded.ts_epoch,
                    ts_datetime = excluded.ts_datetime,
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                "#,
            )
            .bind(device.0)
            .bind(drive.to_string())
            .bind(report.drive_type)
            .bind(report.format)
            .bind(report.total_gb)
            .bind(report.free_gb)
            .bind(report.used_gb)
            .bind(report.usage_percent)
            .bind(time.epoch_seconds)
            .bind(&ts_datetime)
            .execute(&mut *conn)
            .await?;

            processed += 1;
        }

        info!(%device, drives = processed, "storage updated");
        Ok(Applied::Drives { processed })
    }

    async fn close(&self) {
        self.handle.close().await;
    }
}
