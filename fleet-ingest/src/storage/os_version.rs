use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{DeviceId, IngestEvent, coerce};
use sqlx::sqlite::SqliteConnection;
use tracing::info;

use super::provider::{ConnectionProvider, Handle};
use super::{Applied, SignalStore, StoreError, StoreKind};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OsVersionRecord {
    pub id: i64,
    pub os_version: String,
    pub ts_epoch: i64,
    pub ts_datetime: String,
}

/// Last reported operating system version per device.
pub struct OsVersionStore {
    handle: Handle,
}

impl OsVersionStore {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            handle: Handle::new(provider, "device_os_status"),
        }
    }

    pub async fn get(&self, device: DeviceId) -> Result<Option<OsVersionRecord>, StoreError> {
        let mut conn = self.handle.get().await?;
        Ok(select(&mut conn, device).await?)
    }
}

async fn select(
    conn: &mut SqliteConnection,
    device: DeviceId,
) -> Result<Option<OsVersionRecord>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, os_version, ts_epoch, ts_datetime
        FROM device_os_status WHERE device_id = ?
        "#,
    )
    .bind(device.0)
    .fetch_optional(conn)
    .await
}

#[async_trait]
impl SignalStore for OsVersionStore {
    fn kind(&self) -> StoreKind {
        StoreKind::OsVersion
    }

    async fn apply(&self, event: &IngestEvent, device: DeviceId) -> Result<Applied, StoreError> {
        if !event.is_subtype("status") {
            return Ok(Applied::Skipped);
        }
        let Some(version) = event
            .field("device_os_version")
            .and_then(coerce::text)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        else {
            return Ok(Applied::Skipped);
        };

        let time = event.time_or_now();
        let mut conn = self.handle.get().await?;

        let Some(previous) = select(&mut conn, device).await? else {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO device_os_status (device_id, os_version, ts_epoch, ts_datetime)
                VALUES (?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(device.0)
            .bind(&version)
            .bind(time.epoch_seconds)
            .bind(time.at.to_string())
            .fetch_one(&mut *conn)
            .await?;

            info!(%device, os_version = %version, "os version recorded");
            return Ok(Applied::Inserted { id });
        };

        sqlx::query(
            r#"
            UPDATE device_os_status
            SET os_version = ?, ts_epoch = ?, ts_datetime = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ?
            "#,
        )
        .bind(&version)
        .bind(time.epoch_seconds)
        .bind(time.at.to_string())
        .bind(previous.id)
        .execute(&mut *conn)
        .await?;

        if previous.os_version != version {
            info!(
                %device,
                from = %previous.os_version,
                to = %version,
                "os version changed"
            );
        } else {
            info!(%device, os_version = %version, "os version updated");
        }
        Ok(Applied::Updated { id: previous.id })
    }

    async fn close(&self) {
        self.handle.close().await;
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::decode;

    use super::*;
    use crate::storage::DeviceResolver;
    use crate::storage::testing::temp_database;

    fn event(body: &str) -> IngestEvent {
        decode("iot/acme/plant1/line3/status", body.as_bytes(), None, None).unwrap()
    }

    #[tokio::test]
    async fn last_write_wins() {
        let (_file, provider) = temp_database().await;
        let resolver = DeviceResolver::new(provider.clone());
        let store = OsVersionStore::new(provider);

        let first = event(r#"{"serial_number":"SN1","ts":1700000000000,"device_os_version":" Windows 10 "}"#);
        let device = resolver.ensure(&first).await.unwrap().unwrap().device_id;
        assert!(matches!(
            store.apply(&first, device).await.unwrap(),
            Applied::Inserted { .. }
        ));

        let second = event(r#"{"serial_number":"SN1","ts":1700000060000,"device_os_version":"Windows 11 Pro"}"#);
        assert!(matches!(
            store.apply(&second, device).await.unwrap(),
            Applied::Updated { .. }
        ));

        let row = store.get(device).await.unwrap().unwrap();
        assert_eq!(row.os_version, "Windows 11 Pro");
        assert_eq!(row.ts_epoch, 1_700_000_060);
        assert_eq!(row.ts_datetime, "2023-11-14T22:14:20Z");
    }

    #[tokio::test]
    async fn absent_or_blank_version_keeps_existing_row() {
        let (_file, provider) = temp_database().await;
        let resolver = DeviceResolver::new(provider.clone());
        let store = OsVersionStore::new(provider);

        let seed = event(r#"{"serial_number":"SN1","device_os_version":"Windows 11 Pro"}"#);
        let device = resolver.ensure(&seed).await.unwrap().unwrap().device_id;
        store.apply(&seed, device).await.unwrap();

        for body in [
            r#"{"serial_number":"SN1","device_status":"online"}"#,
            r#"{"serial_number":"SN1","device_os_version":"   "}"#,
            r#"{"serial_number":"SN1","device_os_version":null}"#,
        ] {
            assert_eq!(store.apply(&event(body), device).await.unwrap(), Applied::Skipped);
        }

        let row = store.get(device).await.unwrap().unwrap();
        assert_eq!(row.os_version, "Windows 11 Pro");
    }
}
