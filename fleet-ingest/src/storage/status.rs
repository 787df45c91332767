use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{ConnectivityStatus, DeviceId, IngestEvent, coerce};
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info};

use super::provider::{ConnectionProvider, Handle};
use super::{Applied, SignalStore, StoreError, StoreKind};

const TABLE: &str = "device_status";

/// Current connectivity of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub id: i64,
    pub status: ConnectivityStatus,
    pub ts_epoch: i64,
    pub ts_datetime: String,
    /// Set exactly while `status` is offline.
    pub offline_since: Option<String>,
}

/// `offline_since` after a device reports `next` at time `at`.
///
/// The first offline report of a streak sets it; later offline reports keep
/// it; any online report clears it.
pub fn next_offline_since(
    previous: Option<&StatusRecord>,
    next: ConnectivityStatus,
    at: &str,
) -> Option<String> {
    match (next, previous) {
        (ConnectivityStatus::Online, _) => None,
        (
            ConnectivityStatus::Offline,
            Some(StatusRecord {
                status: ConnectivityStatus::Offline,
                offline_since: Some(since),
                ..
            }),
        ) => Some(since.clone()),
        (ConnectivityStatus::Offline, _) => Some(at.to_string()),
    }
}

pub struct StatusStore {
    handle: Handle,
}

impl StatusStore {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            handle: Handle::new(provider, TABLE),
        }
    }

    pub async fn get(&self, device: DeviceId) -> Result<Option<StatusRecord>, StoreError> {
        let mut conn = self.handle.get().await?;
        select(&mut conn, device).await
    }
}

async fn select(
    conn: &mut SqliteConnection,
    device: DeviceId,
) -> Result<Option<StatusRecord>, StoreError> {
    let row: Option<(i64, String, i64, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT id, status, ts_epoch, ts_datetime, offline_since
        FROM device_status WHERE device_id = ?
        "#,
    )
    .bind(device.0)
    .fetch_optional(conn)
    .await?;

    let Some((id, status, ts_epoch, ts_datetime, offline_since)) = row else {
        return Ok(None);
    };
    let status = ConnectivityStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
        table: TABLE,
        detail: format!("unknown status {status:?}"),
    })?;

    Ok(Some(StatusRecord {
        id,
        status,
        ts_epoch,
        ts_datetime,
        offline_since,
    }))
}

#[async_trait]
impl SignalStore for StatusStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Status
    }

    async fn apply(&self, event: &IngestEvent, device: DeviceId) -> Result<Applied, StoreError> {
        if !event.is_subtype("status") {
            return Ok(Applied::Skipped);
        }
        let Some(raw) = event.field("device_status").and_then(coerce::text) else {
            return Ok(Applied::Skipped);
        };
        let Some(status) = ConnectivityStatus::parse(&raw) else {
            debug!(%device, status = %raw, "ignoring unrecognized device status");
            return Ok(Applied::Skipped);
        };

        let time = event.time_or_now();
        let at = time.at.to_string();
        let mut conn = self.handle.get().await?;
        let previous = select(&mut conn, device).await?;
        let offline_since = next_offline_since(previous.as_ref(), status, &at);

        let Some(previous) = previous else {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO device_status (device_id, status, ts_epoch, ts_datetime, offline_since)
                VALUES (?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(device.0)
            .bind(status.as_str())
            .bind(time.epoch_seconds)
            .bind(&at)
            .bind(&offline_since)
            .fetch_one(&mut *conn)
            .await?;

            info!(%device, %status, "device status recorded");
            return Ok(Applied::Inserted { id });
        };

        sqlx::query(
            r#"
            UPDATE device_status
            SET status = ?, ts_epoch = ?, ts_datetime = ?, offline_since = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(time.epoch_seconds)
        .bind(&at)
        .bind(&offline_since)
        .bind(previous.id)
        .execute(&mut *conn)
        .await?;

        if previous.status != status {
            info!(%device, from = %previous.status, to = %status, "device status changed");
        } else {
            debug!(%device, %status, "device status unchanged");
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

    const TOPIC: &str = "iot/acme/plant1/line3/status";

    fn record(status: ConnectivityStatus, offline_since: Option<&str>) -> StatusRecord {
        StatusRecord {
            id: 1,
            status,
            ts_epoch: 0,
            ts_datetime: String::new(),
            offline_since: offline_since.map(str::to_string),
        }
    }

    fn event(body: &str) -> IngestEvent {
        decode(TOPIC, body.as_bytes(), None, None).unwrap()
    }

    #[test]
    fn offline_since_transitions() {
        use ConnectivityStatus::{Offline, Online};

        assert_eq!(next_offline_since(None, Offline, "t1"), Some("t1".into()));
        assert_eq!(next_offline_since(None, Online, "t1"), None);

        let offline = record(Offline, Some("t1"));
        assert_eq!(
            next_offline_since(Some(&offline), Offline, "t2"),
            Some("t1".into())
        );
        assert_eq!(next_offline_since(Some(&offline), Online, "t2"), None);

        let online = record(Online, None);
        assert_eq!(
            next_offline_since(Some(&online), Offline, "t2"),
            Some("t2".into())
        );
        assert_eq!(next_offline_since(Some(&online), Online, "t2"), None);
    }

    #[tokio::test]
    async fn sticky_offline_then_online() {
        let (_file, provider) = temp_database().await;
        let resolver = DeviceResolver::new(provider.clone());
        let store = StatusStore::new(provider);

        let first = event(r#"{"serial_number":"SN1","ts":1700000000000,"device_status":"offline"}"#);
        let device = resolver.ensure(&first).await.unwrap().unwrap().device_id;

        let applied = store.apply(&first, device).await.unwrap();
        assert!(matches!(applied, Applied::Inserted { .. }));

        let second = event(r#"{"serial_number":"SN1","ts":1700000060000,"device_status":"OFFLINE"}"#);
        store.apply(&second, device).await.unwrap();

        let row = store.get(device).await.unwrap().unwrap();
        assert_eq!(row.status, ConnectivityStatus::Offline);
        assert_eq!(row.offline_since.as_deref(), Some("2023-11-14T22:13:20Z"));
        assert_eq!(row.ts_epoch, 1_700_000_060);

        let third = event(r#"{"serial_number":"SN1","ts":1700000120000,"device_status":"online"}"#);
        let applied = store.apply(&third, device).await.unwrap();
        assert!(matches!(applied, Applied::Updated { .. }));

        let row = store.get(device).await.unwrap().unwrap();
        assert_eq!(row.status, ConnectivityStatus::Online);
        assert_eq!(row.offline_since, None);
    }

    #[tokio::test]
    async fn unrecognized_or_missing_status_is_ignored() {
        let (_file, provider) = temp_database().await;
        let resolver = DeviceResolver::new(provider.clone());
        let store = StatusStore::new(provider);

        let seed = event(r#"{"serial_number":"SN1","ts":1700000000000,"device_status":"online"}"#);
        let device = resolver.ensure(&seed).await.unwrap().unwrap().device_id;
        store.apply(&seed, device).await.unwrap();

        for body in [
            r#"{"serial_number":"SN1","device_status":"sleeping"}"#,
            r#"{"serial_number":"SN1","device_os_version":"Windows 11 Pro"}"#,
        ] {
            let applied = store.apply(&event(body), device).await.unwrap();
            assert_eq!(applied, Applied::Skipped);
        }

        let row = store.get(device).await.unwrap().unwrap();
        assert_eq!(row.ts_epoch, 1_700_000_000);
    }

    #[tokio::test]
    async fn other_subtypes_are_skipped() {
        let (_file, provider) = temp_database().await;
        let store = StatusStore::new(provider);
        let event = decode(
            "iot/acme/plant1/line3/storage",
            br#"{"device_status":"offline"}"#,
            None,
            None,
        )
        .unwrap();

        assert_eq!(store.apply(&event, DeviceId(1)).await.unwrap(), Applied::Skipped);
    }
}
