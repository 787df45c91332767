use std::sync::Arc;

use fleet_core::{DeviceId, IngestEvent};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::{debug, instrument};

use super::provider::{ConnectionProvider, Handle};
use super::StoreError;

/// Identity returned by [`DeviceResolver::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub device_id: DeviceId,
    /// Whether this call created the identity row.
    pub created: bool,
}

/// A row of the `devices` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub serial_number: String,
    pub customer: Option<String>,
    pub location: Option<String>,
    pub machine_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Maps serial numbers to durable device ids, creating them on first sight.
pub struct DeviceResolver {
    handle: Handle,
}

impl DeviceResolver {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            handle: Handle::new(provider, "devices"),
        }
    }

    /// Resolves (or creates) the device an event belongs to and refreshes
    /// its topic-derived metadata.
    ///
    /// Returns `None` when the event has no usable serial number.
    #[instrument(skip_all, fields(topic = %event.topic()))]
    pub async fn ensure(&self, event: &IngestEvent) -> Result<Option<ResolvedDevice>, StoreError> {
        let Some(serial) = event.serial() else {
            return Ok(None);
        };

        let mut conn = self.handle.get().await?;

        if let Some(id) = select_id(&mut conn, serial).await? {
            refresh_metadata(&mut conn, id, event).await?;
            return Ok(Some(ResolvedDevice {
                device_id: DeviceId(id),
                created: false,
            }));
        }

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO devices (serial_number, customer, location, machine_name)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(serial)
        .bind(&event.customer)
        .bind(&event.location)
        .bind(&event.machine)
        .fetch_one(&mut *conn)
        .await;

        match inserted {
            Ok(id) => Ok(Some(ResolvedDevice {
                device_id: DeviceId(id),
                created: true,
            })),
            Err(insert_err) => {
                // Someone else created the row between our select and insert.
                debug!(serial, error = %insert_err, "device insert failed, re-reading");
                let Some(id) = select_id(&mut conn, serial).await? else {
                    return Err(StoreError::Sqlx(insert_err));
                };
                refresh_metadata(&mut conn, id, event).await?;
                Ok(Some(ResolvedDevice {
                    device_id: DeviceId(id),
                    created: false,
                }))
            }
        }
    }

    pub async fn find_by_serial(&self, serial: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let mut conn = self.handle.get().await?;
        let row = sqlx::query(
            r#"
            SELECT id, serial_number, customer, location, machine_name, created_at, updated_at
            FROM devices WHERE serial_number = ?
            "#,
        )
        .bind(serial.trim())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| map_row(&r)).transpose()
    }

    pub async fn close(&self) {
        self.handle.close().await;
    }
}

async fn select_id(conn: &mut SqliteConnection, serial: &str) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM devices WHERE serial_number = ?")
        .bind(serial)
        .fetch_optional(conn)
        .await
}

async fn refresh_metadata(
    conn: &mut SqliteConnection,
    id: i64,
    event: &IngestEvent,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE devices
        SET customer = ?, location = ?, machine_name = ?,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE id = ?
        "#,
    )
    .bind(&event.customer)
    .bind(&event.location)
    .bind(&event.machine)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

fn map_row(row: &SqliteRow) -> Result<DeviceRecord, StoreError> {
    Ok(DeviceRecord {
        id: DeviceId(row.try_get("id")?),
        serial_number: row.try_get("serial_number")?,
        customer: row.try_get("customer")?,
        location: row.try_get("location")?,
        machine_name: row.try_get("machine_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
