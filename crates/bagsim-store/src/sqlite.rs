//! SQLite-based store implementation

use bagsim_util::DeviceCode;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{
    AuditEvent, Device, DeviceStore, DeviceUpdate, NewDevice, StoreError, StoreResult,
    MAX_BATTERY_LEVEL,
};

const DEVICE_COLUMNS: &str = "code, is_claimed, owner, status, battery_level, revision, \
                              last_seen, created_at, updated_at";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Device records
            CREATE TABLE IF NOT EXISTS devices (
                code TEXT PRIMARY KEY,
                is_claimed INTEGER NOT NULL DEFAULT 0,
                owner TEXT,
                status INTEGER NOT NULL DEFAULT 0,
                battery_level INTEGER NOT NULL DEFAULT 100
                    CHECK (battery_level BETWEEN 0 AND 100),
                revision INTEGER NOT NULL DEFAULT 0,
                last_seen TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_devices_claimed ON devices(is_claimed);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn fetch_device(conn: &Connection, code: &DeviceCode) -> StoreResult<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE code = ?");
        let device = conn
            .query_row(&sql, [code.as_str()], device_from_row)
            .optional()?;
        Ok(device)
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            warn!(value = s, "Unparsable timestamp in store, using now");
            Utc::now()
        })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let code: String = row.get(0)?;
    let battery: i64 = row.get(4)?;
    let revision: i64 = row.get(5)?;
    let last_seen: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(Device {
        code: DeviceCode::new(code),
        is_claimed: row.get(1)?,
        owner: row.get(2)?,
        status: row.get(3)?,
        battery_level: battery.clamp(0, MAX_BATTERY_LEVEL as i64) as u8,
        revision: revision.max(0) as u64,
        last_seen: last_seen.as_deref().map(parse_timestamp),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

impl DeviceStore for SqliteStore {
    fn list_devices(&self) -> StoreResult<Vec<Device>> {
        let conn = self.conn()?;

        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY code");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], device_from_row)?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }

        Ok(devices)
    }

    fn get_device(&self, code: &DeviceCode) -> StoreResult<Device> {
        let conn = self.conn()?;
        Self::fetch_device(&conn, code)?.ok_or_else(|| StoreError::DeviceNotFound(code.clone()))
    }

    fn update_device(&self, code: &DeviceCode, update: &DeviceUpdate) -> StoreResult<Device> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut device = Self::fetch_device(&tx, code)?
            .ok_or_else(|| StoreError::DeviceNotFound(code.clone()))?;

        if let Some(expected) = update.expected_revision
            && expected != device.revision
        {
            return Err(StoreError::Conflict(format!(
                "device {code} is at revision {}, expected {expected}",
                device.revision
            )));
        }

        let previous_revision = device.revision;
        device.apply(update, Utc::now());

        let changed = tx.execute(
            r#"
            UPDATE devices
            SET is_claimed = ?, owner = ?, status = ?, battery_level = ?,
                revision = ?, last_seen = ?, updated_at = ?
            WHERE code = ? AND revision = ?
            "#,
            params![
                device.is_claimed,
                device.owner,
                device.status,
                device.battery_level,
                device.revision as i64,
                device.last_seen.map(|t| t.to_rfc3339()),
                device.updated_at.to_rfc3339(),
                code.as_str(),
                previous_revision as i64,
            ],
        )?;

        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "device {code} changed during update"
            )));
        }

        tx.commit()?;

        debug!(device = %code, revision = device.revision, "Device updated");
        Ok(device)
    }

    fn register_device(&self, new: NewDevice) -> StoreResult<Device> {
        let conn = self.conn()?;
        let now = Utc::now();

        let device = Device {
            code: new.code,
            is_claimed: false,
            owner: None,
            status: false,
            battery_level: new.battery_level.min(MAX_BATTERY_LEVEL),
            revision: 0,
            last_seen: None,
            created_at: now,
            updated_at: now,
        };

        let result = conn.execute(
            r#"
            INSERT INTO devices (code, is_claimed, owner, status, battery_level, revision,
                                 last_seen, created_at, updated_at)
            VALUES (?, 0, NULL, 0, ?, 0, NULL, ?, ?)
            "#,
            params![
                device.code.as_str(),
                device.battery_level,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {
                debug!(device = %device.code, "Device registered");
                Ok(device)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::Conflict(format!(
                    "device {} is already registered",
                    device.code
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![event.timestamp.to_rfc3339(), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp: parse_timestamp(&timestamp_str),
                event,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuditEventType;

    fn code(s: &str) -> DeviceCode {
        DeviceCode::new(s)
    }

    #[test]
    fn test_in_memory_store() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.is_healthy());
        assert!(store.list_devices().unwrap().is_empty());
    }

    #[test]
    fn test_register_and_get() {
        let store = SqliteStore::in_memory().unwrap();

        let registered = store
            .register_device(NewDevice::new("BAG-1").with_battery(80))
            .unwrap();
        assert!(!registered.is_claimed);
        assert!(!registered.status);
        assert_eq!(registered.revision, 0);

        let fetched = store.get_device(&code("BAG-1")).unwrap();
        assert_eq!(fetched.battery_level, 80);
        assert_eq!(fetched.code, registered.code);
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        store.register_device(NewDevice::new("BAG-1")).unwrap();

        let err = store.register_device(NewDevice::new("BAG-1")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.list_devices().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_device() {
        let store = SqliteStore::in_memory().unwrap();

        let err = store.get_device(&code("nope")).unwrap_err();
        assert!(matches!(err, StoreError::DeviceNotFound(_)));

        let err = store
            .update_device(&code("nope"), &DeviceUpdate::new().status(true))
            .unwrap_err();
        assert!(matches!(err, StoreError::DeviceNotFound(_)));
    }

    #[test]
    fn test_update_bumps_revision() {
        let store = SqliteStore::in_memory().unwrap();
        store.register_device(NewDevice::new("BAG-1")).unwrap();

        let updated = store
            .update_device(&code("BAG-1"), &DeviceUpdate::new().claim("bob").status(true))
            .unwrap();
        assert!(updated.is_claimed);
        assert!(updated.status);
        assert_eq!(updated.owner.as_deref(), Some("bob"));
        assert_eq!(updated.revision, 1);

        let fetched = store.get_device(&code("BAG-1")).unwrap();
        assert_eq!(fetched, updated);
    }

    #[test]
    fn test_stale_revision_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        store.register_device(NewDevice::new("BAG-1")).unwrap();
        store
            .update_device(&code("BAG-1"), &DeviceUpdate::new().status(true))
            .unwrap();

        let err = store
            .update_device(
                &code("BAG-1"),
                &DeviceUpdate::new().expect_revision(0).battery_level(10),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Nothing was written
        let device = store.get_device(&code("BAG-1")).unwrap();
        assert_eq!(device.battery_level, 100);
        assert_eq!(device.revision, 1);
    }

    #[test]
    fn test_list_is_ordered_by_code() {
        let store = SqliteStore::in_memory().unwrap();
        for c in ["C", "A", "B"] {
            store.register_device(NewDevice::new(c)).unwrap();
        }

        let codes: Vec<String> = store
            .list_devices()
            .unwrap()
            .into_iter()
            .map(|d| d.code.to_string())
            .collect();
        assert_eq!(codes, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_audit_log() {
        let store = SqliteStore::in_memory().unwrap();

        store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStarted))
            .unwrap();
        store
            .append_audit(AuditEvent::new(AuditEventType::DeviceDepleted {
                device: code("BAG-1"),
            }))
            .unwrap();

        let events = store.get_recent_audits(10).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event, AuditEventType::DeviceDepleted { .. }));
        assert!(matches!(events[1].event, AuditEventType::ServiceStarted));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bagsimd.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.register_device(NewDevice::new("BAG-1")).unwrap();
            store
                .update_device(&code("BAG-1"), &DeviceUpdate::new().claim("carol"))
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let device = store.get_device(&code("BAG-1")).unwrap();
        assert!(device.is_claimed);
        assert_eq!(device.owner.as_deref(), Some("carol"));
    }
}
