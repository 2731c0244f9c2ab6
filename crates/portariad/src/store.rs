//! SQLite-backed resident registry and access ledger.

use chrono::{DateTime, Utc};
use portaria_core::{
    AccessRecord, AccessStore, Direction, FeatureVector, Identity, PlateCode, RecordFilter,
    RecordPage, StoreError, Vehicle,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                apartment TEXT NOT NULL,
                block TEXT NOT NULL,
                phone TEXT,
                email TEXT,
                descriptor TEXT,
                created_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS vehicles (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL REFERENCES identities(id),
                plate TEXT NOT NULL UNIQUE,
                model TEXT NOT NULL,
                color TEXT,
                parking_spot TEXT,
                position INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS access_records (
                id TEXT PRIMARY KEY,
                identity_id TEXT NOT NULL REFERENCES identities(id),
                vehicle_id TEXT,
                direction TEXT NOT NULL,
                method TEXT NOT NULL,
                recognized INTEGER NOT NULL,
                created_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_access_identity
                ON access_records(identity_id, created_at);",
        )
        .map_err(backend)?;
        Ok(Self { conn })
    }

    fn load_vehicles(&self) -> Result<HashMap<Uuid, Vec<Vehicle>>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner_id, plate, model, color, parking_spot
                 FROM vehicles ORDER BY owner_id, position",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(backend)?;

        let mut by_owner: HashMap<Uuid, Vec<Vehicle>> = HashMap::new();
        for row in rows {
            let (id, owner_id, plate, model, color, parking_spot) = row.map_err(backend)?;
            let owner_id = parse_uuid(&owner_id)?;
            let plate = PlateCode::parse(&plate)
                .ok_or_else(|| StoreError::Corrupt(format!("invalid stored plate {plate:?}")))?;
            by_owner.entry(owner_id).or_default().push(Vehicle {
                id: parse_uuid(&id)?,
                owner_id,
                plate,
                model,
                color,
                parking_spot,
            });
        }
        Ok(by_owner)
    }
}

impl AccessStore for SqliteStore {
    fn find_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let mut vehicles = self.load_vehicles()?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, apartment, block, phone, email, descriptor, created_at
                 FROM identities ORDER BY created_at, rowid",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })
            .map_err(backend)?;

        let mut identities = Vec::new();
        for row in rows {
            let (id, name, apartment, block, phone, email, descriptor, created_at) =
                row.map_err(backend)?;
            let id = parse_uuid(&id)?;
            let descriptor = descriptor
                .map(|json| {
                    serde_json::from_str::<FeatureVector>(&json)
                        .map_err(|e| StoreError::Corrupt(format!("descriptor of {id}: {e}")))
                })
                .transpose()?;
            identities.push(Identity {
                id,
                name,
                apartment,
                block,
                phone,
                email,
                vehicles: vehicles.remove(&id).unwrap_or_default(),
                descriptor,
                created_at: from_millis(created_at)?,
            });
        }
        Ok(identities)
    }

    fn find_last_record(&self, identity_id: Uuid) -> Result<Option<AccessRecord>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, identity_id, vehicle_id, direction, method, recognized, created_at
                 FROM access_records WHERE identity_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [identity_id.to_string()],
                raw_record,
            )
            .optional()
            .map_err(backend)?
            .map(RawRecord::into_record)
            .transpose()
    }

    fn insert_record(&mut self, record: &AccessRecord) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO access_records
                 (id, identity_id, vehicle_id, direction, method, recognized, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.to_string(),
                    record.identity_id.to_string(),
                    record.vehicle_id.map(|v| v.to_string()),
                    record.direction.as_str(),
                    record.method,
                    record.recognized,
                    record.created_at.timestamp_millis(),
                ],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn list_records(&self, filter: &RecordFilter, page: usize, page_size: usize) -> Result<RecordPage, StoreError> {
        let (page, offset) = portaria_core::store::page_offset(page, page_size);
        let direction = filter.direction.map(|d| d.as_str());
        let since = filter.since.map(|t| t.timestamp_millis());
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM access_records
                 WHERE (?1 IS NULL OR direction = ?1) AND (?2 IS NULL OR created_at >= ?2)",
                params![direction, since],
                |row| row.get(0),
            )
            .map_err(backend)?;
        let total = usize::try_from(total).map_err(|_| StoreError::Corrupt(format!("record count {total}")))?;

        // SQLite takes signed 64-bit bounds. An offset past them is beyond the ledger.
        let limit = i64::try_from(page_size).unwrap_or(i64::MAX);
        let Ok(offset) = i64::try_from(offset) else {
            return Ok(RecordPage { records: Vec::new(), page, page_size, total });
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, identity_id, vehicle_id, direction, method, recognized, created_at
                 FROM access_records
                 WHERE (?1 IS NULL OR direction = ?1) AND (?2 IS NULL OR created_at >= ?2)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3 OFFSET ?4",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![direction, since, limit, offset], raw_record)
            .map_err(backend)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(backend)?.into_record()?);
        }
        Ok(RecordPage {
            records,
            page,
            page_size,
            total,
        })
    }

    fn save_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
        let descriptor = identity
            .descriptor
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let tx = self.conn.transaction().map_err(backend)?;
        tx.execute(
            "INSERT INTO identities
             (id, name, apartment, block, phone, email, descriptor, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                identity.id.to_string(),
                identity.name,
                identity.apartment,
                identity.block,
                identity.phone,
                identity.email,
                descriptor,
                identity.created_at.timestamp_millis(),
            ],
        )
        .map_err(backend)?;
        for (position, vehicle) in identity.vehicles.iter().enumerate() {
            tx.execute(
                "INSERT INTO vehicles (id, owner_id, plate, model, color, parking_spot, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    vehicle.id.to_string(),
                    identity.id.to_string(),
                    vehicle.plate.as_str(),
                    vehicle.model,
                    vehicle.color,
                    vehicle.parking_spot,
                    position as i64,
                ],
            )
            .map_err(backend)?;
        }
        tx.commit().map_err(backend)
    }

    fn set_descriptor(&mut self, identity_id: Uuid, descriptor: &FeatureVector) -> Result<(), StoreError> {
        let json = serde_json::to_string(descriptor).map_err(|e| StoreError::Backend(e.to_string()))?;
        let updated = self
            .conn
            .execute(
                "UPDATE identities SET descriptor = ?1 WHERE id = ?2",
                params![json, identity_id.to_string()],
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(identity_id.to_string()));
        }
        Ok(())
    }

    fn update_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
        let descriptor = identity
            .descriptor
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let updated = self
            .conn
            .execute(
                "UPDATE identities
                 SET name = ?1, apartment = ?2, block = ?3, phone = ?4, email = ?5, descriptor = ?6
                 WHERE id = ?7",
                params![
                    identity.name,
                    identity.apartment,
                    identity.block,
                    identity.phone,
                    identity.email,
                    descriptor,
                    identity.id.to_string(),
                ],
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(identity.id.to_string()));
        }
        Ok(())
    }
}

struct RawRecord {
    id: String,
    identity_id: String,
    vehicle_id: Option<String>,
    direction: String,
    method: String,
    recognized: bool,
    created_at: i64,
}

impl RawRecord {
    fn into_record(self) -> Result<AccessRecord, StoreError> {
        Ok(AccessRecord {
            id: parse_uuid(&self.id)?,
            identity_id: parse_uuid(&self.identity_id)?,
            vehicle_id: self.vehicle_id.as_deref().map(parse_uuid).transpose()?,
            direction: Direction::parse(&self.direction)
                .ok_or_else(|| StoreError::Corrupt(format!("direction {:?}", self.direction)))?,
            method: self.method,
            recognized: self.recognized,
            created_at: from_millis(self.created_at)?,
        })
    }
}

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        vehicle_id: row.get(2)?,
        direction: row.get(3)?,
        method: row.get(4)?,
        recognized: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("uuid {s:?}: {e}")))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms}")))
}
