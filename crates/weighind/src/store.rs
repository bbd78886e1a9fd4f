//! SQLite persistence for identities and measurements.
//!
//! All access goes through a `tokio_rusqlite::Connection`, which runs
//! statements on its own background thread, so callers on the session
//! actor never block on disk.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use weighin_core::{
    Embedding, IdentityId, IdentityLookup, IdentityRecord, IdentitySource, Measurement,
    MeasurementId, MeasurementSink,
};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS identities (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        display_name TEXT    NOT NULL UNIQUE,
        embedding    BLOB,
        active       INTEGER NOT NULL DEFAULT 1,
        enrolled_at  INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS measurements (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
        weight      REAL    NOT NULL,
        recorded_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_measurements_identity_time
        ON measurements(identity_id, recorded_at);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: String,
        source: std::io::Error,
    },
    #[error("name already enrolled: {0}")]
    DuplicateName(String),
}

/// A measurement row as stored, with its row id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMeasurement {
    pub id: MeasurementId,
    pub identity_id: IdentityId,
    pub weight: f32,
    pub recorded_at: DateTime<Utc>,
}

/// Change of the latest reading today against earlier reference points (kg).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightChangeStats {
    pub latest_today: Option<f32>,
    pub change_since_yesterday: Option<f32>,
    pub change_over_week: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightSummary {
    pub count: u32,
    pub average: Option<f64>,
    pub min: Option<f32>,
    pub max: Option<f32>,
}

/// Clone-safe handle to the database.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open (or create) the database file and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::DataDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Enroll a new identity. Display names are unique; re-enrollment needs a new name.
    pub async fn enroll(
        &self,
        display_name: &str,
        embedding: &Embedding,
    ) -> Result<IdentityRecord, StoreError> {
        let name = display_name.to_string();
        let blob = embedding.to_le_bytes();
        let enrolled_at = Utc::now();
        let millis = enrolled_at.timestamp_millis();

        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM identities WHERE display_name = ?1)",
                    params![name],
                    |row| row.get(0),
                )?;
                if exists {
                    return Ok(None);
                }
                tx.execute(
                    "INSERT INTO identities (display_name, embedding, active, enrolled_at)
                     VALUES (?1, ?2, 1, ?3)",
                    params![name, blob, millis],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(Some(id))
            })
            .await?;

        let Some(id) = inserted else {
            return Err(StoreError::DuplicateName(display_name.to_string()));
        };
        tracing::info!(id, name = display_name, "identity enrolled");
        Ok(IdentityRecord {
            id: IdentityId(id),
            display_name: display_name.to_string(),
            embedding: Some(embedding.clone()),
            enrolled_at: from_millis(millis),
        })
    }

    /// Active identities, ordered by id.
    pub async fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let records = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, display_name, embedding, enrolled_at
                     FROM identities WHERE active = 1 ORDER BY id",
                )?;
                let rows = stmt.query_map([], identity_from_row)?;
                let collected = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(collected)
            })
            .await?;
        Ok(records)
    }

    /// Soft-delete: the identity stops matching but its history is kept.
    pub async fn deactivate_identity(&self, id: IdentityId) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE identities SET active = 0 WHERE id = ?1 AND active = 1",
                    params![id.0],
                )?)
            })
            .await?;
        if changed > 0 {
            tracing::info!(id = %id, "identity deactivated");
        }
        Ok(changed > 0)
    }

    /// Measurements recorded in `[from, to)`, oldest first.
    pub async fn measurements_between(
        &self,
        id: IdentityId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredMeasurement>, StoreError> {
        let (from, to) = (from.timestamp_millis(), to.timestamp_millis());
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity_id, weight, recorded_at FROM measurements
                     WHERE identity_id = ?1 AND recorded_at >= ?2 AND recorded_at < ?3
                     ORDER BY recorded_at, id",
                )?;
                let rows = stmt.query_map(params![id.0, from, to], measurement_from_row)?;
                let collected = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(collected)
            })
            .await?;
        Ok(rows)
    }

    pub async fn latest_measurement(
        &self,
        id: IdentityId,
    ) -> Result<Option<StoredMeasurement>, StoreError> {
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, identity_id, weight, recorded_at FROM measurements
                         WHERE identity_id = ?1 ORDER BY recorded_at DESC, id DESC LIMIT 1",
                        params![id.0],
                        measurement_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(row)
    }

    /// Latest measurement on the UTC calendar day containing `day`.
    ///
    /// Not consulted on the commit path; daily de-duplication is left to
    /// whoever integrates the daemon.
    pub async fn measurement_on_day(
        &self,
        id: IdentityId,
        day: DateTime<Utc>,
    ) -> Result<Option<StoredMeasurement>, StoreError> {
        let start = start_of_day(day);
        let rows = self
            .measurements_between(id, start, start + Duration::days(1))
            .await?;
        Ok(rows.into_iter().last())
    }

    /// Today's latest reading against the first reading of yesterday and
    /// the first reading of the trailing week.
    pub async fn weight_change_stats(
        &self,
        id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<WeightChangeStats, StoreError> {
        let today_start = start_of_day(now);
        let today = self
            .measurements_between(id, today_start, now + Duration::milliseconds(1))
            .await?
            .last()
            .map(|m| m.weight);
        let yesterday = self
            .measurements_between(id, today_start - Duration::days(1), today_start)
            .await?
            .first()
            .map(|m| m.weight);
        let week = self
            .measurements_between(id, now - Duration::days(7), now + Duration::milliseconds(1))
            .await?;

        let change_over_week = match (today, week.first()) {
            (Some(latest), Some(first)) if week.len() >= 2 => Some(latest - first.weight),
            _ => None,
        };
        Ok(WeightChangeStats {
            latest_today: today,
            change_since_yesterday: today.zip(yesterday).map(|(t, y)| t - y),
            change_over_week,
        })
    }

    pub async fn weight_summary(&self, id: IdentityId) -> Result<WeightSummary, StoreError> {
        let summary = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), AVG(weight), MIN(weight), MAX(weight)
                     FROM measurements WHERE identity_id = ?1",
                    params![id.0],
                    |row| {
                        Ok(WeightSummary {
                            count: row.get(0)?,
                            average: row.get(1)?,
                            min: row.get::<_, Option<f64>>(2)?.map(|v| v as f32),
                            max: row.get::<_, Option<f64>>(3)?.map(|v| v as f32),
                        })
                    },
                )?)
            })
            .await?;
        Ok(summary)
    }

    /// Retention: delete measurements recorded before `cutoff`.
    pub async fn purge_measurements_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let removed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM measurements WHERE recorded_at < ?1",
                    params![cutoff_ms],
                )?)
            })
            .await?;
        tracing::info!(removed, cutoff = %cutoff, "purged old measurements");
        Ok(removed)
    }
}

impl IdentitySource for Store {
    type Error = StoreError;

    async fn load_active_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        self.list_identities().await
    }
}

impl IdentityLookup for Store {
    type Error = StoreError;

    async fn find_identity_by_id(
        &self,
        id: IdentityId,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let record = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, display_name, embedding, enrolled_at
                         FROM identities WHERE id = ?1",
                        params![id.0],
                        identity_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(record)
    }
}

impl MeasurementSink for Store {
    type Error = StoreError;

    async fn insert_measurement(
        &self,
        measurement: Measurement,
    ) -> Result<MeasurementId, StoreError> {
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO measurements (identity_id, weight, recorded_at)
                     VALUES (?1, ?2, ?3)",
                    params![
                        measurement.identity_id.0,
                        measurement.weight as f64,
                        measurement.recorded_at.timestamp_millis()
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(MeasurementId(id))
    }
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<IdentityRecord> {
    let id: i64 = row.get(0)?;
    let blob: Option<Vec<u8>> = row.get(2)?;
    let embedding = match blob.map(|b| Embedding::from_le_bytes(&b)) {
        Some(Ok(e)) => Some(e),
        Some(Err(e)) => {
            tracing::warn!(id, error = %e, "corrupt embedding blob; treating as missing");
            None
        }
        None => None,
    };
    Ok(IdentityRecord {
        id: IdentityId(id),
        display_name: row.get(1)?,
        embedding,
        enrolled_at: from_millis(row.get(3)?),
    })
}

fn measurement_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMeasurement> {
    Ok(StoredMeasurement {
        id: MeasurementId(row.get(0)?),
        identity_id: IdentityId(row.get(1)?),
        weight: row.get::<_, f64>(2)? as f32,
        recorded_at: from_millis(row.get(3)?),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&t.date_naive().and_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    async fn record(store: &Store, id: IdentityId, weight: f32, when: DateTime<Utc>) {
        store
            .insert_measurement(Measurement { identity_id: id, weight, recorded_at: when })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enroll_and_load() {
        let store = Store::open_in_memory().await.unwrap();
        let anna = store.enroll("Anna", &emb(&[0.5, -1.0, 2.0])).await.unwrap();
        let boris = store.enroll("Boris", &emb(&[1.0, 0.0, 0.0])).await.unwrap();
        assert!(boris.id > anna.id);

        let loaded = store.load_active_identities().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].display_name, "Anna");
        assert_eq!(loaded[0].embedding, Some(emb(&[0.5, -1.0, 2.0])));

        let found = store.find_identity_by_id(boris.id).await.unwrap().unwrap();
        assert_eq!(found.display_name, "Boris");
        assert!(store.find_identity_by_id(IdentityId(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enroll_rejects_duplicate_name() {
        let store = Store::open_in_memory().await.unwrap();
        store.enroll("Anna", &emb(&[1.0])).await.unwrap();
        assert!(matches!(
            store.enroll("Anna", &emb(&[0.0, 1.0])).await,
            Err(StoreError::DuplicateName(name)) if name == "Anna"
        ));
    }

    #[tokio::test]
    async fn test_deactivated_identity_is_not_loaded() {
        let store = Store::open_in_memory().await.unwrap();
        let anna = store.enroll("Anna", &emb(&[1.0])).await.unwrap();
        assert!(store.deactivate_identity(anna.id).await.unwrap());
        assert!(!store.deactivate_identity(anna.id).await.unwrap());
        assert!(store.load_active_identities().await.unwrap().is_empty());
        // Still resolvable for history display.
        assert!(store.find_identity_by_id(anna.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_measurements_roundtrip_and_latest() {
        let store = Store::open_in_memory().await.unwrap();
        let anna = store.enroll("Anna", &emb(&[1.0])).await.unwrap();
        record(&store, anna.id, 70.2, at(2026, 3, 1, 8)).await;
        record(&store, anna.id, 69.8, at(2026, 3, 2, 8)).await;

        let rows = store
            .measurements_between(anna.id, at(2026, 3, 1, 0), at(2026, 3, 3, 0))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!((rows[0].weight - 70.2).abs() < 1e-4);

        let latest = store.latest_measurement(anna.id).await.unwrap().unwrap();
        assert!((latest.weight - 69.8).abs() < 1e-4);
        assert_eq!(latest.recorded_at, at(2026, 3, 2, 8));
    }

    #[tokio::test]
    async fn test_measurement_on_day() {
        let store = Store::open_in_memory().await.unwrap();
        let anna = store.enroll("Anna", &emb(&[1.0])).await.unwrap();
        record(&store, anna.id, 70.0, at(2026, 3, 1, 7)).await;
        record(&store, anna.id, 70.4, at(2026, 3, 1, 21)).await;

        let m = store
            .measurement_on_day(anna.id, at(2026, 3, 1, 12))
            .await
            .unwrap()
            .unwrap();
        assert!((m.weight - 70.4).abs() < 1e-4);
        assert!(store
            .measurement_on_day(anna.id, at(2026, 3, 2, 12))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_weight_change_stats() {
        let store = Store::open_in_memory().await.unwrap();
        let anna = store.enroll("Anna", &emb(&[1.0])).await.unwrap();
        let now = at(2026, 3, 10, 9);
        record(&store, anna.id, 72.0, at(2026, 3, 4, 8)).await;
        record(&store, anna.id, 71.0, at(2026, 3, 9, 8)).await;
        record(&store, anna.id, 71.5, at(2026, 3, 9, 20)).await;
        record(&store, anna.id, 70.5, at(2026, 3, 10, 8)).await;

        let stats = store.weight_change_stats(anna.id, now).await.unwrap();
        assert_eq!(stats.latest_today, Some(70.5));
        assert!((stats.change_since_yesterday.unwrap() - -0.5).abs() < 1e-4);
        assert!((stats.change_over_week.unwrap() - -1.5).abs() < 1e-4);

        let empty = store.weight_change_stats(anna.id, at(2026, 4, 1, 9)).await.unwrap();
        assert_eq!(empty.latest_today, None);
        assert_eq!(empty.change_since_yesterday, None);
        assert_eq!(empty.change_over_week, None);
    }

    #[tokio::test]
    async fn test_summary_and_purge() {
        let store = Store::open_in_memory().await.unwrap();
        let anna = store.enroll("Anna", &emb(&[1.0])).await.unwrap();
        assert_eq!(store.weight_summary(anna.id).await.unwrap().count, 0);

        record(&store, anna.id, 80.0, at(2025, 1, 1, 8)).await;
        record(&store, anna.id, 78.0, at(2026, 3, 1, 8)).await;
        let summary = store.weight_summary(anna.id).await.unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min, Some(78.0));
        assert_eq!(summary.max, Some(80.0));

        let removed = store.purge_measurements_before(at(2025, 9, 1, 0)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.weight_summary(anna.id).await.unwrap().count, 1);
    }
}
