//! SQLite-backed sample sink.
//!
//! One table per stream kind plus a battery table. The connection runs in WAL
//! mode so readers (dashboards, the lock-enforcement service) can query while
//! the ingest worker writes.
//!
//! # Example
//!
//! ```rust,ignore
//! use wristlink_native::store::{SampleSink, SqliteSink};
//!
//! let sink = SqliteSink::open("telemetry.db")?;
//! sink.insert(sample);
//! let recent = sink.heart_rate_since(0)?;
//! ```

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use wristlink_core::{BatteryInfo, HeartRateSample, MotionSample, StepCountSample};

use super::sink::SampleSink;
use super::{StoreError, StoreResult};

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// Sample sink writing to SQLite.
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    /// Open or create a telemetry database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrated.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let sink = Self {
            conn: Mutex::new(conn),
        };
        sink.initialize_schema()?;
        Ok(sink)
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> StoreResult<Self> {
        let sink = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        sink.initialize_schema()?;
        Ok(sink)
    }

    fn initialize_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::Locked)?;

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap_or(0);

        if version < SCHEMA_VERSION {
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS heart_rate (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp_ms INTEGER NOT NULL,
                    bpm INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp_ms INTEGER NOT NULL,
                    steps INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS motion (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp_ms INTEGER NOT NULL,
                    sequence_index INTEGER NOT NULL,
                    axis_x INTEGER NOT NULL,
                    axis_y INTEGER NOT NULL,
                    axis_z INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS battery (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    read_at_ms INTEGER NOT NULL,
                    raw BLOB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_heart_rate_ts ON heart_rate(timestamp_ms);
                CREATE INDEX IF NOT EXISTS idx_steps_ts ON steps(timestamp_ms);
                CREATE INDEX IF NOT EXISTS idx_motion_ts ON motion(timestamp_ms);
                ",
            )?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            tracing::debug!("telemetry schema migrated to v{}", SCHEMA_VERSION);
        }

        Ok(())
    }

    fn write(&self, table: &str, f: impl FnOnce(&Connection) -> rusqlite::Result<usize>) {
        let result = self
            .conn
            .lock()
            .map_err(|_| StoreError::Locked)
            .and_then(|conn| f(&conn).map_err(StoreError::from));

        if let Err(e) = result {
            tracing::warn!("failed to insert into {}: {}", table, e);
        }
    }

    /// Heart-rate readings at or after `since_ms`, oldest first.
    ///
    /// # Errors
    ///
    /// Query failure.
    pub fn heart_rate_since(&self, since_ms: u64) -> StoreResult<Vec<HeartRateSample>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Locked)?;
        let mut stmt = conn.prepare(
            "SELECT timestamp_ms, bpm FROM heart_rate WHERE timestamp_ms >= ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![to_sql_ts(since_ms)], |row| {
            Ok(HeartRateSample {
                timestamp_ms: from_sql_ts(row.get(0)?),
                beats_per_minute: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Step counts at or after `since_ms`, oldest first.
    ///
    /// # Errors
    ///
    /// Query failure.
    pub fn steps_since(&self, since_ms: u64) -> StoreResult<Vec<StepCountSample>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Locked)?;
        let mut stmt = conn
            .prepare("SELECT timestamp_ms, steps FROM steps WHERE timestamp_ms >= ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![to_sql_ts(since_ms)], |row| {
            Ok(StepCountSample {
                timestamp_ms: from_sql_ts(row.get(0)?),
                steps: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Motion readings at or after `since_ms`, oldest first.
    ///
    /// # Errors
    ///
    /// Query failure.
    pub fn motion_since(&self, since_ms: u64) -> StoreResult<Vec<MotionSample>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Locked)?;
        let mut stmt = conn.prepare(
            "SELECT timestamp_ms, sequence_index, axis_x, axis_y, axis_z
             FROM motion WHERE timestamp_ms >= ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![to_sql_ts(since_ms)], |row| {
            Ok(MotionSample {
                timestamp_ms: from_sql_ts(row.get(0)?),
                sequence_index: row.get(1)?,
                axis_x: row.get(2)?,
                axis_y: row.get(3)?,
                axis_z: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent battery snapshot.
    ///
    /// # Errors
    ///
    /// Query failure.
    pub fn latest_battery(&self) -> StoreResult<Option<BatteryInfo>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Locked)?;
        let mut stmt = conn.prepare("SELECT read_at_ms, raw FROM battery ORDER BY id DESC LIMIT 1")?;
        let mut rows = stmt.query_map([], |row| {
            Ok(BatteryInfo {
                read_at_ms: from_sql_ts(row.get(0)?),
                raw: row.get(1)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    /// Row counts per table: (heart rate, steps, motion, battery).
    ///
    /// # Errors
    ///
    /// Query failure.
    pub fn counts(&self) -> StoreResult<(usize, usize, usize, usize)> {
        let conn = self.conn.lock().map_err(|_| StoreError::Locked)?;
        let count = |table: &str| -> rusqlite::Result<usize> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        };
        Ok((count("heart_rate")?, count("steps")?, count("motion")?, count("battery")?))
    }
}

impl SampleSink for SqliteSink {
    fn insert_heart_rate(&self, sample: HeartRateSample) {
        self.write("heart_rate", |conn| {
            conn.execute(
                "INSERT INTO heart_rate (timestamp_ms, bpm) VALUES (?1, ?2)",
                params![to_sql_ts(sample.timestamp_ms), sample.beats_per_minute],
            )
        });
    }

    fn insert_steps(&self, sample: StepCountSample) {
        self.write("steps", |conn| {
            conn.execute(
                "INSERT INTO steps (timestamp_ms, steps) VALUES (?1, ?2)",
                params![to_sql_ts(sample.timestamp_ms), sample.steps],
            )
        });
    }

    fn insert_motion(&self, sample: MotionSample) {
        self.write("motion", |conn| {
            conn.execute(
                "INSERT INTO motion (timestamp_ms, sequence_index, axis_x, axis_y, axis_z)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    to_sql_ts(sample.timestamp_ms),
                    sample.sequence_index,
                    sample.axis_x,
                    sample.axis_y,
                    sample.axis_z
                ],
            )
        });
    }

    fn insert_battery(&self, info: BatteryInfo) {
        self.write("battery", |conn| {
            conn.execute(
                "INSERT INTO battery (read_at_ms, raw) VALUES (?1, ?2)",
                params![to_sql_ts(info.read_at_ms), info.raw],
            )
        });
    }
}

/// SQLite integers are signed; epoch milliseconds fit comfortably.
fn to_sql_ts(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_ts(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}
