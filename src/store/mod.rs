//! # Reading Store
//!
//! Append-only persistence of sensor readings in the `MoistureContent`
//! SQLite table.

pub mod export;

use std::str::FromStr;

use chrono::{Local, NaiveDateTime};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::Result;
use crate::sensor::protocol::SensorSample;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS MoistureContent (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    moisture_percent REAL,
    temperature REAL,
    humidity REAL,
    date_created TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

const SELECT_COLUMNS: &str = "SELECT id, moisture_percent, temperature, humidity, date_created FROM MoistureContent";

/// One persisted sensor sample
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Reading {
    pub id: i64,
    pub moisture_percent: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub date_created: NaiveDateTime,
}

/// Handle to the readings table
#[derive(Debug, Clone)]
pub struct ReadingStore {
    pool: SqlitePool,
}

impl ReadingStore {
    /// Open (or create) the database and make sure the table exists
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite URL, e.g. `sqlite://moistureDB.db`
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use moisture_logger::store::ReadingStore;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let store = ReadingStore::connect("sqlite://moistureDB.db").await?;
    ///     for reading in store.latest(5).await? {
    ///         println!("{:?}", reading);
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!("Reading store ready at {}", database_url);
        Ok(store)
    }

    /// Private in-memory database, gone when the store is dropped
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection would see its own empty database, so keep exactly one
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    /// Persist one sample in its own transaction
    ///
    /// `NaN` values (a failed sensor read on the firmware side) are
    /// stored as NULL.
    pub async fn insert(&self, sample: &SensorSample) -> Result<Reading> {
        let date_created = Local::now().naive_local();
        let moisture_percent = Some(sample.moisture_percent).filter(|v| !v.is_nan());
        let temperature = Some(sample.temperature).filter(|v| !v.is_nan());
        let humidity = Some(sample.humidity).filter(|v| !v.is_nan());

        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            "INSERT INTO MoistureContent (moisture_percent, temperature, humidity, date_created) VALUES (?, ?, ?, ?)",
        )
        .bind(moisture_percent)
        .bind(temperature)
        .bind(humidity)
        .bind(date_created)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;

        Ok(Reading {
            id,
            moisture_percent,
            temperature,
            humidity,
            date_created,
        })
    }

    /// Newest readings first, at most `limit` of them
    pub async fn latest(&self, limit: u32) -> Result<Vec<Reading>> {
        let sql = format!("{} ORDER BY date_created DESC, id DESC LIMIT ?", SELECT_COLUMNS);
        let readings = sqlx::query_as::<_, Reading>(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(readings)
    }

    /// Every reading in insertion order
    pub async fn all(&self) -> Result<Vec<Reading>> {
        let sql = format!("{} ORDER BY id", SELECT_COLUMNS);
        let readings = sqlx::query_as::<_, Reading>(&sql).fetch_all(&self.pool).await?;
        Ok(readings)
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM MoistureContent")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
