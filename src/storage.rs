//! Persistence of extracted records and crawl audit events.
//!
//! Product workers talk to [`ListingStore`]; the SQLite implementation
//! keeps two tables, `listings` keyed by the listing identifier and an
//! append-only `crawl_events` audit. Upserts are idempotent by primary
//! identifier, which is what lets the fleet settle for at-least-once
//! delivery.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use thiserror::Error;

use crate::models::{CrawlEvent, EventStatus, ListingRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("could not prepare database file: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Idempotent by `listing_id`.
    async fn upsert_record(&self, record: &ListingRecord) -> Result<(), StoreError>;

    async fn list_by_page(&self, page: u64) -> Result<Vec<ListingRecord>, StoreError>;

    /// Returns how many records were removed.
    async fn delete_by_page(&self, page: u64) -> Result<u64, StoreError>;

    /// Append-only audit of persistence attempts.
    async fn record_event(&self, event: &CrawlEvent) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // sqlx does not create the database file on its own.
        let file = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        if !file.is_empty() && file != ":memory:" {
            if let Some(parent) = Path::new(file).parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !Path::new(file).exists() {
                std::fs::File::create(file)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS listings (
                listing_id   TEXT PRIMARY KEY,
                url          TEXT NOT NULL,
                title        TEXT NOT NULL,
                page         INTEGER NOT NULL,
                price_minor  INTEGER,
                currency     TEXT,
                rating       REAL,
                rating_count INTEGER,
                image_urls   TEXT NOT NULL DEFAULT '[]',
                updated_at   TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_listings_page ON listings(page)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS crawl_events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                listing_id  TEXT,
                url         TEXT NOT NULL,
                page        INTEGER NOT NULL,
                status      TEXT NOT NULL,
                error       TEXT,
                created_at  TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[cfg(test)]
    pub async fn event_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM crawl_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ListingRecord, sqlx::Error> {
    let image_urls: String = row.try_get("image_urls")?;
    Ok(ListingRecord {
        listing_id: row.try_get("listing_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        page: row.try_get::<i64, _>("page")? as u64,
        price_minor: row.try_get("price_minor")?,
        currency: row.try_get("currency")?,
        rating: row.try_get("rating")?,
        rating_count: row.try_get("rating_count")?,
        image_urls: serde_json::from_str(&image_urls).unwrap_or_default(),
    })
}

#[async_trait]
impl ListingStore for SqliteStore {
    async fn upsert_record(&self, record: &ListingRecord) -> Result<(), StoreError> {
        let images = serde_json::to_string(&record.image_urls).unwrap_or_else(|_| "[]".into());
        sqlx::query(
            r"
            INSERT OR REPLACE INTO listings
            (listing_id, url, title, page, price_minor, currency, rating,
             rating_count, image_urls, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&record.listing_id)
        .bind(&record.url)
        .bind(&record.title)
        .bind(record.page as i64)
        .bind(record.price_minor)
        .bind(&record.currency)
        .bind(record.rating)
        .bind(record.rating_count)
        .bind(images)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_page(&self, page: u64) -> Result<Vec<ListingRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM listings WHERE page = ? ORDER BY listing_id ASC",
        )
        .bind(page as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(row_to_record(row)?);
        }
        Ok(out)
    }

    async fn delete_by_page(&self, page: u64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM listings WHERE page = ?")
            .bind(page as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_event(&self, event: &CrawlEvent) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO crawl_events (listing_id, url, page, status, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&event.listing_id)
        .bind(&event.url)
        .bind(event.page as i64)
        .bind(match event.status {
            EventStatus::Success => "success",
            EventStatus::Failed => "failed",
        })
        .bind(&event.error)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
