use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// One persisted cooldown.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LimitRow {
    #[sqlx(rename = "ip")]
    pub client_key: String,
    pub time_added: i64,
    pub cooldown_end: i64,
}

/// Storage for clients under cooldown, so limits survive restarts.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<LimitRow>>;

    async fn upsert(&self, row: &LimitRow) -> Result<()>;

    async fn remove(&self, client_key: &str) -> Result<()>;

    /// Swaps the whole table for `rows` in one transaction.
    async fn replace_all(&self, rows: &[LimitRow]) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteRateLimitStore {
    db: SqlitePool,
}

impl SqliteRateLimitStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let db = SqlitePoolOptions::new().max_connections(5).connect_with(opts).await?;
        init_db(&db).await?;
        Ok(Self { db })
    }

    // Every connection to :memory: is its own database, hence the single connection
    pub async fn in_memory() -> Result<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        init_db(&db).await?;
        Ok(Self { db })
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

async fn init_db(db: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rate_limiter (
            ip TEXT PRIMARY KEY NOT NULL,
            time_added INTEGER NOT NULL,
            cooldown_end INTEGER NOT NULL
        )",
    )
    .execute(db)
    .await?;
    Ok(())
}

#[async_trait]
impl RateLimitStore for SqliteRateLimitStore {
    async fn load_all(&self) -> Result<Vec<LimitRow>> {
        let rows = sqlx::query_as::<_, LimitRow>("SELECT ip, time_added, cooldown_end FROM rate_limiter")
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }

    async fn upsert(&self, row: &LimitRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_limiter (ip, time_added, cooldown_end) VALUES (?1, ?2, ?3)
             ON CONFLICT(ip) DO UPDATE SET time_added = ?2, cooldown_end = ?3",
        )
        .bind(&row.client_key)
        .bind(row.time_added)
        .bind(row.cooldown_end)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn remove(&self, client_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_limiter WHERE ip = ?1")
            .bind(client_key)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn replace_all(&self, rows: &[LimitRow]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM rate_limiter").execute(&mut *tx).await?;
        for row in rows {
            sqlx::query("INSERT INTO rate_limiter (ip, time_added, cooldown_end) VALUES (?1, ?2, ?3)")
                .bind(&row.client_key)
                .bind(row.time_added)
                .bind(row.cooldown_end)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM rate_limiter").execute(&self.db).await?;
        Ok(())
    }
}
