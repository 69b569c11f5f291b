//! SQLite persistence for the orchestrator
//!
//! One database holds three tables: `servers`, `keys` (the mirror ledger) and
//! `server_health_alerts`. Timestamps are stored as RFC 3339 text.

use super::{
    AlertLog, MirrorLedger, MirrorRecord, NewMirrorRecord, NewServer, Server, ServerDirectory,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub struct SqliteFleetStore {
    pool: SqlitePool,
}

impl SqliteFleetStore {
    /// Open (creating if needed) the database at `path`
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                api_token TEXT NOT NULL,
                api_url TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                server_id INTEGER NOT NULL,
                uuid TEXT NOT NULL,
                short_id TEXT NOT NULL,
                key_name TEXT NOT NULL,
                vless_link TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_keys_user_server ON keys(user_id, server_id)",
            r#"
            CREATE TABLE IF NOT EXISTS server_health_alerts (
                server_id INTEGER PRIMARY KEY,
                last_alert_at TEXT NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn server_from_row(row: &SqliteRow) -> Result<Server, StoreError> {
        let port: i64 = row.try_get("port")?;
        Ok(Server {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            host: row.try_get("host")?,
            port: u16::try_from(port)
                .map_err(|_| StoreError::Corrupt(format!("server port {}", port)))?,
            api_token: row.try_get("api_token")?,
            api_url: row.try_get("api_url")?,
        })
    }

    fn mirror_from_row(row: &SqliteRow) -> Result<MirrorRecord, StoreError> {
        let created_at: String = row.try_get("created_at")?;
        Ok(MirrorRecord {
            id: row.try_get("id")?,
            key_id: row.try_get("key_id")?,
            owner: row.try_get("user_id")?,
            server_id: row.try_get("server_id")?,
            client_id: row.try_get("uuid")?,
            short_id: row.try_get("short_id")?,
            key_name: row.try_get("key_name")?,
            link: row.try_get("vless_link")?,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {}", raw, e)))
}

#[async_trait]
impl ServerDirectory for SqliteFleetStore {
    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let rows = sqlx::query("SELECT * FROM servers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::server_from_row).collect()
    }

    async fn get_server(&self, id: i64) -> Result<Option<Server>, StoreError> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::server_from_row).transpose()
    }

    async fn upsert_server(&self, server: NewServer) -> Result<Server, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO servers (name, host, port, api_token, api_url)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                api_token = excluded.api_token,
                api_url = excluded.api_url
            "#,
        )
        .bind(&server.name)
        .bind(&server.host)
        .bind(i64::from(server.port))
        .bind(&server.api_token)
        .bind(&server.api_url)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM servers WHERE name = ?")
            .bind(&server.name)
            .fetch_one(&self.pool)
            .await?;
        Self::server_from_row(&row)
    }
}

#[async_trait]
impl MirrorLedger for SqliteFleetStore {
    async fn insert_mirror(&self, record: NewMirrorRecord) -> Result<MirrorRecord, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO keys (key_id, user_id, server_id, uuid, short_id, key_name, vless_link, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.key_id)
        .bind(&record.owner)
        .bind(record.server_id)
        .bind(&record.client_id)
        .bind(&record.short_id)
        .bind(&record.key_name)
        .bind(&record.link)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(MirrorRecord {
            id: result.last_insert_rowid(),
            key_id: record.key_id,
            owner: record.owner,
            server_id: record.server_id,
            client_id: record.client_id,
            short_id: record.short_id,
            key_name: record.key_name,
            link: record.link,
            created_at: record.created_at,
        })
    }

    async fn get_mirror(&self, id: i64) -> Result<Option<MirrorRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::mirror_from_row).transpose()
    }

    async fn delete_mirror(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_for(&self, owner: &str, server_id: i64) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM keys WHERE user_id = ? AND server_id = ?")
                .bind(owner)
                .bind(server_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn mirrors_of(&self, owner: &str) -> Result<Vec<MirrorRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM keys WHERE user_id = ? ORDER BY id")
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::mirror_from_row).collect()
    }
}

#[async_trait]
impl AlertLog for SqliteFleetStore {
    async fn last_alert_at(&self, server_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT last_alert_at FROM server_health_alerts WHERE server_id = ?")
                .bind(server_id)
                .fetch_optional(&self.pool)
                .await?;
        raw.as_deref().map(parse_timestamp).transpose()
    }

    async fn record_alert(&self, server_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO server_health_alerts (server_id, last_alert_at) VALUES (?, ?)
            ON CONFLICT(server_id) DO UPDATE SET last_alert_at = excluded.last_alert_at
            "#,
        )
        .bind(server_id)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
