use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{BotError, PostRecord, Result, ScheduleState, SourceItem};

/// Durable storage for post history, schedule state and the bounded source
/// item cache. Post rows are append-only.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(BotError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!("Connected to database: {}", database_url);
        Ok(store)
    }

    /// In-memory database for tests. A single connection is required so all
    /// queries see the same memory database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Close the underlying pool. Subsequent queries fail; used to exercise
    /// storage-failure policies.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                content TEXT NOT NULL,
                concepts TEXT NOT NULL,
                cve_ids TEXT NOT NULL,
                technical_depth INTEGER NOT NULL,
                thread_id TEXT,
                thread_position INTEGER,
                external_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS post_cves (
                post_id TEXT NOT NULL,
                cve_id TEXT NOT NULL,
                PRIMARY KEY (post_id, cve_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_items (
                id TEXT PRIMARY KEY,
                published_at TEXT NOT NULL,
                description TEXT NOT NULL,
                severity REAL,
                refs TEXT NOT NULL,
                writeups TEXT NOT NULL,
                factors TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedule_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_post_at TEXT,
                posts_today INTEGER NOT NULL,
                posts_this_month INTEGER NOT NULL,
                counted_date TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append post records in a single transaction. Thread parts are all
    /// committed or none are.
    pub async fn append_posts(&self, posts: &[PostRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for post in posts {
            sqlx::query(
                r#"
                INSERT INTO posts
                    (id, created_at, content, concepts, cve_ids, technical_depth,
                     thread_id, thread_position, external_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(post.id.to_string())
            .bind(post.created_at)
            .bind(&post.content)
            .bind(serde_json::to_string(&post.concepts)?)
            .bind(serde_json::to_string(&post.cve_ids)?)
            .bind(post.technical_depth)
            .bind(post.thread_id.map(|id| id.to_string()))
            .bind(post.thread_position)
            .bind(post.external_id.as_deref())
            .execute(&mut *tx)
            .await?;

            for cve_id in &post.cve_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO post_cves (post_id, cve_id) VALUES (?, ?)",
                )
                .bind(post.id.to_string())
                .bind(cve_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!("Appended {} post record(s)", posts.len());
        Ok(())
    }

    /// Most recent posts, newest first.
    pub async fn recent_posts(&self, limit: usize) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM posts ORDER BY created_at DESC, thread_position DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_post).collect()
    }

    pub async fn get_post(&self, id: Uuid) -> Result<Option<PostRecord>> {
        let row = sqlx::query("SELECT * FROM posts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_post).transpose()
    }

    /// Whether any stored post already references this CVE id. Used for the
    /// hard exclusion that no vulnerability record is covered twice.
    pub async fn is_source_used(&self, cve_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM post_cves WHERE cve_id = ? LIMIT 1")
            .bind(cve_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Insert newly collected source items; ids already cached are ignored.
    /// Returns how many rows were actually new.
    pub async fn cache_source_items(
        &self,
        items: &[SourceItem],
        fetched_at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut inserted = 0usize;
        for item in items {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO source_items
                    (id, published_at, description, severity, refs, writeups, factors, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.id)
            .bind(item.published_at)
            .bind(&item.description)
            .bind(item.severity)
            .bind(serde_json::to_string(&item.references)?)
            .bind(serde_json::to_string(&item.writeups)?)
            .bind(serde_json::to_string(&item.interesting_factors)?)
            .bind(fetched_at)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        Ok(inserted)
    }

    pub async fn cached_source_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT id FROM source_items")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(BotError::Database))
            .collect()
    }

    pub async fn get_source_item(&self, id: &str) -> Result<Option<SourceItem>> {
        let row = sqlx::query("SELECT * FROM source_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_source_item).transpose()
    }

    /// Cached source items no stored post references yet, newest first.
    pub async fn unused_source_items(&self, limit: usize) -> Result<Vec<SourceItem>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM source_items
            WHERE id NOT IN (SELECT cve_id FROM post_cves)
            ORDER BY published_at DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_source_item).collect()
    }

    /// Drop cache rows fetched before the cutoff. The cache only needs to
    /// cover the fetch overlap window, not full history.
    pub async fn prune_source_cache(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM source_items WHERE fetched_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn load_schedule_state(&self) -> Result<Option<ScheduleState>> {
        let row = sqlx::query("SELECT * FROM schedule_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(ScheduleState {
                last_post_at: row.try_get("last_post_at")?,
                posts_today: row.try_get::<i64, _>("posts_today")? as u32,
                posts_this_month: row.try_get::<i64, _>("posts_this_month")? as u32,
                counted_date: row.try_get("counted_date")?,
            })),
            None => Ok(None),
        }
    }

    pub async fn save_schedule_state(&self, state: &ScheduleState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO schedule_state
                (id, last_post_at, posts_today, posts_this_month, counted_date)
            VALUES (1, ?, ?, ?, ?)
            "#,
        )
        .bind(state.last_post_at)
        .bind(state.posts_today as i64)
        .bind(state.posts_this_month as i64)
        .bind(state.counted_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_post(row: &SqliteRow) -> Result<PostRecord> {
    let id: String = row.try_get("id")?;
    let thread_id: Option<String> = row.try_get("thread_id")?;
    let concepts: String = row.try_get("concepts")?;
    let cve_ids: String = row.try_get("cve_ids")?;

    Ok(PostRecord {
        id: parse_uuid(&id)?,
        created_at: row.try_get("created_at")?,
        content: row.try_get("content")?,
        concepts: serde_json::from_str(&concepts)?,
        cve_ids: serde_json::from_str(&cve_ids)?,
        technical_depth: row.try_get("technical_depth")?,
        thread_id: thread_id.as_deref().map(parse_uuid).transpose()?,
        thread_position: row.try_get("thread_position")?,
        external_id: row.try_get("external_id")?,
    })
}

fn row_to_source_item(row: &SqliteRow) -> Result<SourceItem> {
    let references: String = row.try_get("refs")?;
    let writeups: String = row.try_get("writeups")?;
    let factors: String = row.try_get("factors")?;

    Ok(SourceItem {
        id: row.try_get("id")?,
        published_at: row.try_get("published_at")?,
        description: row.try_get("description")?,
        severity: row.try_get("severity")?,
        references: serde_json::from_str(&references)?,
        writeups: serde_json::from_str(&writeups)?,
        interesting_factors: serde_json::from_str(&factors)?,
    })
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| BotError::StateCorruption(format!("bad uuid '{value}': {e}")))
}
