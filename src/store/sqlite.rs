use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::{StoreError, StoreResult};
use crate::network::{HealthStatus, ServerHealth, ServerKey};
use crate::queue::{Direction, EntityType, Priority, QueueItem, QueueState};
use crate::segment::{FileManifest, SegmentState};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        queue_id TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        direction TEXT NOT NULL,
        priority INTEGER NOT NULL,
        progress REAL NOT NULL,
        state TEXT NOT NULL,
        error_message TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_items_state ON queue_items(state)",
    r#"
    CREATE TABLE IF NOT EXISTS server_health (
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        success_count INTEGER NOT NULL,
        failure_count INTEGER NOT NULL,
        consecutive_failures INTEGER NOT NULL,
        avg_response_time_ms REAL,
        status TEXT NOT NULL,
        last_check INTEGER NOT NULL,
        PRIMARY KEY (host, port)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS segments (
        file_id TEXT NOT NULL,
        segment_index INTEGER NOT NULL,
        redundancy_index INTEGER NOT NULL,
        message_id TEXT NOT NULL,
        internal_subject TEXT NOT NULL,
        state TEXT NOT NULL,
        PRIMARY KEY (file_id, segment_index, redundancy_index)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_segments_message ON segments(message_id)",
    r#"
    CREATE TABLE IF NOT EXISTS manifests (
        file_id TEXT PRIMARY KEY,
        manifest TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
];

/// The downstream database for queue rows, server health and manifests.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) a database file.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// Create store with in-memory database (for testing)
    pub async fn new_in_memory() -> StoreResult<Self> {
        // Every pooled connection would get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> StoreResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn save_queue_item(&self, item: &QueueItem) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO queue_items
            (queue_id, entity_id, entity_type, direction, priority, progress, state,
             error_message, created_at, updated_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.queue_id)
        .bind(&item.entity_id)
        .bind(item.entity_type.as_str())
        .bind(item.direction.as_str())
        .bind(i64::from(item.priority.value()))
        .bind(f64::from(item.progress))
        .bind(item.state.as_str())
        .bind(&item.error_message)
        .bind(item.created_at.timestamp_millis())
        .bind(item.updated_at.timestamp_millis())
        .bind(item.started_at.map(|t| t.timestamp_millis()))
        .bind(item.completed_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes every queue change sent on `updates` until the sending queue
    /// is dropped.
    pub fn persist_queue(&self, mut updates: mpsc::UnboundedReceiver<QueueItem>) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            while let Some(item) = updates.recv().await {
                if let Err(e) = store.save_queue_item(&item).await {
                    warn!(queue_id = %item.queue_id, error = %e, "Failed to persist queue item");
                }
            }
        })
    }

    /// Queue items, oldest first, optionally only those in `state`.
    pub async fn load_queue_items(
        &self,
        state: Option<QueueState>,
    ) -> StoreResult<Vec<QueueItem>> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM queue_items WHERE state = ? ORDER BY created_at")
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM queue_items ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(queue_item_from_row).collect()
    }

    pub async fn save_server_health(&self, health: &ServerHealth) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO server_health
            (host, port, success_count, failure_count, consecutive_failures,
             avg_response_time_ms, status, last_check)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&health.server.host)
        .bind(i64::from(health.server.port))
        .bind(health.success_count as i64)
        .bind(health.failure_count as i64)
        .bind(i64::from(health.consecutive_failures))
        .bind(health.avg_response_time_ms)
        .bind(health.status.as_str())
        .bind(health.last_check)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_health_snapshot(&self, records: &[ServerHealth]) -> StoreResult<()> {
        for health in records {
            self.save_server_health(health).await?;
        }
        Ok(())
    }

    pub async fn load_server_health(&self) -> StoreResult<Vec<ServerHealth>> {
        let rows = sqlx::query("SELECT * FROM server_health ORDER BY host, port")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(server_health_from_row).collect()
    }

    /// Stores the manifest and upserts one row per data article.
    pub async fn save_manifest(&self, manifest: &FileManifest) -> StoreResult<()> {
        let json = serde_json::to_string(manifest)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO manifests (file_id, manifest, updated_at) VALUES (?, ?, ?)",
        )
        .bind(&manifest.file_id)
        .bind(json)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        for segment in &manifest.segments {
            for copy in &segment.copies {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO segments
                    (file_id, segment_index, redundancy_index, message_id, internal_subject, state)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&manifest.file_id)
                .bind(i64::from(segment.segment_index))
                .bind(i64::from(copy.redundancy_index))
                .bind(&copy.message_id)
                .bind(&copy.internal_subject)
                .bind(segment_state_str(copy.state))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(file_id = %manifest.file_id, "Saved manifest");
        Ok(())
    }

    /// Loads a manifest with article states taken from the segment rows.
    pub async fn load_manifest(&self, file_id: &str) -> StoreResult<Option<FileManifest>> {
        let row = sqlx::query("SELECT manifest FROM manifests WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let json: String = row.try_get("manifest")?;
        let mut manifest: FileManifest = serde_json::from_str(&json)?;

        let rows = sqlx::query(
            "SELECT segment_index, redundancy_index, state FROM segments WHERE file_id = ?",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let segment_index: i64 = row.try_get("segment_index")?;
            let redundancy_index: i64 = row.try_get("redundancy_index")?;
            let state = parse_segment_state(&row.try_get::<String, _>("state")?)?;
            if let Some(copy) = manifest
                .segments
                .iter_mut()
                .filter(|s| i64::from(s.segment_index) == segment_index)
                .flat_map(|s| s.copies.iter_mut())
                .find(|c| i64::from(c.redundancy_index) == redundancy_index)
            {
                copy.state = state;
            }
        }
        Ok(Some(manifest))
    }

    pub async fn update_segment_state(
        &self,
        file_id: &str,
        segment_index: u32,
        redundancy_index: u32,
        state: SegmentState,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE segments SET state = ?
            WHERE file_id = ? AND segment_index = ? AND redundancy_index = ?
            "#,
        )
        .bind(segment_state_str(state))
        .bind(file_id)
        .bind(i64::from(segment_index))
        .bind(i64::from(redundancy_index))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "{file_id} segment {segment_index} copy {redundancy_index}"
            )));
        }
        Ok(())
    }
}

fn segment_state_str(state: SegmentState) -> &'static str {
    match state {
        SegmentState::Pending => "pending",
        SegmentState::Posted => "posted",
        SegmentState::Verified => "verified",
        SegmentState::Failed => "failed",
    }
}

fn parse_segment_state(value: &str) -> StoreResult<SegmentState> {
    match value {
        "pending" => Ok(SegmentState::Pending),
        "posted" => Ok(SegmentState::Posted),
        "verified" => Ok(SegmentState::Verified),
        "failed" => Ok(SegmentState::Failed),
        other => Err(corrupt("segments", format!("unknown state {other}"))),
    }
}

fn corrupt(table: &'static str, reason: String) -> StoreError {
    StoreError::CorruptRow { table, reason }
}

fn timestamp(table: &'static str, millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| corrupt(table, format!("timestamp out of range: {millis}")))
}

fn queue_item_from_row(row: &SqliteRow) -> StoreResult<QueueItem> {
    const TABLE: &str = "queue_items";
    let entity_type: String = row.try_get("entity_type")?;
    let direction: String = row.try_get("direction")?;
    let state: String = row.try_get("state")?;
    let priority: i64 = row.try_get("priority")?;
    let progress: f64 = row.try_get("progress")?;
    let started_at: Option<i64> = row.try_get("started_at")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;

    Ok(QueueItem {
        queue_id: row.try_get("queue_id")?,
        entity_id: row.try_get("entity_id")?,
        entity_type: EntityType::parse(&entity_type)
            .ok_or_else(|| corrupt(TABLE, format!("unknown entity type {entity_type}")))?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| corrupt(TABLE, format!("unknown direction {direction}")))?,
        priority: Priority::from_value(priority.clamp(0, i64::from(u8::MAX)) as u8),
        progress: progress as f32,
        state: QueueState::parse(&state)
            .ok_or_else(|| corrupt(TABLE, format!("unknown state {state}")))?,
        error_message: row.try_get("error_message")?,
        created_at: timestamp(TABLE, row.try_get("created_at")?)?,
        updated_at: timestamp(TABLE, row.try_get("updated_at")?)?,
        started_at: started_at.map(|t| timestamp(TABLE, t)).transpose()?,
        completed_at: completed_at.map(|t| timestamp(TABLE, t)).transpose()?,
    })
}

fn server_health_from_row(row: &SqliteRow) -> StoreResult<ServerHealth> {
    let port: i64 = row.try_get("port")?;
    let port = u16::try_from(port)
        .map_err(|_| corrupt("server_health", format!("port out of range: {port}")))?;
    let success_count: i64 = row.try_get("success_count")?;
    let failure_count: i64 = row.try_get("failure_count")?;
    let consecutive_failures: i64 = row.try_get("consecutive_failures")?;

    Ok(ServerHealth {
        server: ServerKey::new(row.try_get::<String, _>("host")?, port),
        success_count: success_count.max(0) as u64,
        failure_count: failure_count.max(0) as u64,
        consecutive_failures: consecutive_failures.clamp(0, i64::from(u32::MAX)) as u32,
        avg_response_time_ms: row.try_get("avg_response_time_ms")?,
        status: HealthStatus::parse(&row.try_get::<String, _>("status")?),
        last_check: row.try_get("last_check")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ServerHealthTracker;
    use crate::segment::{ArticleRef, RedundancyMode, SegmentRecord};

    fn manifest() -> FileManifest {
        let copies = (0..2)
            .map(|r| ArticleRef {
                redundancy_index: r,
                message_id: format!("<{r:016x}@ngPost.com>"),
                internal_subject: "ab".repeat(32),
                wire_subject: "x".repeat(20),
                server: Some("news.example.com:563".into()),
                state: SegmentState::Posted,
            })
            .collect();
        FileManifest {
            file_id: "file-1".into(),
            folder_id: "folder-1".into(),
            file_size: 10,
            file_hash: [7u8; 32],
            segment_size: 10,
            total_segments: 1,
            redundancy: RedundancyMode::UniqueCopies { level: 2 },
            segments: vec![SegmentRecord {
                segment_index: 0,
                size: 10,
                content_hash: [1u8; 32],
                data_offset: 0,
                state: SegmentState::Posted,
                copies,
            }],
            parity: Vec::new(),
            created_at: 0,
            packed_files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_queue_item_round_trip() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let mut item =
            QueueItem::new("file-1", EntityType::File, Direction::Upload, Priority::High);
        store.save_queue_item(&item).await.unwrap();

        item.transition(QueueState::Uploading);
        item.progress = 42.5;
        store.save_queue_item(&item).await.unwrap();

        let all = store.load_queue_items(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, QueueState::Uploading);
        assert_eq!(all[0].priority, Priority::High);
        assert_eq!(all[0].progress, 42.5);
        assert!(all[0].started_at.is_some());

        assert!(store
            .load_queue_items(Some(QueueState::Completed))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_persist_queue_changes() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let queue = crate::queue::TransferQueue::<()>::new("upload");
        let writer = store.persist_queue(queue.subscribe());

        let id = queue
            .enqueue("file-1", EntityType::File, Direction::Upload, Priority::Low, ())
            .unwrap();
        queue.pause(&id).unwrap();
        drop(queue);
        writer.await.unwrap();

        let paused = store.load_queue_items(Some(QueueState::Paused)).await.unwrap();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].queue_id, id);
    }

    #[tokio::test]
    async fn test_health_round_trip_restores_tracker() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let tracker = ServerHealthTracker::new();
        let key = ServerKey::new("news.example.com", 563);
        tracker.update_health(&key, true, Some(120));
        tracker.update_health(&key, false, None);
        store.save_health_snapshot(&tracker.snapshot()).await.unwrap();

        let restored = ServerHealthTracker::new();
        restored.restore(store.load_server_health().await.unwrap());
        let health = restored.get_health(&key);
        assert_eq!(health.success_count, 1);
        assert_eq!(health.failure_count, 1);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.avg_response_time_ms, Some(120.0));
    }

    #[tokio::test]
    async fn test_manifest_and_segment_states() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        store.save_manifest(&manifest()).await.unwrap();

        store
            .update_segment_state("file-1", 0, 1, SegmentState::Failed)
            .await
            .unwrap();
        let loaded = store.load_manifest("file-1").await.unwrap().unwrap();
        assert_eq!(loaded.segments[0].copies[0].state, SegmentState::Posted);
        assert_eq!(loaded.segments[0].copies[1].state, SegmentState::Failed);
        assert_eq!(loaded.file_hash, [7u8; 32]);

        assert!(store.load_manifest("missing").await.unwrap().is_none());
        assert!(matches!(
            store
                .update_segment_state("file-1", 9, 0, SegmentState::Verified)
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("newsvault.db");
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.save_manifest(&manifest()).await.unwrap();
        }
        let store = SqliteStore::open(&path).await.unwrap();
        assert!(store.load_manifest("file-1").await.unwrap().is_some());
    }
}
