//! SQLite-backed talk store.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::ids::IdGenerator;
use crate::models::{MessageBody, NewTalk, ScopeTags, TalkInfo, TalkMessage, TalkQuery, TalkStatus};
use crate::store::TalkStore;

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 1;

const TALK_COLUMNS: &str = "talk_id, status, title, act_id, biz_id, creator_id, creator_name, \
                            servicer_id, started_at, finished_at";

#[derive(Clone)]
pub struct SqliteTalkStore {
    pool: SqlitePool,
    ids: Arc<dyn IdGenerator>,
}

impl SqliteTalkStore {
    pub async fn connect(url: &str, ids: Arc<dyn IdGenerator>) -> Result<Self> {
        info!("Connecting to talk database: {}", url);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect(url)
            .await?;
        Self::from_pool(pool, ids).await
    }

    /// Isolated database that lives as long as the store. One connection, so
    /// every query sees the same memory database.
    pub async fn in_memory(ids: Arc<dyn IdGenerator>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool, ids).await
    }

    pub async fn from_pool(pool: SqlitePool, ids: Arc<dyn IdGenerator>) -> Result<Self> {
        run_migrations(&pool).await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        Ok(Self { pool, ids })
    }

    async fn ensure_talk(&self, talk_id: &str) -> Result<()> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM talks WHERE talk_id = ?")
            .bind(talk_id)
            .fetch_optional(&self.pool)
            .await?;
        found.map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn ensure_open(&self, talk_id: &str) -> Result<()> {
        let status: Option<i64> = sqlx::query_scalar("SELECT status FROM talks WHERE talk_id = ?")
            .bind(talk_id)
            .fetch_optional(&self.pool)
            .await?;
        match status.map(TalkStatus::from_i64) {
            None => Err(StoreError::NotFound),
            Some(TalkStatus::Closed) => Err(StoreError::TalkClosed(talk_id.to_string())),
            Some(_) => Ok(()),
        }
    }
}

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: current_version,
            supported: SCHEMA_VERSION,
        });
    }

    if current_version == SCHEMA_VERSION {
        debug!("Talk schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!(
        "Migrating talk database from version {} to {}",
        current_version, SCHEMA_VERSION
    );

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS talks (
            talk_id TEXT PRIMARY KEY,
            status INTEGER NOT NULL DEFAULT 1,
            title TEXT NOT NULL,
            act_id TEXT NOT NULL DEFAULT '',
            biz_id TEXT NOT NULL DEFAULT '',
            creator_id INTEGER NOT NULL,
            creator_name TEXT NOT NULL DEFAULT '',
            servicer_id INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL DEFAULT (unixepoch()),
            finished_at INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS talk_messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            talk_id TEXT NOT NULL REFERENCES talks(talk_id) ON DELETE CASCADE,
            sender_id INTEGER NOT NULL,
            sender_name TEXT NOT NULL DEFAULT '',
            from_customer INTEGER NOT NULL,
            kind TEXT NOT NULL,
            text TEXT,
            data BLOB,
            at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_talk_messages_talk ON talk_messages(talk_id, seq)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_talks_servicer ON talks(servicer_id, status)")
        .execute(pool)
        .await?;

    sqlx::query("INSERT INTO schema_version (version, description) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind("talks and talk_messages")
        .execute(pool)
        .await?;

    Ok(())
}

fn talk_from_row(row: &SqliteRow) -> TalkInfo {
    TalkInfo {
        talk_id: row.get("talk_id"),
        status: TalkStatus::from_i64(row.get("status")),
        title: row.get("title"),
        act_id: row.get("act_id"),
        biz_id: row.get("biz_id"),
        creator_id: row.get::<i64, _>("creator_id") as u64,
        creator_name: row.get("creator_name"),
        servicer_id: row.get::<i64, _>("servicer_id") as u64,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    }
}

fn message_from_row(row: &SqliteRow) -> TalkMessage {
    let kind: String = row.get("kind");
    let body = match kind.as_str() {
        "text" => MessageBody::Text(row.get::<Option<String>, _>("text").unwrap_or_default()),
        "image" => MessageBody::Image(row.get::<Option<Vec<u8>>, _>("data").unwrap_or_default()),
        _ => MessageBody::Unknown,
    };
    TalkMessage {
        sender_id: row.get::<i64, _>("sender_id") as u64,
        sender_name: row.get("sender_name"),
        from_customer: row.get("from_customer"),
        body,
        at: row.get("at"),
    }
}

fn push_in<'a>(qb: &mut QueryBuilder<'a, Sqlite>, column: &str, values: &'a [String]) {
    if values.is_empty() {
        return;
    }
    qb.push(" AND ").push(column).push(" IN (");
    let mut list = qb.separated(", ");
    for v in values {
        list.push_bind(v.as_str());
    }
    list.push_unseparated(")");
}

#[async_trait]
impl TalkStore for SqliteTalkStore {
    async fn create_talk(&self, talk: NewTalk) -> Result<String> {
        talk.validate()?;
        let talk_id = self.ids.next_id().to_string();
        sqlx::query(
            r#"
            INSERT INTO talks
                (talk_id, status, title, act_id, biz_id, creator_id, creator_name,
                 servicer_id, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&talk_id)
        .bind(TalkStatus::Opened.as_i64())
        .bind(&talk.title)
        .bind(&talk.act_id)
        .bind(&talk.biz_id)
        .bind(talk.creator_id as i64)
        .bind(&talk.creator_name)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        debug!(talk_id = %talk_id, "talk created");
        Ok(talk_id)
    }

    async fn open_talk(&self, scope: &ScopeTags, talk_id: &str) -> Result<()> {
        let info = self.talk_info(scope, talk_id).await?;
        if info.status == TalkStatus::Closed {
            return Err(StoreError::TalkClosed(talk_id.to_string()));
        }
        sqlx::query("UPDATE talks SET status = ? WHERE talk_id = ?")
            .bind(TalkStatus::Opened.as_i64())
            .bind(talk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close_talk(&self, scope: &ScopeTags, talk_id: &str) -> Result<()> {
        self.talk_info(scope, talk_id).await?;
        sqlx::query(
            "UPDATE talks SET status = ?, finished_at = ? WHERE talk_id = ? AND status != ?",
        )
            .bind(TalkStatus::Closed.as_i64())
            .bind(chrono::Utc::now().timestamp())
            .bind(talk_id)
            .bind(TalkStatus::Closed.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_message(&self, talk_id: &str, message: &TalkMessage) -> Result<String> {
        self.ensure_open(talk_id).await?;
        let message_id = self.ids.next_id().to_string();
        let (text, data) = match &message.body {
            MessageBody::Text(t) => (Some(t.as_str()), None),
            MessageBody::Image(d) => (None, Some(d.as_slice())),
            MessageBody::Unknown => (None, None),
        };
        // The status guard covers a close that lands after ensure_open.
        let inserted = sqlx::query(
            r#"
            INSERT INTO talk_messages
                (message_id, talk_id, sender_id, sender_name, from_customer, kind, text, data, at)
            SELECT ?, talk_id, ?, ?, ?, ?, ?, ?, ?
            FROM talks WHERE talk_id = ? AND status != ?
            "#,
        )
        .bind(&message_id)
        .bind(message.sender_id as i64)
        .bind(&message.sender_name)
        .bind(message.from_customer)
        .bind(message.body.kind())
        .bind(text)
        .bind(data)
        .bind(message.at)
        .bind(talk_id)
        .bind(TalkStatus::Closed.as_i64())
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::TalkClosed(talk_id.to_string()));
        }
        Ok(message_id)
    }

    async fn list_messages(
        &self,
        talk_id: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<TalkMessage>> {
        self.ensure_talk(talk_id).await?;
        // LIMIT -1 means no limit in SQLite
        let limit = if count == 0 { -1 } else { count as i64 };
        let rows = sqlx::query(
            r#"
            SELECT sender_id, sender_name, from_customer, kind, text, data, at
            FROM talk_messages
            WHERE talk_id = ?
            ORDER BY seq
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(talk_id)
        .bind(limit)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn query_talks(&self, scope: &ScopeTags, query: &TalkQuery) -> Result<Vec<TalkInfo>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(TALK_COLUMNS).push(" FROM talks WHERE 1 = 1");
        push_in(&mut qb, "act_id", &scope.act_ids);
        push_in(&mut qb, "biz_id", &scope.biz_ids);
        if let Some(id) = query.creator_id {
            qb.push(" AND creator_id = ").push_bind(id as i64);
        }
        if let Some(id) = query.servicer_id {
            qb.push(" AND servicer_id = ").push_bind(id as i64);
        }
        if let Some(id) = query.talk_id.as_deref() {
            qb.push(" AND talk_id = ").push_bind(id);
        }
        if !query.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut list = qb.separated(", ");
            for s in &query.statuses {
                list.push_bind(s.as_i64());
            }
            list.push_unseparated(")");
        }
        qb.push(" ORDER BY started_at, talk_id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(talk_from_row).collect())
    }

    async fn pending_talks(&self, scope: &ScopeTags) -> Result<Vec<TalkInfo>> {
        self.query_talks(
            scope,
            &TalkQuery {
                servicer_id: Some(0),
                statuses: vec![TalkStatus::Opened],
                ..Default::default()
            },
        )
        .await
    }

    async fn assign_servicer(
        &self,
        scope: &ScopeTags,
        talk_id: &str,
        servicer_id: u64,
    ) -> Result<()> {
        let info = self.talk_info(scope, talk_id).await?;
        if info.status == TalkStatus::Closed {
            return Err(StoreError::TalkClosed(talk_id.to_string()));
        }

        if servicer_id == 0 {
            sqlx::query("UPDATE talks SET servicer_id = 0 WHERE talk_id = ?")
                .bind(talk_id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        // compare-and-set so two processes sharing the database cannot both win
        let result = sqlx::query(
            "UPDATE talks SET servicer_id = ? \
             WHERE talk_id = ? AND (servicer_id = 0 OR servicer_id = ?)",
        )
        .bind(servicer_id as i64)
        .bind(talk_id)
        .bind(servicer_id as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.talk_servicer_id(scope, talk_id).await?;
            return Err(StoreError::AlreadyAssigned(current));
        }
        Ok(())
    }
}
