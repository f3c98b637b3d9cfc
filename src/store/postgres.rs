//! PostgreSQL chat store with circuit breaker protection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::resilience::CircuitBreaker;

use super::{
    direct_key, same_write, ChatStore, Message, MessageId, NewMessage, ReadAdvance, ReadPointer,
    Room, RoomId, RoomKind, RoomSummary, RoomUnread, StoreError, UserId,
};

const ROOM_COLUMNS: &str = r#"
    r.id, r.kind, r.meetup_id, r.created_at,
    COALESCE(
        (SELECT array_agg(m.user_id ORDER BY m.joined_at)
         FROM chat_room_members m WHERE m.room_id = r.id),
        '{}'::TEXT[]
    ) AS member_user_ids
"#;

#[derive(sqlx::FromRow)]
struct RoomRow {
    id: i64,
    kind: String,
    meetup_id: Option<i64>,
    created_at: DateTime<Utc>,
    member_user_ids: Vec<String>,
}

impl RoomRow {
    fn into_room(self) -> Result<Room, StoreError> {
        let kind = RoomKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Conflict(format!("unknown room kind '{}'", self.kind)))?;
        Ok(Room {
            id: self.id,
            kind,
            meetup_id: self.meetup_id,
            member_user_ids: self.member_user_ids,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    room_id: i64,
    sender_id: String,
    body: String,
    created_at: DateTime<Utc>,
    client_message_id: Uuid,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            room_id: row.room_id,
            sender_id: row.sender_id,
            body: row.body,
            created_at: row.created_at,
            client_message_id: row.client_message_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    #[sqlx(flatten)]
    room: RoomRow,
    last_id: Option<i64>,
    last_sender_id: Option<String>,
    last_body: Option<String>,
    last_created_at: Option<DateTime<Utc>>,
    last_client_message_id: Option<Uuid>,
    unread_count: i64,
}

pub struct PostgresChatStore {
    pool: PgPool,
    circuit_breaker: Arc<CircuitBreaker>,
    database_url: String,
}

impl PostgresChatStore {
    pub async fn connect(
        config: &DatabaseConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds as u64))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds as u64))
            .connect(&config.url)
            .await?;

        let store = Self {
            pool,
            circuit_breaker,
            database_url: config.url.clone(),
        };

        tracing::info!(
            pool_size = config.pool_size,
            url = %store.database_url_masked(),
            "PostgreSQL chat store connected"
        );

        Ok(store)
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))
    }

    pub fn database_url_masked(&self) -> String {
        mask_url(&self.database_url)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }

    async fn guarded<T, F, Fut>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        match self.circuit_breaker.call(operation).await {
            None => Err(StoreError::CircuitOpen),
            Some(result) => result.map_err(StoreError::from),
        }
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError> {
        let query = format!("SELECT {} FROM chat_rooms r WHERE r.id = $1", ROOM_COLUMNS);
        let row: Option<RoomRow> = self
            .guarded(|| {
                sqlx::query_as(&query)
                    .bind(room_id)
                    .fetch_optional(&self.pool)
            })
            .await?;
        row.map(RoomRow::into_room).transpose()
    }

    async fn require_room(&self, room_id: RoomId) -> Result<Room, StoreError> {
        self.fetch_room(room_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))
    }
}

fn mask_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            return format!("{}***{}", &url[..colon_pos + 1], &url[at_pos..]);
        }
    }
    url.to_string()
}

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, body, created_at, client_message_id";

#[async_trait]
impl ChatStore for PostgresChatStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.guarded(|| sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map(|_| ())
    }

    async fn room(&self, room_id: RoomId) -> Result<Room, StoreError> {
        self.require_room(room_id).await
    }

    async fn rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomSummary>, StoreError> {
        let query = format!(
            r#"
            SELECT {},
                lm.id AS last_id,
                lm.sender_id AS last_sender_id,
                lm.body AS last_body,
                lm.created_at AS last_created_at,
                lm.client_message_id AS last_client_message_id,
                (SELECT COUNT(*) FROM chat_messages x
                 WHERE x.room_id = r.id
                   AND x.id > me.last_read_message_id
                   AND x.sender_id <> me.user_id) AS unread_count
            FROM chat_room_members me
            JOIN chat_rooms r ON r.id = me.room_id
            LEFT JOIN LATERAL (
                SELECT {} FROM chat_messages
                WHERE room_id = r.id
                ORDER BY id DESC
                LIMIT 1
            ) lm ON TRUE
            WHERE me.user_id = $1
            ORDER BY COALESCE(lm.created_at, r.created_at) DESC, r.id DESC
            "#,
            ROOM_COLUMNS, MESSAGE_COLUMNS
        );

        let rows: Vec<SummaryRow> = self
            .guarded(|| sqlx::query_as(&query).bind(user_id).fetch_all(&self.pool))
            .await?;

        rows.into_iter()
            .map(|row| {
                let last_message = match (
                    row.last_id,
                    row.last_sender_id,
                    row.last_body,
                    row.last_created_at,
                ) {
                    (Some(id), Some(sender_id), Some(body), Some(created_at)) => Some(Message {
                        id,
                        room_id: row.room.id,
                        sender_id,
                        body,
                        created_at,
                        client_message_id: row.last_client_message_id.unwrap_or_default(),
                    }),
                    _ => None,
                };
                Ok(RoomSummary {
                    room: row.room.into_room()?,
                    last_message,
                    unread_count: row.unread_count.max(0) as u64,
                })
            })
            .collect()
    }

    async fn is_member(&self, room_id: RoomId, user_id: &str) -> Result<bool, StoreError> {
        self.guarded(|| {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM chat_room_members WHERE room_id = $1 AND user_id = $2)",
            )
            .bind(room_id)
            .bind(user_id)
            .fetch_one(&self.pool)
        })
        .await
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
        Ok(self.require_room(room_id).await?.member_user_ids)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let insert = format!(
            r#"
            INSERT INTO chat_messages (room_id, sender_id, body, client_message_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (room_id, sender_id, client_message_id) DO NOTHING
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        );
        let inserted: Option<MessageRow> = self
            .guarded(|| {
                sqlx::query_as(&insert)
                    .bind(message.room_id)
                    .bind(&message.sender_id)
                    .bind(&message.body)
                    .bind(message.client_message_id)
                    .fetch_optional(&self.pool)
            })
            .await?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        // A previous attempt with the same key already landed
        let existing = format!(
            "SELECT {} FROM chat_messages WHERE room_id = $1 AND sender_id = $2 AND client_message_id = $3",
            MESSAGE_COLUMNS
        );
        let row: MessageRow = self
            .guarded(|| {
                sqlx::query_as(&existing)
                    .bind(message.room_id)
                    .bind(&message.sender_id)
                    .bind(message.client_message_id)
                    .fetch_one(&self.pool)
            })
            .await?;
        same_write(row.into(), &message)
    }

    async fn messages(
        &self,
        room_id: RoomId,
        before: Option<MessageId>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let query = format!(
            r#"
            SELECT * FROM (
                SELECT {} FROM chat_messages
                WHERE room_id = $1 AND ($2::BIGINT IS NULL OR id < $2)
                ORDER BY id DESC
                LIMIT $3
            ) page
            ORDER BY id ASC
            "#,
            MESSAGE_COLUMNS
        );
        let rows: Vec<MessageRow> = self
            .guarded(|| {
                sqlx::query_as(&query)
                    .bind(room_id)
                    .bind(before)
                    .bind(limit.max(0))
                    .fetch_all(&self.pool)
            })
            .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn latest_message_id(&self, room_id: RoomId) -> Result<Option<MessageId>, StoreError> {
        self.guarded(|| {
            sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MAX(id) FROM chat_messages WHERE room_id = $1",
            )
            .bind(room_id)
            .fetch_one(&self.pool)
        })
        .await
    }

    async fn advance_read_pointer(
        &self,
        room_id: RoomId,
        user_id: &str,
        message_id: MessageId,
    ) -> Result<ReadAdvance, StoreError> {
        let updated: Option<(i64, Option<DateTime<Utc>>)> = self
            .guarded(|| {
                sqlx::query_as(
                    r#"
                    UPDATE chat_room_members
                    SET last_read_message_id = $3, read_at = NOW()
                    WHERE room_id = $1 AND user_id = $2 AND last_read_message_id < $3
                    RETURNING last_read_message_id, read_at
                    "#,
                )
                .bind(room_id)
                .bind(user_id)
                .bind(message_id)
                .fetch_optional(&self.pool)
            })
            .await?;

        if let Some((last_read_message_id, read_at)) = updated {
            return Ok(ReadAdvance {
                pointer: ReadPointer {
                    room_id,
                    user_id: user_id.to_string(),
                    last_read_message_id,
                    read_at,
                },
                advanced: true,
            });
        }

        let current: Option<(i64, Option<DateTime<Utc>>)> = self
            .guarded(|| {
                sqlx::query_as(
                    "SELECT last_read_message_id, read_at FROM chat_room_members WHERE room_id = $1 AND user_id = $2",
                )
                .bind(room_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
            })
            .await?;

        let (last_read_message_id, read_at) = current.ok_or_else(|| {
            StoreError::NotFound(format!("membership of {} in room {}", user_id, room_id))
        })?;

        Ok(ReadAdvance {
            pointer: ReadPointer {
                room_id,
                user_id: user_id.to_string(),
                last_read_message_id,
                read_at,
            },
            advanced: false,
        })
    }

    async fn unread_counts(&self, user_id: &str) -> Result<Vec<RoomUnread>, StoreError> {
        let rows: Vec<(i64, i64)> = self
            .guarded(|| {
                sqlx::query_as(
                    r#"
                    SELECT m.room_id, COUNT(msg.id)
                    FROM chat_room_members m
                    LEFT JOIN chat_messages msg
                        ON msg.room_id = m.room_id
                       AND msg.id > m.last_read_message_id
                       AND msg.sender_id <> m.user_id
                    WHERE m.user_id = $1
                    GROUP BY m.room_id
                    ORDER BY m.room_id
                    "#,
                )
                .bind(user_id)
                .fetch_all(&self.pool)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(room_id, count)| RoomUnread {
                room_id,
                unread_count: count.max(0) as u64,
            })
            .collect())
    }

    async fn create_meetup_room(&self, meetup_id: i64, creator_id: &str) -> Result<Room, StoreError> {
        let room_id: i64 = self
            .guarded(|| async {
                let mut tx = self.pool.begin().await?;
                let room_id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO chat_rooms (kind, meetup_id) VALUES ('meetup', $1)
                    ON CONFLICT (meetup_id) DO UPDATE SET meetup_id = EXCLUDED.meetup_id
                    RETURNING id
                    "#,
                )
                .bind(meetup_id)
                .fetch_one(&mut *tx)
                .await?;
                add_member(&mut tx, room_id, creator_id).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(room_id)
            })
            .await?;

        self.require_room(room_id).await
    }

    async fn create_direct_room(&self, user_a: &str, user_b: &str) -> Result<Room, StoreError> {
        if user_a == user_b {
            return Err(StoreError::Conflict(
                "cannot open a direct room with yourself".into(),
            ));
        }
        let key = direct_key(user_a, user_b);

        let room_id: i64 = self
            .guarded(|| async {
                let mut tx = self.pool.begin().await?;
                let room_id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO chat_rooms (kind, direct_key) VALUES ('direct', $1)
                    ON CONFLICT (direct_key) DO UPDATE SET direct_key = EXCLUDED.direct_key
                    RETURNING id
                    "#,
                )
                .bind(&key)
                .fetch_one(&mut *tx)
                .await?;
                add_member(&mut tx, room_id, user_a).await?;
                add_member(&mut tx, room_id, user_b).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(room_id)
            })
            .await?;

        self.require_room(room_id).await
    }

    async fn add_meetup_member(&self, meetup_id: i64, user_id: &str) -> Result<Room, StoreError> {
        let room_id: Option<i64> = self
            .guarded(|| async {
                let mut tx = self.pool.begin().await?;
                let room_id: Option<i64> =
                    sqlx::query_scalar("SELECT id FROM chat_rooms WHERE meetup_id = $1")
                        .bind(meetup_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                if let Some(room_id) = room_id {
                    add_member(&mut tx, room_id, user_id).await?;
                }
                tx.commit().await?;
                Ok::<_, sqlx::Error>(room_id)
            })
            .await?;

        let room_id = room_id
            .ok_or_else(|| StoreError::NotFound(format!("chat room for meetup {}", meetup_id)))?;
        self.require_room(room_id).await
    }
}

async fn add_member(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    room_id: RoomId,
    user_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO chat_room_members (room_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(room_id)
    .bind(user_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_masking() {
        let masked = mask_url("postgres://chat:secret123@db:5432/meetup");
        assert!(!masked.contains("secret123"));
        assert!(masked.contains("chat:***@db:5432"));

        assert_eq!(mask_url("postgres://db:5432/meetup"), "postgres://db:5432/meetup");
    }

    #[test]
    fn test_room_row_rejects_unknown_kind() {
        let row = RoomRow {
            id: 1,
            kind: "group".into(),
            meetup_id: None,
            created_at: Utc::now(),
            member_user_ids: vec![],
        };
        assert!(matches!(row.into_room(), Err(StoreError::Conflict(_))));
    }
}
