//! PostgreSQL-based durable store backend.
//!
//! Table structure:
//! - `broker_messages` - message rows (metadata as JSONB, content as BYTEA)
//! - `broker_queue_messages` - queue attachment of message rows
//! - `broker_dtx_xids` - prepared distributed transactions
//! - `broker_dtx_enqueue` - enqueues staged by a prepared transaction
//! - `broker_dtx_detach` - detaches staged by a prepared transaction

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::message::{Message, MessageId, Metadata};
use crate::transaction::{EnqueueEntry, Xid};

use super::backend::{DurableStore, RecoveredXid, StoreError, StoreTransaction};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS broker_messages (
        message_id BIGINT PRIMARY KEY,
        exchange_name TEXT NOT NULL,
        routing_key TEXT NOT NULL,
        properties JSONB NOT NULL DEFAULT '{}'::jsonb,
        content BYTEA NOT NULL,
        arrived_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS broker_queue_messages (
        queue_name TEXT NOT NULL,
        message_id BIGINT NOT NULL REFERENCES broker_messages (message_id) ON DELETE CASCADE,
        PRIMARY KEY (queue_name, message_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS broker_dtx_xids (
        internal_xid BIGSERIAL PRIMARY KEY,
        format INTEGER NOT NULL,
        global_id BYTEA NOT NULL,
        branch_id BYTEA NOT NULL,
        UNIQUE (format, global_id, branch_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS broker_dtx_enqueue (
        internal_xid BIGINT NOT NULL REFERENCES broker_dtx_xids (internal_xid) ON DELETE CASCADE,
        queue_name TEXT NOT NULL,
        message_id BIGINT NOT NULL,
        exchange_name TEXT NOT NULL,
        routing_key TEXT NOT NULL,
        properties JSONB NOT NULL DEFAULT '{}'::jsonb,
        content BYTEA NOT NULL,
        arrived_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS broker_dtx_detach (
        internal_xid BIGINT NOT NULL REFERENCES broker_dtx_xids (internal_xid) ON DELETE CASCADE,
        queue_name TEXT NOT NULL,
        message_id BIGINT NOT NULL
    )
    "#,
];

type MessageRow = (i64, String, String, serde_json::Value, Vec<u8>, DateTime<Utc>);

fn row_to_message(row: MessageRow) -> Result<Message, StoreError> {
    let (id, exchange_name, routing_key, properties, content, arrived_at) = row;
    let properties: BTreeMap<String, String> = serde_json::from_value(properties)?;
    let metadata = Metadata {
        exchange_name,
        routing_key,
        properties,
    };
    Ok(Message::from_parts(
        MessageId::new(id as u64),
        metadata,
        content,
        arrived_at,
    ))
}

type StagedRow = (String, i64, String, String, serde_json::Value, Vec<u8>, DateTime<Utc>);

fn staged_row_to_entry(row: StagedRow) -> Result<(String, Message), StoreError> {
    let (queue_name, id, exchange_name, routing_key, properties, content, arrived_at) = row;
    let message = row_to_message((id, exchange_name, routing_key, properties, content, arrived_at))?;
    Ok((queue_name, message))
}

fn db_id(id: MessageId) -> i64 {
    id.value() as i64
}

/// PostgreSQL implementation of [`DurableStore`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the broker tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("PostgreSQL message store schema ready");
        Ok(())
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn store_messages(&mut self, entries: &[EnqueueEntry]) -> Result<(), StoreError> {
        for entry in entries {
            let message = &entry.message;
            let properties = serde_json::to_value(&message.metadata().properties)?;
            sqlx::query(
                r#"
                INSERT INTO broker_messages
                    (message_id, exchange_name, routing_key, properties, content, arrived_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(db_id(message.id()))
            .bind(&message.metadata().exchange_name)
            .bind(&message.metadata().routing_key)
            .bind(&properties)
            .bind(message.content())
            .bind(message.arrived_at())
            .execute(&mut *self.tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO broker_queue_messages (queue_name, message_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&entry.queue_name)
            .bind(db_id(message.id()))
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn detach_from_queue(
        &mut self,
        detach: &HashMap<String, Vec<MessageId>>,
    ) -> Result<(), StoreError> {
        for (queue_name, ids) in detach {
            let ids: Vec<i64> = ids.iter().copied().map(db_id).collect();
            sqlx::query(
                "DELETE FROM broker_queue_messages WHERE queue_name = $1 AND message_id = ANY($2)",
            )
            .bind(queue_name)
            .bind(&ids)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn delete(&mut self, message_ids: &BTreeSet<MessageId>) -> Result<(), StoreError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = message_ids.iter().copied().map(db_id).collect();
        sqlx::query(
            r#"
            DELETE FROM broker_messages m
            WHERE m.message_id = ANY($1)
              AND NOT EXISTS (
                  SELECT 1 FROM broker_queue_messages q WHERE q.message_id = m.message_id
              )
              AND NOT EXISTS (
                  SELECT 1 FROM broker_dtx_detach d WHERE d.message_id = m.message_id
              )
            "#,
        )
        .bind(&ids)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn store_xid(&mut self, xid: &Xid) -> Result<i64, StoreError> {
        let internal_xid: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO broker_dtx_xids (format, global_id, branch_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (format, global_id, branch_id) DO NOTHING
            RETURNING internal_xid
            "#,
        )
        .bind(xid.format)
        .bind(&xid.global_id)
        .bind(&xid.branch_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        internal_xid.ok_or_else(|| StoreError::Conflict(format!("xid {} already stored", xid)))
    }

    async fn prepare_enqueue_messages(
        &mut self,
        internal_xid: i64,
        entries: &[EnqueueEntry],
    ) -> Result<(), StoreError> {
        for entry in entries {
            let message = &entry.message;
            let properties = serde_json::to_value(&message.metadata().properties)?;
            sqlx::query(
                r#"
                INSERT INTO broker_dtx_enqueue
                    (internal_xid, queue_name, message_id, exchange_name, routing_key,
                     properties, content, arrived_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(internal_xid)
            .bind(&entry.queue_name)
            .bind(db_id(message.id()))
            .bind(&message.metadata().exchange_name)
            .bind(&message.metadata().routing_key)
            .bind(&properties)
            .bind(message.content())
            .bind(message.arrived_at())
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn prepare_detach_messages(
        &mut self,
        internal_xid: i64,
        detach: &HashMap<String, Vec<MessageId>>,
    ) -> Result<(), StoreError> {
        for (queue_name, ids) in detach {
            let ids: Vec<i64> = ids.iter().copied().map(db_id).collect();
            sqlx::query(
                r#"
                INSERT INTO broker_dtx_detach (internal_xid, queue_name, message_id)
                SELECT $1, $2, UNNEST($3::BIGINT[])
                "#,
            )
            .bind(internal_xid)
            .bind(queue_name)
            .bind(&ids)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn copy_enqueue_messages(&mut self, internal_xid: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO broker_messages
                (message_id, exchange_name, routing_key, properties, content, arrived_at)
            SELECT DISTINCT ON (message_id)
                message_id, exchange_name, routing_key, properties, content, arrived_at
            FROM broker_dtx_enqueue
            WHERE internal_xid = $1
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(internal_xid)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO broker_queue_messages (queue_name, message_id)
            SELECT queue_name, message_id FROM broker_dtx_enqueue WHERE internal_xid = $1
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(internal_xid)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove_prepared_data(&mut self, internal_xid: i64) -> Result<(), StoreError> {
        // Staged rows cascade with the xid record
        sqlx::query("DELETE FROM broker_dtx_xids WHERE internal_xid = $1")
            .bind(internal_xid)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn restore_dequeue_messages(&mut self, internal_xid: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO broker_queue_messages (queue_name, message_id)
            SELECT d.queue_name, d.message_id
            FROM broker_dtx_detach d
            JOIN broker_messages m ON m.message_id = d.message_id
            WHERE d.internal_xid = $1
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(internal_xid)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for PostgresStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn read_all(&self, queue_name: &str) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT m.message_id, m.exchange_name, m.routing_key, m.properties, m.content, m.arrived_at
            FROM broker_messages m
            JOIN broker_queue_messages q ON q.message_id = m.message_id
            WHERE q.queue_name = $1
            ORDER BY m.message_id ASC
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    async fn retrieve_all_xids(&self) -> Result<Vec<RecoveredXid>, StoreError> {
        let rows: Vec<(i64, i32, Vec<u8>, Vec<u8>)> = sqlx::query_as(
            "SELECT internal_xid, format, global_id, branch_id FROM broker_dtx_xids ORDER BY internal_xid",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(internal_id, format, global_id, branch_id)| RecoveredXid {
                xid: Xid::new(format, global_id, branch_id),
                internal_id,
            })
            .collect())
    }

    async fn retrieve_enqueued_messages(
        &self,
        internal_xid: i64,
    ) -> Result<Vec<(String, Message)>, StoreError> {
        let rows: Vec<StagedRow> =
            sqlx::query_as(
                r#"
                SELECT queue_name, message_id, exchange_name, routing_key, properties, content, arrived_at
                FROM broker_dtx_enqueue
                WHERE internal_xid = $1
                ORDER BY message_id ASC
                "#,
            )
            .bind(internal_xid)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(staged_row_to_entry).collect()
    }

    async fn retrieve_detached_messages(
        &self,
        internal_xid: i64,
    ) -> Result<Vec<(String, Message)>, StoreError> {
        let rows: Vec<StagedRow> =
            sqlx::query_as(
                r#"
                SELECT d.queue_name, m.message_id, m.exchange_name, m.routing_key,
                       m.properties, m.content, m.arrived_at
                FROM broker_dtx_detach d
                JOIN broker_messages m ON m.message_id = d.message_id
                WHERE d.internal_xid = $1
                ORDER BY m.message_id ASC
                "#,
            )
            .bind(internal_xid)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(staged_row_to_entry).collect()
    }

    async fn max_message_id(&self) -> Result<Option<MessageId>, StoreError> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(id) FROM (
                SELECT MAX(message_id) AS id FROM broker_messages
                UNION ALL
                SELECT MAX(message_id) AS id FROM broker_dtx_enqueue
            ) ids
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(max.map(|id| MessageId::new(id as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_message() {
        let row: MessageRow = (
            12,
            "amq.direct".to_string(),
            "orders".to_string(),
            serde_json::json!({"priority": "5"}),
            b"payload".to_vec(),
            Utc::now(),
        );

        let message = row_to_message(row).unwrap();
        assert_eq!(message.id(), MessageId::new(12));
        assert_eq!(message.metadata().routing_key, "orders");
        assert_eq!(message.metadata().properties["priority"], "5");
        assert_eq!(message.content(), b"payload");
    }

    #[test]
    fn test_row_with_invalid_properties_fails() {
        let row: MessageRow = (
            1,
            "ex".to_string(),
            "key".to_string(),
            serde_json::json!([1, 2]),
            Vec::new(),
            Utc::now(),
        );
        assert!(matches!(row_to_message(row), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_schema_creates_every_table() {
        let joined = SCHEMA.join("\n");
        for table in [
            "broker_messages",
            "broker_queue_messages",
            "broker_dtx_xids",
            "broker_dtx_enqueue",
            "broker_dtx_detach",
        ] {
            assert!(joined.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)));
        }
    }
}
