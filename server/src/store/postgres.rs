use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use tracing::warn;

use super::Store;
use crate::{
    error::StoreError,
    types::{Appended, Identity, IdentityPatch, Message},
};

const IDENTITY_COLUMNS: &str =
    "id, display_name, is_external_platform_user, last_active_at, last_message_text";
const MESSAGE_COLUMNS: &str = "id, identity_id, text, from_operator, sent_at, meta";

/// Networked backend on a Postgres pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn messages_where(&self, filter: &str, identity_id: &str, arg: Option<i64>) -> Vec<Message> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE identity_id = $1 {filter} ORDER BY sent_at ASC, seq ASC"
        );
        let mut query = sqlx::query(&sql).bind(identity_id);
        if let Some(value) = arg {
            query = query.bind(value);
        }
        match query.fetch_all(&self.pool).await {
            Ok(rows) => rows.iter().map(message_from_row).collect(),
            Err(err) => {
                warn!(identity_id, error = %err, "message read failed");
                vec![]
            }
        }
    }
}

fn identity_from_row(row: &PgRow) -> Identity {
    Identity {
        id: row.get("id"),
        display_name: row.get("display_name"),
        is_external_platform_user: row.get("is_external_platform_user"),
        last_active_at: row.get("last_active_at"),
        last_message_text: row.get("last_message_text"),
    }
}

fn message_from_row(row: &PgRow) -> Message {
    Message {
        id: row.get("id"),
        identity_id: row.get("identity_id"),
        text: row.get("text"),
        from_operator: row.get("from_operator"),
        sent_at: row.get("sent_at"),
        meta: row
            .get::<Option<String>, _>("meta")
            .and_then(|raw| serde_json::from_str(&raw).ok()),
    }
}

#[async_trait]
impl Store for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn list_identities(&self) -> HashMap<String, Identity> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities");
        match sqlx::query(&sql).fetch_all(&self.pool).await {
            Ok(rows) => rows
                .iter()
                .map(identity_from_row)
                .map(|identity| (identity.id.clone(), identity))
                .collect(),
            Err(err) => {
                warn!(error = %err, "identity list failed");
                HashMap::new()
            }
        }
    }

    async fn get_identity(&self, id: &str) -> Option<Identity> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        match sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await {
            Ok(row) => row.as_ref().map(identity_from_row),
            Err(err) => {
                warn!(identity_id = id, error = %err, "identity lookup failed");
                None
            }
        }
    }

    async fn upsert_identity(
        &self,
        id: &str,
        patch: IdentityPatch,
    ) -> Result<Identity, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO identities ({IDENTITY_COLUMNS})
            VALUES ($1, $2, COALESCE($3, FALSE), COALESCE($4, 0), $5)
            ON CONFLICT (id) DO UPDATE SET
                display_name = COALESCE($2, identities.display_name),
                is_external_platform_user = COALESCE($3, identities.is_external_platform_user),
                last_active_at = COALESCE($4, identities.last_active_at),
                last_message_text = COALESCE($5, identities.last_message_text)
            RETURNING {IDENTITY_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&patch.display_name)
            .bind(patch.is_external_platform_user)
            .bind(patch.last_active_at)
            .bind(&patch.last_message_text)
            .fetch_one(&self.pool)
            .await?;
        Ok(identity_from_row(&row))
    }

    async fn append_message(&self, message: Message) -> Result<Appended, StoreError> {
        let meta = message
            .meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO identities (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(&message.identity_id)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO messages (id, identity_id, text, from_operator, sent_at, meta) \
             VALUES ($1,$2,$3,$4,$5,$6) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.identity_id)
        .bind(&message.text)
        .bind(message.from_operator)
        .bind(message.sent_at)
        .bind(meta)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(&message.id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(Appended {
                message: message_from_row(&row),
                inserted: false,
            });
        }

        sqlx::query(
            "UPDATE identities SET last_active_at = GREATEST(last_active_at, $2), \
             last_message_text = CASE WHEN $2 >= last_active_at THEN $3 ELSE last_message_text END \
             WHERE id = $1",
        )
        .bind(&message.identity_id)
        .bind(message.sent_at)
        .bind(&message.text)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Appended {
            message,
            inserted: true,
        })
    }

    async fn list_messages(&self, identity_id: &str) -> Vec<Message> {
        self.messages_where("", identity_id, None).await
    }

    async fn list_messages_since(&self, identity_id: &str, since: i64) -> Vec<Message> {
        self.messages_where("AND sent_at > $2", identity_id, Some(since))
            .await
    }

    async fn list_recent_non_operator_messages(
        &self,
        identity_id: &str,
        limit: usize,
    ) -> Vec<Message> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE identity_id = $1 AND from_operator = FALSE \
             ORDER BY sent_at DESC, seq DESC LIMIT $2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match sqlx::query(&sql)
            .bind(identity_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows.iter().map(message_from_row).collect(),
            Err(err) => {
                warn!(identity_id, error = %err, "recent message read failed");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    async fn reset(pool: &PgPool) {
        sqlx::query("TRUNCATE messages, identities")
            .execute(pool)
            .await
            .unwrap();
    }

    // Runs only when TEST_DATABASE_URL points at a scratch database.
    #[tokio::test]
    async fn test_contract_against_live_database() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        let store = PgStore::connect(&url).await.unwrap();

        reset(&store.pool).await;
        contract::upsert_merges(&store).await;
        reset(&store.pool).await;
        contract::append_creates_identity_and_is_idempotent(&store).await;
        reset(&store.pool).await;
        contract::reads_respect_boundaries(&store).await;
        reset(&store.pool).await;
        contract::older_append_keeps_latest_preview(&store).await;
        reset(&store.pool).await;
    }

    #[tokio::test]
    async fn test_unreachable_database_degrades() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(500))
            .connect_lazy("postgres://relay@127.0.0.1:1/relay")
            .unwrap();
        let store = PgStore::from_pool(pool);

        assert!(store.list_identities().await.is_empty());
        assert_eq!(store.get_identity("guest_a").await, None);
        assert!(store.list_messages("guest_a").await.is_empty());
        assert!(store.list_messages_since("guest_a", 0).await.is_empty());
        assert!(store
            .list_recent_non_operator_messages("guest_a", 3)
            .await
            .is_empty());

        let upserted = store
            .upsert_identity("guest_a", IdentityPatch::default())
            .await;
        assert!(matches!(upserted, Err(StoreError::Database(_))));
        let appended = store
            .append_message(contract::message("m1", "guest_a", "hello", false, 1))
            .await;
        assert!(matches!(appended, Err(StoreError::Database(_))));
    }
}
