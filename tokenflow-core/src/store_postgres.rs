use crate::definition::ProcessDefinition;
use crate::events::RuntimeEvent;
use crate::store::ProcessStore;
use crate::types::{NodeRef, Properties, State};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

/// Postgres-backed store. Definitions, suspended states, and runtime events
/// live in JSONB columns; join barriers are a counter row upserted per
/// (instance, gateway).
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tf_processes (
                group_name   TEXT        NOT NULL,
                process_id   TEXT        NOT NULL,
                definition   JSONB       NOT NULL,
                updated_at   TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (group_name, process_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tf_states (
                state_key    TEXT        PRIMARY KEY,
                instance_id  UUID        NOT NULL,
                state        JSONB       NOT NULL,
                updated_at   TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS tf_states_instance_idx ON tf_states (instance_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tf_joins (
                instance_id  UUID     NOT NULL,
                gateway_id   TEXT     NOT NULL,
                arrived      SMALLINT NOT NULL,
                properties   JSONB    NOT NULL,
                PRIMARY KEY (instance_id, gateway_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tf_events (
                instance_id  UUID        NOT NULL,
                seq          BIGINT      NOT NULL,
                event        JSONB       NOT NULL,
                recorded_at  TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (instance_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ProcessStore for PostgresStore {
    async fn write_process(&self, group: &str, definition: &ProcessDefinition) -> Result<()> {
        let body = serde_json::to_value(definition)?;
        sqlx::query(
            r#"
            INSERT INTO tf_processes (group_name, process_id, definition, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (group_name, process_id)
            DO UPDATE SET definition = EXCLUDED.definition, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(group)
        .bind(&definition.id)
        .bind(&body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_process(
        &self,
        group: &str,
        process_id: &str,
    ) -> Result<Option<ProcessDefinition>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT definition FROM tf_processes WHERE group_name = $1 AND process_id = $2",
        )
        .bind(group)
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(body,)| {
            serde_json::from_value(body).context("stored process definition failed to decode")
        })
        .transpose()
    }

    async fn delete_process(&self, group: &str, process_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tf_processes WHERE group_name = $1 AND process_id = $2")
            .bind(group)
            .bind(process_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_state(&self, state: &State) -> Result<()> {
        let body = serde_json::to_value(state)?;
        sqlx::query(
            r#"
            INSERT INTO tf_states (state_key, instance_id, state, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (state_key)
            DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.node_ref.key())
        .bind(state.node_ref.process_instance_id)
        .bind(&body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_state(&self, node_ref: &NodeRef) -> Result<Option<State>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT state FROM tf_states WHERE state_key = $1")
                .bind(node_ref.key())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(body,)| {
            serde_json::from_value(body).context("suspended state failed to decode")
        })
        .transpose()
    }

    async fn delete_state(&self, node_ref: &NodeRef) -> Result<()> {
        sqlx::query("DELETE FROM tf_states WHERE state_key = $1")
            .bind(node_ref.key())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_states(&self, instance_id: Uuid) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tf_states WHERE instance_id = $1")
                .bind(instance_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn join_arrive(
        &self,
        instance_id: Uuid,
        gateway_id: &str,
        properties: &Properties,
    ) -> Result<(u16, Properties)> {
        let body = serde_json::to_value(properties)?;
        // `||` merges the arriving branch's memory into the barrier snapshot
        let (arrived, merged): (i16, serde_json::Value) = sqlx::query_as(
            r#"
            INSERT INTO tf_joins (instance_id, gateway_id, arrived, properties)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (instance_id, gateway_id)
            DO UPDATE SET arrived = tf_joins.arrived + 1,
                          properties = tf_joins.properties || EXCLUDED.properties
            RETURNING arrived, properties
            "#,
        )
        .bind(instance_id)
        .bind(gateway_id)
        .bind(&body)
        .fetch_one(&self.pool)
        .await?;
        let merged =
            serde_json::from_value(merged).context("join barrier memory failed to decode")?;
        Ok((arrived as u16, merged))
    }

    async fn join_reset(&self, instance_id: Uuid, gateway_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tf_joins WHERE instance_id = $1 AND gateway_id = $2")
            .bind(instance_id)
            .bind(gateway_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64> {
        let body = serde_json::to_value(event)?;
        let (seq,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO tf_events (instance_id, seq, event, recorded_at)
            SELECT $1, COALESCE(MAX(seq) + 1, 0), $2, $3
            FROM tf_events WHERE instance_id = $1
            RETURNING seq
            "#,
        )
        .bind(instance_id)
        .bind(&body)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(seq as u64)
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let rows: Vec<(i64, serde_json::Value)> = sqlx::query_as(
            "SELECT seq, event FROM tf_events WHERE instance_id = $1 AND seq >= $2 ORDER BY seq",
        )
        .bind(instance_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(seq, body)| {
                let event = serde_json::from_value(body)
                    .context("stored runtime event failed to decode")?;
                Ok((seq as u64, event))
            })
            .collect()
    }
}
