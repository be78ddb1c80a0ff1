//! Schema bootstrap.
//!
//! Statements are idempotent (`IF NOT EXISTS`) and run one by one, so the
//! bootstrap can run on every startup.

use sqlx_postgres::PgPool;
use tracing::{debug, info, instrument};

use crate::error::{PostgresError, Result};

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS push_contacts (
        push_contact_id TEXT PRIMARY KEY,
        domain TEXT NOT NULL,
        visitor_guid TEXT,
        device_token TEXT,
        endpoint TEXT,
        auth TEXT,
        p256dh TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_push_contacts_domain ON push_contacts (lower(domain), push_contact_id)",
    "CREATE INDEX IF NOT EXISTS idx_push_contacts_visitor ON push_contacts (lower(domain), visitor_guid, push_contact_id) WHERE visitor_guid IS NOT NULL",
    r#"
    CREATE TABLE IF NOT EXISTS push_messages (
        message_id UUID PRIMARY KEY,
        domain TEXT NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        on_click_link TEXT,
        image_url TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS web_push_events (
        id BIGSERIAL PRIMARY KEY,
        domain TEXT NOT NULL,
        message_id UUID NOT NULL,
        push_contact_id TEXT,
        device_token TEXT,
        date TIMESTAMPTZ NOT NULL,
        type TEXT NOT NULL,
        sub_type TEXT NOT NULL DEFAULT 'none',
        error_message TEXT,
        action_id TEXT
    )
    "#,
    // NULL push_contact_id (token outcomes) never collides.
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_web_push_events_contact_message_type ON web_push_events (push_contact_id, message_id, type)",
    "CREATE INDEX IF NOT EXISTS idx_web_push_events_domain_date ON web_push_events (domain, date)",
    r#"
    CREATE TABLE IF NOT EXISTS message_stats (
        domain TEXT NOT NULL,
        message_id UUID NOT NULL,
        date TIMESTAMPTZ NOT NULL,
        sent BIGINT NOT NULL DEFAULT 0,
        delivered BIGINT NOT NULL DEFAULT 0,
        not_delivered BIGINT NOT NULL DEFAULT 0,
        received BIGINT NOT NULL DEFAULT 0,
        click BIGINT NOT NULL DEFAULT 0,
        action_click BIGINT NOT NULL DEFAULT 0,
        billable_sends BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_message_stats_bucket ON message_stats (domain, message_id, date)",
    "CREATE INDEX IF NOT EXISTS idx_message_stats_date ON message_stats (date)",
];

/// Creates every table and index used by the backend.
#[instrument(skip(pool))]
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx_core::query::query(statement)
            .execute(pool)
            .await
            .map_err(|e| PostgresError::Migration(e.to_string()))?;
        debug!(statement = statement.trim(), "Applied schema statement");
    }

    info!(statements = STATEMENTS.len(), "Schema is up to date");
    Ok(())
}
