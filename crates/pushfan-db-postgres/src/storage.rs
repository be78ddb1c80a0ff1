//! PostgreSQL implementation of the pushfan storage ports.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pushfan_core::{
    ContactRow, ContactStore, DispatchScope, EventStore, EventTarget, MessageId,
    MessageStatsBucket, MessageStore, PushMessage, StatsCounters, StatsKey, StatsStore,
    StorageError, WebPushEvent, WebPushEventType,
};
use sqlx_postgres::{PgPool, PgPoolOptions};
use time::OffsetDateTime;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::PostgresConfig;
use crate::error::{Result, is_unique_violation, storage_error};
use crate::schema::ensure_schema;

const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(1800);

type ContactTuple = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

type StatsTuple = (
    String,
    Uuid,
    DateTime<Utc>,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
);

/// PostgreSQL storage for contacts, messages, events and stats.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens the pool and bootstraps the schema when enabled.
    #[instrument(skip(config), fields(url = %config.redacted_url()))]
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        config.validate()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .min_connections((config.pool_size / 4).max(1))
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(config.idle_timeout())
            .max_lifetime(MAX_CONNECTION_LIFETIME)
            .test_before_acquire(false)
            .connect(&config.url)
            .await?;
        info!(
            pool_size = config.pool_size,
            run_migrations = config.run_migrations,
            "Connected to PostgreSQL"
        );

        if config.run_migrations {
            ensure_schema(&pool).await?;
        }
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts or replaces a contact.
    #[instrument(skip(self, row), fields(push_contact_id = %row.push_contact_id))]
    pub async fn upsert_contact(&self, row: &ContactRow) -> std::result::Result<(), StorageError> {
        sqlx_core::query::query(
            r#"
            INSERT INTO push_contacts (push_contact_id, domain, visitor_guid, device_token, endpoint, auth, p256dh)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (push_contact_id) DO UPDATE SET
                domain = EXCLUDED.domain,
                visitor_guid = EXCLUDED.visitor_guid,
                device_token = EXCLUDED.device_token,
                endpoint = EXCLUDED.endpoint,
                auth = EXCLUDED.auth,
                p256dh = EXCLUDED.p256dh
            "#,
        )
        .bind(&row.push_contact_id)
        .bind(&row.domain)
        .bind(&row.visitor_guid)
        .bind(&row.device_token)
        .bind(&row.endpoint)
        .bind(&row.auth)
        .bind(&row.p256dh)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("upsert contact", e))?;
        Ok(())
    }

    /// Deletes stats buckets older than `retention`. Returns the number deleted.
    #[instrument(skip(self))]
    pub async fn purge_expired_stats(
        &self,
        retention: time::Duration,
    ) -> std::result::Result<u64, StorageError> {
        let cutoff = time_to_chrono(OffsetDateTime::now_utc() - retention);
        let result = sqlx_core::query::query("DELETE FROM message_stats WHERE date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("purge expired stats", e))?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(purged, "Purged expired message stats");
        }
        Ok(purged)
    }
}

fn time_to_chrono(t: OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond()).unwrap_or_else(Utc::now)
}

fn chrono_to_time(t: DateTime<Utc>) -> OffsetDateTime {
    let nanos = i128::from(t.timestamp()) * 1_000_000_000 + i128::from(t.timestamp_subsec_nanos());
    OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn contact_from_tuple(row: ContactTuple) -> ContactRow {
    let (push_contact_id, domain, visitor_guid, device_token, endpoint, auth, p256dh) = row;
    ContactRow {
        push_contact_id,
        domain,
        visitor_guid,
        device_token,
        endpoint,
        auth,
        p256dh,
    }
}

fn bucket_from_tuple(row: StatsTuple) -> MessageStatsBucket {
    let (
        domain,
        message_id,
        date,
        sent,
        delivered,
        not_delivered,
        received,
        click,
        action_click,
        billable_sends,
    ) = row;
    MessageStatsBucket {
        key: StatsKey {
            domain,
            message_id,
            date: chrono_to_time(date),
        },
        counters: StatsCounters {
            sent,
            delivered,
            not_delivered,
            received,
            click,
            action_click,
            billable_sends,
        },
    }
}

#[async_trait]
impl ContactStore for PostgresStorage {
    #[instrument(skip(self), fields(scope = %scope))]
    async fn fetch_contacts_page(
        &self,
        scope: &DispatchScope,
        after: Option<&str>,
        limit: usize,
    ) -> std::result::Result<Vec<ContactRow>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<ContactTuple> = sqlx_core::query_as::query_as(
            r#"
            SELECT push_contact_id, domain, visitor_guid, device_token, endpoint, auth, p256dh
            FROM push_contacts
            WHERE lower(domain) = lower($1)
              AND ($2::text IS NULL OR visitor_guid = $2)
              AND ($3::text IS NULL OR push_contact_id > $3)
            ORDER BY push_contact_id
            LIMIT $4
            "#,
        )
        .bind(scope.domain_name())
        .bind(scope.visitor_guid())
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("fetch contacts page", e))?;

        debug!(fetched = rows.len(), "Fetched contact page");
        Ok(rows.into_iter().map(contact_from_tuple).collect())
    }

    #[instrument(skip(self))]
    async fn get_contact_domain(
        &self,
        push_contact_id: &str,
    ) -> std::result::Result<Option<String>, StorageError> {
        sqlx_core::query_scalar::query_scalar(
            "SELECT domain FROM push_contacts WHERE push_contact_id = $1",
        )
        .bind(push_contact_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("get contact domain", e))
    }

    #[instrument(skip(self, device_tokens), fields(scope = %scope, tokens = device_tokens.len()))]
    async fn mark_tokens_undeliverable(
        &self,
        scope: &DispatchScope,
        device_tokens: &[String],
    ) -> std::result::Result<u64, StorageError> {
        if device_tokens.is_empty() {
            return Ok(0);
        }

        let result = sqlx_core::query::query(
            r#"
            UPDATE push_contacts SET device_token = NULL
            WHERE lower(domain) = lower($1)
              AND ($2::text IS NULL OR visitor_guid = $2)
              AND device_token = ANY($3)
            "#,
        )
        .bind(scope.domain_name())
        .bind(scope.visitor_guid())
        .bind(device_tokens)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("mark tokens undeliverable", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MessageStore for PostgresStorage {
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    async fn save_message(&self, message: &PushMessage) -> std::result::Result<(), StorageError> {
        sqlx_core::query::query(
            r#"
            INSERT INTO push_messages (message_id, domain, title, body, on_click_link, image_url)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.message_id)
        .bind(&message.domain)
        .bind(&message.title)
        .bind(&message.body)
        .bind(&message.on_click_link)
        .bind(&message.image_url)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::duplicate("PushMessage", message.message_id.to_string())
            } else {
                storage_error("save message", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_message(
        &self,
        message_id: MessageId,
    ) -> std::result::Result<Option<PushMessage>, StorageError> {
        let row: Option<(Uuid, String, String, String, Option<String>, Option<String>)> =
            sqlx_core::query_as::query_as(
                r#"
                SELECT message_id, domain, title, body, on_click_link, image_url
                FROM push_messages WHERE message_id = $1
                "#,
            )
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("get message", e))?;

        Ok(row.map(
            |(message_id, domain, title, body, on_click_link, image_url)| PushMessage {
                message_id,
                domain,
                title,
                body,
                on_click_link,
                image_url,
            },
        ))
    }

    #[instrument(skip(self))]
    async fn get_message_domain(
        &self,
        message_id: MessageId,
    ) -> std::result::Result<Option<String>, StorageError> {
        sqlx_core::query_scalar::query_scalar(
            "SELECT domain FROM push_messages WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("get message domain", e))
    }
}

#[async_trait]
impl EventStore for PostgresStorage {
    #[instrument(skip(self))]
    async fn event_exists(
        &self,
        push_contact_id: &str,
        message_id: MessageId,
        event_type: WebPushEventType,
    ) -> std::result::Result<bool, StorageError> {
        sqlx_core::query_scalar::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM web_push_events
                WHERE push_contact_id = $1 AND message_id = $2 AND type = $3
            )
            "#,
        )
        .bind(push_contact_id)
        .bind(message_id)
        .bind(event_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_error("check event exists", e))
    }

    #[instrument(skip(self, event), fields(message_id = %event.message_id, event_type = %event.event_type))]
    async fn insert_event(&self, event: &WebPushEvent) -> std::result::Result<(), StorageError> {
        sqlx_core::query::query(
            r#"
            INSERT INTO web_push_events
                (domain, message_id, push_contact_id, device_token, date, type, sub_type, error_message, action_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&event.domain)
        .bind(event.message_id)
        .bind(event.push_contact_id())
        .bind(event.device_token())
        .bind(time_to_chrono(event.date))
        .bind(event.event_type.as_str())
        .bind(event.sub_type.as_str())
        .bind(&event.error_message)
        .bind(&event.action_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::duplicate(
                    "WebPushEvent",
                    format!(
                        "{}/{}/{}",
                        event.push_contact_id().unwrap_or_default(),
                        event.message_id,
                        event.event_type
                    ),
                )
            } else {
                storage_error("insert event", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, events), fields(events = events.len()))]
    async fn insert_events(
        &self,
        events: &[WebPushEvent],
    ) -> std::result::Result<u64, StorageError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut domains = Vec::with_capacity(events.len());
        let mut message_ids = Vec::with_capacity(events.len());
        let mut contacts: Vec<Option<String>> = Vec::with_capacity(events.len());
        let mut tokens: Vec<Option<String>> = Vec::with_capacity(events.len());
        let mut dates = Vec::with_capacity(events.len());
        let mut types = Vec::with_capacity(events.len());
        let mut sub_types = Vec::with_capacity(events.len());
        let mut errors: Vec<Option<String>> = Vec::with_capacity(events.len());
        let mut actions: Vec<Option<String>> = Vec::with_capacity(events.len());

        for event in events {
            domains.push(event.domain.clone());
            message_ids.push(event.message_id);
            match &event.target {
                EventTarget::PushContact(id) => {
                    contacts.push(Some(id.clone()));
                    tokens.push(None);
                }
                EventTarget::DeviceToken(token) => {
                    contacts.push(None);
                    tokens.push(Some(token.clone()));
                }
            }
            dates.push(time_to_chrono(event.date));
            types.push(event.event_type.as_str().to_string());
            sub_types.push(event.sub_type.as_str().to_string());
            errors.push(event.error_message.clone());
            actions.push(event.action_id.clone());
        }

        let result = sqlx_core::query::query(
            r#"
            INSERT INTO web_push_events
                (domain, message_id, push_contact_id, device_token, date, type, sub_type, error_message, action_id)
            SELECT * FROM UNNEST(
                $1::text[], $2::uuid[], $3::text[], $4::text[], $5::timestamptz[],
                $6::text[], $7::text[], $8::text[], $9::text[]
            )
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(domains)
        .bind(message_ids)
        .bind(contacts)
        .bind(tokens)
        .bind(dates)
        .bind(types)
        .bind(sub_types)
        .bind(errors)
        .bind(actions)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("insert events", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StatsStore for PostgresStorage {
    #[instrument(skip(self, buckets), fields(buckets = buckets.len()))]
    async fn increment_buckets(
        &self,
        buckets: &[MessageStatsBucket],
    ) -> std::result::Result<(), StorageError> {
        if buckets.is_empty() {
            return Ok(());
        }

        let mut domains = Vec::with_capacity(buckets.len());
        let mut message_ids = Vec::with_capacity(buckets.len());
        let mut dates = Vec::with_capacity(buckets.len());
        let mut sent = Vec::with_capacity(buckets.len());
        let mut delivered = Vec::with_capacity(buckets.len());
        let mut not_delivered = Vec::with_capacity(buckets.len());
        let mut received = Vec::with_capacity(buckets.len());
        let mut click = Vec::with_capacity(buckets.len());
        let mut action_click = Vec::with_capacity(buckets.len());
        let mut billable_sends = Vec::with_capacity(buckets.len());

        for bucket in buckets {
            domains.push(bucket.key.domain.clone());
            message_ids.push(bucket.key.message_id);
            dates.push(time_to_chrono(bucket.key.date));
            sent.push(bucket.counters.sent);
            delivered.push(bucket.counters.delivered);
            not_delivered.push(bucket.counters.not_delivered);
            received.push(bucket.counters.received);
            click.push(bucket.counters.click);
            action_click.push(bucket.counters.action_click);
            billable_sends.push(bucket.counters.billable_sends);
        }

        // Keys within one call are unique, so no row is touched twice.
        sqlx_core::query::query(
            r#"
            INSERT INTO message_stats
                (domain, message_id, date, sent, delivered, not_delivered, received, click, action_click, billable_sends)
            SELECT * FROM UNNEST(
                $1::text[], $2::uuid[], $3::timestamptz[], $4::bigint[], $5::bigint[],
                $6::bigint[], $7::bigint[], $8::bigint[], $9::bigint[], $10::bigint[]
            )
            ON CONFLICT (domain, message_id, date) DO UPDATE SET
                sent = message_stats.sent + EXCLUDED.sent,
                delivered = message_stats.delivered + EXCLUDED.delivered,
                not_delivered = message_stats.not_delivered + EXCLUDED.not_delivered,
                received = message_stats.received + EXCLUDED.received,
                click = message_stats.click + EXCLUDED.click,
                action_click = message_stats.action_click + EXCLUDED.action_click,
                billable_sends = message_stats.billable_sends + EXCLUDED.billable_sends
            "#,
        )
        .bind(domains)
        .bind(message_ids)
        .bind(dates)
        .bind(sent)
        .bind(delivered)
        .bind(not_delivered)
        .bind(received)
        .bind(click)
        .bind(action_click)
        .bind(billable_sends)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("increment stats buckets", e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_message_stats(
        &self,
        domain: &str,
        message_id: MessageId,
    ) -> std::result::Result<Vec<MessageStatsBucket>, StorageError> {
        let rows: Vec<StatsTuple> = sqlx_core::query_as::query_as(
            r#"
            SELECT domain, message_id, date, sent, delivered, not_delivered, received,
                   click, action_click, billable_sends
            FROM message_stats
            WHERE lower(domain) = lower($1) AND message_id = $2
            ORDER BY date
            "#,
        )
        .bind(domain)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("get message stats", e))?;

        Ok(rows.into_iter().map(bucket_from_tuple).collect())
    }
}
