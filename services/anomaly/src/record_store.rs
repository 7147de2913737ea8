use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::record::{AnomalyRecord, NewRecord, RecordId, RecordPatch, Verdict};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Canonical storage for anomaly records.
///
/// Implementations must be safe under concurrent calls and must apply each
/// `update` as one atomic read-modify-write.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new pending record and return it
    async fn insert(&self, fields: NewRecord) -> Result<AnomalyRecord, StoreError>;

    async fn get_by_id(&self, id: RecordId) -> Result<AnomalyRecord, StoreError>;

    /// All records, newest first (ties broken by id, descending)
    async fn list_all(&self) -> Result<Vec<AnomalyRecord>, StoreError>;

    /// Merge the present fields of `patch` into the stored record
    async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<AnomalyRecord, StoreError>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Row layout of the `anomalies` table
#[derive(Debug, FromRow)]
struct AnomalyRow {
    id: i64,
    asset_url: String,
    asset_name: String,
    is_anomaly: Option<bool>,
    accuracy: Option<f64>,
    processed_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AnomalyRow> for AnomalyRecord {
    fn from(row: AnomalyRow) -> Self {
        AnomalyRecord::from_parts(
            RecordId::new(row.id),
            row.asset_url,
            row.asset_name,
            Verdict::from_flag(row.is_anomaly),
            row.accuracy,
            row.processed_url,
            row.created_at,
            row.updated_at,
        )
    }
}

const RECORD_COLUMNS: &str =
    "id, asset_url, asset_name, is_anomaly, accuracy, processed_url, created_at, updated_at";

/// Record store backed by PostgreSQL
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch(&self, id: RecordId) -> Result<Option<AnomalyRecord>, StoreError> {
        let row = sqlx::query_as::<_, AnomalyRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM anomalies WHERE id = $1"
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Single statement: the row lock makes the merge atomic, and the
    /// frozen-field guards sit in the WHERE clause.
    async fn guarded_update(
        &self,
        id: RecordId,
        patch: &RecordPatch,
    ) -> Result<Option<AnomalyRow>, StoreError> {
        let row = sqlx::query_as::<_, AnomalyRow>(&format!(
            r#"
            UPDATE anomalies
            SET is_anomaly = COALESCE($2, is_anomaly),
                accuracy = COALESCE($3, accuracy),
                processed_url = COALESCE($4, processed_url),
                updated_at = NOW()
            WHERE id = $1
              AND ($5::text IS NULL OR asset_url = $5)
              AND ($6::text IS NULL OR asset_name = $6)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(id.as_i64())
        .bind(patch.verdict.and_then(Verdict::as_flag))
        .bind(patch.confidence)
        .bind(&patch.processed_url)
        .bind(&patch.asset_url)
        .bind(&patch.asset_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

/// Guarded updates tried before reporting a conflict
const UPDATE_ATTEMPTS: usize = 2;

/// Why a guarded update matched no row. `None` means the row exists and
/// satisfies every guard, so the update is worth another attempt.
fn unmatched_update(
    id: RecordId,
    patch: &RecordPatch,
    current: Option<&AnomalyRecord>,
) -> Option<StoreError> {
    let Some(current) = current else {
        return Some(StoreError::NotFound(id));
    };
    patch
        .immutable_violation(current)
        .map(|field| StoreError::ImmutableFieldViolation { id, field })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self))]
    async fn insert(&self, fields: NewRecord) -> Result<AnomalyRecord, StoreError> {
        let row = sqlx::query_as::<_, AnomalyRow>(&format!(
            r#"
            INSERT INTO anomalies (asset_url, asset_name, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(&fields.asset_url)
        .bind(&fields.asset_name)
        .fetch_one(&self.pool)
        .await?;

        debug!(record_id = row.id, "Record inserted");
        Ok(row.into())
    }

    async fn get_by_id(&self, id: RecordId) -> Result<AnomalyRecord, StoreError> {
        self.fetch(id).await?.ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<AnomalyRecord>, StoreError> {
        let rows = sqlx::query_as::<_, AnomalyRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM anomalies ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, patch), fields(record_id = %id))]
    async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<AnomalyRecord, StoreError> {
        patch.check().map_err(StoreError::InvalidPatch)?;

        for _ in 0..UPDATE_ATTEMPTS {
            if let Some(row) = self.guarded_update(id, &patch).await? {
                return Ok(row.into());
            }

            let current = self.fetch(id).await?;
            if let Some(err) = unmatched_update(id, &patch, current.as_ref()) {
                return Err(err);
            }
            debug!("Guarded update matched nothing but the row is intact, retrying");
        }

        Err(StoreError::Conflict(id))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    last_id: i64,
    records: BTreeMap<RecordId, AnomalyRecord>,
}

/// Process-local record store, used when no database is configured
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, fields: NewRecord) -> Result<AnomalyRecord, StoreError> {
        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let id = RecordId::new(inner.last_id);
        let record = AnomalyRecord::pending(id, fields, Utc::now());
        inner.records.insert(id, record.clone());
        Ok(record)
    }

    async fn get_by_id(&self, id: RecordId) -> Result<AnomalyRecord, StoreError> {
        self.inner
            .lock()
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_all(&self) -> Result<Vec<AnomalyRecord>, StoreError> {
        let mut records: Vec<AnomalyRecord> =
            self.inner.lock().records.values().cloned().collect();
        records.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });
        Ok(records)
    }

    async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<AnomalyRecord, StoreError> {
        patch.check().map_err(StoreError::InvalidPatch)?;

        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(field) = patch.immutable_violation(record) {
            return Err(StoreError::ImmutableFieldViolation { id, field });
        }
        record.merge(&patch, Utc::now());
        Ok(record.clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
