use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Record store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One submitted trash item
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TrashRecord {
    /// Record ID, assigned by the store when nil
    pub id: Uuid,
    /// Submitting device
    pub device_id: String,
    /// Public URL of the uploaded image
    pub image_url: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Disposal category, empty when unclassified
    pub category: String,
    pub sub_category: Option<String>,
    /// Classifier confidence in [0, 1]
    pub confidence: f64,
    pub bin_number: i32,
    pub bin_label: String,
    /// Human-readable classification message
    pub message: Option<String>,
    pub l0_detected: bool,
    pub l0_label: Option<String>,
    pub l0_confidence: Option<f64>,
    /// Why classification failed, if it did
    pub classify_error: Option<String>,
    /// Set only when classification was attempted and succeeded
    pub classified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; records with this set are invisible to reads
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TrashRecord {
    /// Unpersisted, unclassified record built from submission fields
    pub fn new(device_id: String, image_url: String, latitude: f64, longitude: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::nil(),
            device_id,
            image_url,
            latitude,
            longitude,
            category: String::new(),
            sub_category: None,
            confidence: 0.0,
            bin_number: 0,
            bin_label: String::new(),
            message: None,
            l0_detected: false,
            l0_label: None,
            l0_confidence: None,
            classify_error: None,
            classified_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Filter and pagination window for record listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashFilter {
    /// Filter by device ID
    pub device_id: Option<String>,
    /// Maximum number of results
    pub limit: i64,
    /// Offset for pagination
    pub offset: i64,
}

/// Persistence port for trash records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrashRepository: Send + Sync {
    /// Persist a new record, assigning an ID if it has none.
    /// Returns the record as stored.
    async fn create(&self, record: TrashRecord) -> StoreResult<TrashRecord>;

    /// Fetch a non-deleted record by ID
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<TrashRecord>>;

    /// Newest-first page of non-deleted records matching the filter, with the
    /// total count of matching records ignoring the window
    async fn find_all(&self, filter: &TrashFilter) -> StoreResult<(Vec<TrashRecord>, i64)>;

    /// Connectivity check for readiness probes
    async fn ping(&self) -> StoreResult<()>;
}

const RECORD_COLUMNS: &str = r#"
    id, device_id, image_url, latitude, longitude,
    category, sub_category, confidence, bin_number, bin_label,
    message, l0_detected, l0_label, l0_confidence,
    classify_error, classified_at, created_at, updated_at, deleted_at
"#;

/// PostgreSQL-backed record store
pub struct PgTrashStore {
    pool: PgPool,
}

impl PgTrashStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> StoreResult<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Underlying connection pool, for ad-hoc queries outside the repository port
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}

#[async_trait]
impl TrashRepository for PgTrashStore {
    #[instrument(skip(self, record), fields(device_id = %record.device_id))]
    async fn create(&self, mut record: TrashRecord) -> StoreResult<TrashRecord> {
        if record.id.is_nil() {
            record.id = Uuid::new_v4();
        }

        let sql = format!(
            r#"
            INSERT INTO trash_records (
                id, device_id, image_url, latitude, longitude,
                category, sub_category, confidence, bin_number, bin_label,
                message, l0_detected, l0_label, l0_confidence,
                classify_error, classified_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                $11, $12, $13, $14,
                $15, $16, NOW(), NOW()
            )
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let stored = sqlx::query_as::<_, TrashRecord>(&sql)
            .bind(record.id)
            .bind(&record.device_id)
            .bind(&record.image_url)
            .bind(record.latitude)
            .bind(record.longitude)
            .bind(&record.category)
            .bind(&record.sub_category)
            .bind(record.confidence)
            .bind(record.bin_number)
            .bind(&record.bin_label)
            .bind(&record.message)
            .bind(record.l0_detected)
            .bind(&record.l0_label)
            .bind(record.l0_confidence)
            .bind(&record.classify_error)
            .bind(record.classified_at)
            .fetch_one(&self.pool)
            .await?;

        debug!(record_id = %stored.id, "Trash record inserted");

        Ok(stored)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<TrashRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM trash_records WHERE id = $1 AND deleted_at IS NULL"
        );

        let record = sqlx::query_as::<_, TrashRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn find_all(&self, filter: &TrashFilter) -> StoreResult<(Vec<TrashRecord>, i64)> {
        let total: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM trash_records
            WHERE deleted_at IS NULL
              AND ($1::text IS NULL OR device_id = $1)
            "#,
        )
        .bind(filter.device_id.as_deref())
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM trash_records
            WHERE deleted_at IS NULL
              AND ($1::text IS NULL OR device_id = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        );

        let records = sqlx::query_as::<_, TrashRecord>(&sql)
            .bind(filter.device_id.as_deref())
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;

        Ok((records, total.0))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
