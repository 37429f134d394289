//! Intake orchestration.
//!
//! [`TrashService`] composes the object storage, classifier and record store
//! ports into the operations exposed over HTTP:
//!
//! 1. Request an upload grant: derive an object key from the device ID and the
//!    current time, then presign a PUT for it.
//! 2. Create a record: classify the image (best effort) and persist the record.
//!    A classifier failure is written into the record's `classify_error`; only a
//!    persistence failure fails the operation.
//! 3. Get / list records: read-throughs shaped into response payloads.
//!
//! ```text
//! Start ─▶ classifier configured? ─yes─▶ Classify ─┬─ Success ─┐
//!                 │                                └─ Failure ─┤
//!                 └──────────────no────────────────────────────┴─▶ Persist ─┬─▶ Done
//!                                                                           └─▶ PersistFailed
//! ```

use crate::classifier::{ClassificationResult, Classifier};
use crate::object_storage::{upload_object_key, ObjectStorage, StorageError};
use crate::record_store::{StoreError, TrashFilter, TrashRecord, TrashRepository};
use crate::response::{ListTrashResponse, Pagination, TrashResponse};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Page size used when the caller gives none (or zero)
pub const DEFAULT_PAGE_LIMIT: i64 = 20;
/// Largest accepted page size
pub const MAX_PAGE_LIMIT: i64 = 100;
/// Lifetime of presigned upload URLs
pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(15 * 60);

/// Errors surfaced by intake operations
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),

    #[error("trash record not found")]
    NotFound,

    #[error("failed to generate presigned URL: {0}")]
    StorageUnavailable(#[from] StorageError),

    #[error("failed to persist trash record: {0}")]
    Persistence(#[from] StoreError),
}

/// Ephemeral grant to upload one image; never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadGrant {
    /// Object key: trash/{device_id}/{unix_millis}.jpg
    pub key: String,
    pub upload_url: String,
    /// Stable URL to submit with the record once uploaded
    pub public_url: String,
    /// Seconds until `upload_url` expires
    pub expires_in: i64,
}

/// Submission fields for a new record
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrashSubmission {
    pub device_id: String,
    pub image_url: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Listing request as received from the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListTrashQuery {
    pub device_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListTrashQuery {
    /// Store filter with defaults applied: a missing or zero limit becomes
    /// [`DEFAULT_PAGE_LIMIT`], an empty device ID means "all devices".
    pub fn to_filter(&self) -> TrashFilter {
        let limit = self
            .limit
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .min(MAX_PAGE_LIMIT);

        TrashFilter {
            device_id: self.device_id.clone().filter(|id| !id.is_empty()),
            limit,
            offset: self.offset.unwrap_or(0).max(0),
        }
    }
}

/// Millisecond clock for object keys, strictly increasing within the process
#[derive(Debug, Default)]
struct KeyClock {
    last: AtomicI64,
}

impl KeyClock {
    fn next_millis(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(prev + 1)
    }
}

/// Trash intake orchestrator
pub struct TrashService {
    repository: Arc<dyn TrashRepository>,
    storage: Arc<dyn ObjectStorage>,
    classifier: Option<Arc<dyn Classifier>>,
    upload_url_ttl: Duration,
    key_clock: KeyClock,
}

impl TrashService {
    pub fn new(
        repository: Arc<dyn TrashRepository>,
        storage: Arc<dyn ObjectStorage>,
        classifier: Option<Arc<dyn Classifier>>,
    ) -> Self {
        Self {
            repository,
            storage,
            classifier,
            upload_url_ttl: UPLOAD_URL_TTL,
            key_clock: KeyClock::default(),
        }
    }

    /// Override the upload URL lifetime
    pub fn with_upload_url_ttl(mut self, ttl: Duration) -> Self {
        self.upload_url_ttl = ttl;
        self
    }

    /// The configured classifier, if any
    pub fn classifier(&self) -> Option<&Arc<dyn Classifier>> {
        self.classifier.as_ref()
    }

    /// Check record store connectivity
    pub async fn ping_store(&self) -> Result<(), StoreError> {
        self.repository.ping().await
    }

    /// Issue a presigned upload URL for a device
    #[instrument(skip(self))]
    pub async fn request_upload_grant(&self, device_id: &str) -> Result<UploadGrant, IntakeError> {
        if device_id.trim().is_empty() {
            return Err(IntakeError::Validation("device_id is required".to_string()));
        }

        let key = upload_object_key(device_id, self.key_clock.next_millis());
        let presigned = self.storage.presign_upload(&key, self.upload_url_ttl).await?;

        metrics::counter!("intake.upload_grants.issued").increment(1);
        info!(key = %key, expires_in = presigned.expires_in, "Upload grant issued");

        Ok(UploadGrant {
            key,
            upload_url: presigned.upload_url,
            public_url: presigned.public_url,
            expires_in: presigned.expires_in,
        })
    }

    /// Classify (best effort) and persist a new record
    #[instrument(skip(self, submission), fields(device_id = %submission.device_id))]
    pub async fn create_record(
        &self,
        submission: NewTrashSubmission,
    ) -> Result<TrashResponse, IntakeError> {
        let mut record = TrashRecord::new(
            submission.device_id,
            submission.image_url,
            submission.latitude,
            submission.longitude,
        );

        if let Some(classifier) = &self.classifier {
            self.classify_into(classifier.as_ref(), &mut record).await;
        }

        let stored = self.repository.create(record).await.map_err(|e| {
            metrics::counter!("intake.records.persist_failed").increment(1);
            warn!(error = %e, "Failed to persist trash record");
            IntakeError::Persistence(e)
        })?;

        metrics::counter!("intake.records.created").increment(1);
        info!(
            record_id = %stored.id,
            category = %stored.category,
            classified = stored.classified_at.is_some(),
            "Trash record created"
        );

        Ok(stored.into())
    }

    /// Run the classifier and merge its outcome into `record`. Never fails.
    async fn classify_into(&self, classifier: &dyn Classifier, record: &mut TrashRecord) {
        info!(image_url = %record.image_url, "Classifying image");
        let started = Instant::now();

        let outcome = classifier.classify(&record.image_url).await;
        metrics::histogram!("intake.classify.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                info!(
                    category = %result.category,
                    confidence_pct = result.confidence * 100.0,
                    "Classification succeeded"
                );
                metrics::counter!("intake.classify.succeeded").increment(1);
                apply_classification(record, result);
            }
            Err(e) => {
                warn!(error = %e, "Classification failed, storing record unclassified");
                metrics::counter!("intake.classify.failed").increment(1);
                record.classify_error = Some(e.to_string());
            }
        }
    }

    /// Fetch a single record
    #[instrument(skip(self))]
    pub async fn get_record(&self, id: Uuid) -> Result<TrashResponse, IntakeError> {
        self.repository
            .find_by_id(id)
            .await?
            .map(TrashResponse::from)
            .ok_or(IntakeError::NotFound)
    }

    /// List records newest first with pagination metadata
    #[instrument(skip(self))]
    pub async fn list_records(
        &self,
        query: ListTrashQuery,
    ) -> Result<ListTrashResponse, IntakeError> {
        let filter = query.to_filter();
        let (records, total) = self.repository.find_all(&filter).await?;

        Ok(ListTrashResponse {
            data: records.into_iter().map(TrashResponse::from).collect(),
            pagination: Pagination {
                total,
                limit: filter.limit,
                offset: filter.offset,
            },
        })
    }
}

fn apply_classification(record: &mut TrashRecord, result: ClassificationResult) {
    record.category = result.category;
    record.sub_category = result.sub_category.filter(|s| !s.is_empty());
    record.confidence = result.confidence;
    record.bin_number = result.bin_number;
    record.bin_label = result.bin_label;
    record.message = Some(result.message).filter(|m| !m.is_empty());
    record.l0_detected = result.l0_detected;
    record.l0_label = result.l0_label.filter(|l| !l.is_empty());
    record.l0_confidence = result.l0_confidence;
    record.classify_error = None;
    record.classified_at = Some(Utc::now());
}
