//! Smart Trash Intake Service
//!
//! Backend for field devices that photograph discarded items. A device asks
//! for a presigned upload URL, PUTs the photo straight to object storage, then
//! submits a record pointing at the uploaded image. The service classifies
//! the image through a remote classifier on a best-effort basis and persists
//! the record either way.
//!
//! ## Features
//!
//! - **Presigned uploads**: time-boxed PUT URLs for R2, S3 or GCS
//!   (interoperability mode), keyed `trash/{device_id}/{unix_millis}.jpg`
//! - **Soft-fail classification**: classifier errors are stored on the record
//!   instead of failing the submission
//! - **Record history**: PostgreSQL-backed get and paginated listing, newest
//!   first, soft-deleted rows hidden
//!
//! ## Architecture
//!
//! ```text
//!  Device                    Intake API                     Collaborators
//! ┌────────┐  upload-url   ┌──────────────┐  presign   ┌──────────────────┐
//! │        │──────────────▶│              │───────────▶│ Object storage   │
//! │        │  PUT image ───┼──────────────┼───────────▶│ (R2 / S3 / GCS)  │
//! │        │               │ TrashService │            └──────────────────┘
//! │        │  POST trash   │              │  classify  ┌──────────────────┐
//! │        │──────────────▶│              │───────────▶│ Classifier (HTTP)│
//! │        │               │              │            └──────────────────┘
//! │        │  GET trash    │              │  persist   ┌──────────────────┐
//! │        │──────────────▶│              │───────────▶│ PostgreSQL       │
//! └────────┘               └──────────────┘            └──────────────────┘
//! ```

pub mod api;
pub mod classifier;
pub mod config;
pub mod container;
pub mod intake;
pub mod object_storage;
pub mod record_store;
pub mod response;

pub use classifier::{ClassificationResult, Classifier, ClassifierError, HttpClassifier};
pub use config::Config;
pub use container::AppContainer;
pub use intake::{IntakeError, ListTrashQuery, NewTrashSubmission, TrashService, UploadGrant};
pub use object_storage::{ObjectStorage, PresignedUpload, StorageError, StorageProvider};
pub use record_store::{PgTrashStore, StoreError, TrashFilter, TrashRecord, TrashRepository};
pub use response::{ApiResponse, ListTrashResponse, TrashResponse, UploadUrlResponse};
