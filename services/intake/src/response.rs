//! External response shapes.
//!
//! Every endpoint answers with the [`ApiResponse`] envelope. Record payloads
//! omit optional fields that carry no information (empty sub-category,
//! message and classify error, unset classification time). `l0_detected` is
//! always present.

use crate::intake::UploadGrant;
use crate::record_store::TrashRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Machine-readable error codes
pub mod codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const MISSING_DEVICE_ID: &str = "MISSING_DEVICE_ID";
    pub const INVALID_ID: &str = "INVALID_ID";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(code.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Upload URL payload
#[derive(Debug, Clone, Serialize)]
pub struct UploadUrlResponse {
    /// Presigned URL to PUT the image to
    pub upload_url: String,
    /// Where the image will be readable; submit this when creating the record
    pub image_url: String,
    /// Seconds until `upload_url` expires
    pub expires_in: i64,
}

impl From<UploadGrant> for UploadUrlResponse {
    fn from(grant: UploadGrant) -> Self {
        Self {
            upload_url: grant.upload_url,
            image_url: grant.public_url,
            expires_in: grant.expires_in,
        }
    }
}

/// Trash record payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrashResponse {
    pub id: Uuid,
    pub device_id: String,
    pub image_url: String,
    pub latitude: f64,
    pub longitude: f64,

    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_category: Option<String>,
    pub confidence: f64,
    pub bin_number: i32,
    pub bin_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub l0_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l0_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l0_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classify_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classified_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl From<TrashRecord> for TrashResponse {
    fn from(r: TrashRecord) -> Self {
        Self {
            id: r.id,
            device_id: r.device_id,
            image_url: r.image_url,
            latitude: r.latitude,
            longitude: r.longitude,
            category: r.category,
            sub_category: non_empty(r.sub_category),
            confidence: r.confidence,
            bin_number: r.bin_number,
            bin_label: r.bin_label,
            message: non_empty(r.message),
            l0_detected: r.l0_detected,
            l0_label: non_empty(r.l0_label),
            l0_confidence: r.l0_confidence,
            classify_error: non_empty(r.classify_error),
            classified_at: r.classified_at,
            created_at: r.created_at,
        }
    }
}

/// Pagination metadata for list responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    /// All records matching the filter, ignoring the window
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Record list payload
#[derive(Debug, Clone, Serialize)]
pub struct ListTrashResponse {
    pub data: Vec<TrashResponse>,
    pub pagination: Pagination,
}
