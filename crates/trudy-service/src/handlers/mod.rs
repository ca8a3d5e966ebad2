//! API handlers.
//!
//! Tenant-facing handlers answer with `{data, meta: {request_id, ts}}`; list
//! endpoints add a `pagination` block.

pub mod agents;
pub mod api_keys;
pub mod audit_logs;
pub mod calls;
pub mod campaigns;
pub mod credits;
pub mod health;
pub mod internal;
pub mod knowledge_bases;
pub mod tools;
pub mod voices;
pub mod webhook_endpoints;
pub mod webhooks;

use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trudy_store::{Page, Paged};

use crate::error::ApiError;

/// Largest page a list endpoint returns.
pub const MAX_PAGE_SIZE: usize = 100;

// ============================================================================
// Envelopes
// ============================================================================

/// Response metadata.
#[derive(Debug, Serialize)]
pub struct Meta {
    /// Unique ID for this response.
    pub request_id: String,
    /// When the response was built.
    pub ts: DateTime<Utc>,
}

impl Meta {
    fn now() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
        }
    }
}

/// Single-resource response body.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    /// The resource.
    pub data: T,
    /// Response metadata.
    pub meta: Meta,
}

/// Pagination block for list responses.
#[derive(Debug, Serialize)]
pub struct Pagination {
    /// Matching rows across all pages.
    pub total: usize,
    /// Page size used.
    pub limit: usize,
    /// Rows skipped.
    pub offset: usize,
    /// Whether another page follows.
    pub has_more: bool,
}

/// List response body.
#[derive(Debug, Serialize)]
pub struct ListEnvelope<T> {
    /// The page of resources.
    pub data: Vec<T>,
    /// Position of this page.
    pub pagination: Pagination,
    /// Response metadata.
    pub meta: Meta,
}

/// Deletion acknowledgement.
#[derive(Debug, Serialize)]
pub struct Deleted<T> {
    /// ID of the removed resource.
    pub id: T,
    /// Always `true`.
    pub deleted: bool,
}

/// Wrap `data` in a 200 envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        data,
        meta: Meta::now(),
    })
}

/// Wrap `data` in a 201 envelope.
pub fn created<T: Serialize>(data: T) -> (StatusCode, Json<Envelope<T>>) {
    (StatusCode::CREATED, ok(data))
}

/// Wrap a store page in a list envelope.
pub fn paged<T: Serialize>(page: Paged<T>, request: Page) -> Json<ListEnvelope<T>> {
    let has_more = request.offset + page.items.len() < page.total;
    Json(ListEnvelope {
        data: page.items,
        pagination: Pagination {
            total: page.total,
            limit: request.limit,
            offset: request.offset,
            has_more,
        },
        meta: Meta::now(),
    })
}

/// Wrap an unpaginated list, slicing it in memory.
pub fn listed<T: Serialize>(items: Vec<T>, request: Page) -> Json<ListEnvelope<T>> {
    let total = items.len();
    let items = items
        .into_iter()
        .skip(request.offset)
        .take(request.limit)
        .collect();
    paged(Paged { items, total }, request)
}

// ============================================================================
// Query parameters
// ============================================================================

/// `limit`/`offset` query parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    /// Page size (default 50, at most 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Rows to skip.
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl PageQuery {
    /// The store page, with the limit clamped to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn page(self) -> Page {
        Page {
            limit: self.limit.clamp(1, MAX_PAGE_SIZE),
            offset: self.offset,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Require `value` to be between `min` and `max` characters.
pub fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), ApiError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(ApiError::Validation(format!(
            "{field} must be {min}-{max} characters"
        )));
    }
    Ok(())
}

/// Require an optional `value` to be at most `max` characters.
pub fn check_max_len(field: &str, value: Option<&str>, max: usize) -> Result<(), ApiError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ApiError::Validation(format!(
            "{field} must be at most {max} characters"
        ))),
        _ => Ok(()),
    }
}

/// Require an `https://` URL.
pub fn check_https(field: &str, url: &str) -> Result<(), ApiError> {
    if url.starts_with("https://") && url.len() > "https://".len() {
        Ok(())
    } else {
        Err(ApiError::Validation(format!("{field} must be an https URL")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_limit_is_clamped() {
        let page = PageQuery {
            limit: 1000,
            offset: 5,
        }
        .page();
        assert_eq!(page.limit, MAX_PAGE_SIZE);
        assert_eq!(page.offset, 5);
        assert_eq!(PageQuery { limit: 0, offset: 0 }.page().limit, 1);
    }

    #[test]
    fn listed_reports_has_more() {
        let page = Page {
            limit: 2,
            offset: 0,
        };
        let Json(body) = listed(vec![1, 2, 3], page);
        assert_eq!(body.data, vec![1, 2]);
        assert_eq!(body.pagination.total, 3);
        assert!(body.pagination.has_more);

        let Json(body) = listed(
            vec![1, 2, 3],
            Page {
                limit: 2,
                offset: 2,
            },
        );
        assert_eq!(body.data, vec![3]);
        assert!(!body.pagination.has_more);
    }

    #[test]
    fn validators() {
        assert!(check_len("name", "", 1, 100).is_err());
        assert!(check_len("name", "ok", 1, 100).is_ok());
        assert!(check_max_len("description", Some("abc"), 2).is_err());
        assert!(check_max_len("description", None, 2).is_ok());
        assert!(check_https("url", "https://example.com/hook").is_ok());
        assert!(check_https("url", "http://example.com/hook").is_err());
        assert!(check_https("url", "https://").is_err());
    }
}
