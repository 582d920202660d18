//! Test-history API — listing and deleting recorded test runs.
//!
//! | Operation        | HTTP                                                      |
//! |------------------|-----------------------------------------------------------|
//! | [`HistoryApi::list`]         | `GET /api/test/history?<query>`               |
//! | [`HistoryApi::delete`]       | `DELETE /api/test/history/{id}`               |
//! | [`HistoryApi::delete_batch`] | `DELETE /api/test/history/batch` + `{ "sessionIds": [...] }` |
//!
//! Listing goes through the [`RequestCache`], keyed by
//! [`QueryParams::cache_key`]. Deletes bypass it and invalidate it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Deserializer, Serialize};

use crate::cache::{CacheKey, RequestCache};
use crate::config::{ClientConfig, ConfigError};
use crate::fetch::{FetchAdapter, FetchError};

pub const HISTORY_PATH: &str = "/api/test/history";

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filters, pagination and sort for one history listing.
///
/// # Examples
///
/// ```
/// use testhist::history::{QueryParams, SortOrder};
///
/// let params = QueryParams::new()
///     .page(2)
///     .page_size(20)
///     .search("checkout flow")
///     .sort("createdAt", SortOrder::Desc);
///
/// assert_eq!(
///     params.to_query_string(),
///     "page=2&limit=20&search=checkout%20flow&sortBy=createdAt&sortOrder=desc"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub search: Option<String>,
    pub status: Option<String>,
    pub date_filter: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<SortOrder>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn date_filter(mut self, filter: impl Into<String>) -> Self {
        self.date_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn sort(mut self, by: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = Some(by.into());
        self.sort_order = Some(order);
        self
    }

    /// Wire query string. Empty string filters are left out.
    pub fn to_query_string(&self) -> String {
        self.encode(false)
    }

    /// Request target for this listing.
    pub fn target(&self) -> String {
        let query = self.to_query_string();
        if query.is_empty() {
            HISTORY_PATH.to_owned()
        } else {
            format!("{HISTORY_PATH}?{query}")
        }
    }

    /// Deterministic key for this exact parameter set.
    ///
    /// Unlike the wire query, an empty filter is kept, so `search: None` and
    /// `search: Some("")` never share an entry.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(format!("history?{}", self.encode(true)))
    }

    fn encode(&self, keep_empty: bool) -> String {
        let page = self.page.map(|p| p.to_string());
        let limit = self.page_size.map(|p| p.to_string());
        let fields: [(&str, Option<&str>); 7] = [
            ("page", page.as_deref()),
            ("limit", limit.as_deref()),
            ("search", self.search.as_deref()),
            ("status", self.status.as_deref()),
            ("dateFilter", self.date_filter.as_deref()),
            ("sortBy", self.sort_by.as_deref()),
            ("sortOrder", self.sort_order.map(SortOrder::as_str)),
        ];

        fields
            .iter()
            .filter_map(|(name, value)| {
                let value = (*value)?;
                if value.is_empty() && !keep_empty {
                    return None;
                }
                Some(format!("{name}={}", utf8_percent_encode(value, COMPONENT)))
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// One recorded test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub test_name: Option<String>,
    #[serde(default)]
    pub test_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Fields this client does not model, kept as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub total: u64,
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub total_pages: Option<u32>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            total: 0,
            page: first_page(),
            limit: None,
            total_pages: None,
        }
    }
}

fn first_page() -> u32 {
    1
}

/// One page of history as returned in the envelope's `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub tests: Vec<TestRecord>,
    #[serde(default)]
    pub pagination: Pagination,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct DeleteResult {
    #[serde(rename = "deletedCount")]
    deleted_count: Option<u64>,
}

#[derive(Debug, Serialize)]
struct BatchDelete<'a> {
    #[serde(rename = "sessionIds")]
    session_ids: &'a [String],
}

/// Cache of listing results, shared as `Arc` so every waiter gets the same page.
pub type HistoryCache = RequestCache<Arc<HistoryPage>, FetchError>;

/// Typed client for the history endpoints.
#[derive(Clone)]
pub struct HistoryApi {
    adapter: FetchAdapter,
    cache: HistoryCache,
}

impl HistoryApi {
    pub fn new(adapter: FetchAdapter, cache: HistoryCache) -> Self {
        Self { adapter, cache }
    }

    /// Builds a TCP-backed client with a fresh cache.
    ///
    /// # Errors
    ///
    /// Returns the validation error for an unusable configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        let adapter = FetchAdapter::from_config(config)?;
        Ok(Self::new(adapter, RequestCache::new(config.cache_config())))
    }

    pub fn cache(&self) -> &HistoryCache {
        &self.cache
    }

    /// Lists history. Identical concurrent calls share one request.
    pub async fn list(&self, params: &QueryParams) -> Result<Arc<HistoryPage>, FetchError> {
        let key = params.cache_key();
        let target = params.target();
        let adapter = self.adapter.clone();

        self.cache
            .get_or_fetch(key, move || async move {
                adapter.get_json::<HistoryPage>(&target).await.map(Arc::new)
            })
            .await
    }

    /// Deletes one record. Returns the number of records removed.
    pub async fn delete(&self, id: &str) -> Result<u64, FetchError> {
        if id.trim().is_empty() {
            return Err(FetchError::InvalidRequest("record id is empty".to_owned()));
        }
        let target = format!("{HISTORY_PATH}/{}", utf8_percent_encode(id, COMPONENT));
        let outcome = self.adapter.delete_json::<DeleteResult>(&target).await;
        self.cache.clear_all();

        Ok(outcome?.and_then(|r| r.deleted_count).unwrap_or(1))
    }

    /// Deletes several records in one call. Returns the number removed.
    pub async fn delete_batch(&self, ids: &[String]) -> Result<u64, FetchError> {
        if ids.is_empty() {
            return Err(FetchError::InvalidRequest("no record ids given".to_owned()));
        }
        let target = format!("{HISTORY_PATH}/batch");
        let body = BatchDelete { session_ids: ids };
        let outcome = self
            .adapter
            .delete_json_with_body::<_, DeleteResult>(&target, &body)
            .await;
        self.cache.clear_all();

        let fallback = u64::try_from(ids.len()).unwrap_or(u64::MAX);
        Ok(outcome?.and_then(|r| r.deleted_count).unwrap_or(fallback))
    }
}
