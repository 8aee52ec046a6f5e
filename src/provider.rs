//! Item-data provider seam and the REST implementation.
//!
//! Backends disagree on field names (`total` vs `totalCount`, `created_at` vs
//! `timestamp`, bare arrays vs `{ "items": [...] }`). All of that tolerance lives in
//! the `Raw*` types below; everything past this module sees only the canonical
//! [`AggregateSnapshot`] and [`Item`].

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde::de::IgnoredAny;
use tracing::debug;

use crate::reqwest_simd_json::{ResponseSimdJsonExt, parse_json_slice};
use crate::types::{AggregateSnapshot, Item, Scope};

/// Source of authoritative aggregates and raw items.
#[async_trait]
pub trait ItemProvider: Send + Sync {
    /// Authoritative counts for `scope`.
    async fn fetch_aggregate_snapshot(&self, scope: &Scope) -> Result<AggregateSnapshot>;

    /// Every item for `scope`, used for derived metrics. Streaks have no
    /// lower bound, so the list is not narrowed by date.
    async fn fetch_item_list(&self, scope: &Scope) -> Result<Vec<Item>>;
}

// ============================================================================
// Boundary normalization
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RawSnapshot {
    #[serde(rename = "totalCount")]
    total_count_camel: Option<u64>,
    total_count: Option<u64>,
    total: Option<u64>,
    count: Option<u64>,

    #[serde(rename = "windowCount")]
    window_count_camel: Option<u64>,
    window_count: Option<u64>,
    #[serde(rename = "weekCount")]
    week_count_camel: Option<u64>,
    week_count: Option<u64>,
    #[serde(rename = "thisWeek")]
    this_week: Option<u64>,

    /// Some deployments wrap the counts in an envelope.
    stats: Option<Box<RawSnapshot>>,
    data: Option<Box<RawSnapshot>>,
}

impl From<RawSnapshot> for AggregateSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        let inner: AggregateSnapshot = raw
            .stats
            .or(raw.data)
            .map(|nested| AggregateSnapshot::from(*nested))
            .unwrap_or_default();

        Self {
            total_count: raw
                .total_count_camel
                .or(raw.total_count)
                .or(raw.total)
                .or(raw.count)
                .unwrap_or(inner.total_count),
            window_count: raw
                .window_count_camel
                .or(raw.window_count)
                .or(raw.week_count_camel)
                .or(raw.week_count)
                .or(raw.this_week)
                .unwrap_or(inner.window_count),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
    Other(IgnoredAny),
}

impl RawId {
    fn resolve(self) -> Option<String> {
        match self {
            Self::Text(s) if !s.trim().is_empty() => Some(s),
            Self::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Rfc3339(DateTime<Utc>),
    EpochMillis(i64),
    Other(IgnoredAny),
}

impl RawTimestamp {
    fn resolve(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Rfc3339(ts) => Some(ts),
            Self::EpochMillis(ms) => Utc.timestamp_millis_opt(ms).single(),
            Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RawItem {
    id: Option<RawId>,
    #[serde(rename = "_id")]
    underscore_id: Option<RawId>,

    timestamp: Option<RawTimestamp>,
    #[serde(rename = "createdAt")]
    created_at_camel: Option<RawTimestamp>,
    created_at: Option<RawTimestamp>,
    date: Option<RawTimestamp>,

    category: Option<String>,
    author: Option<String>,
    source: Option<String>,

    flags: Option<Vec<String>>,
    #[serde(rename = "isFavorite")]
    is_favorite_camel: Option<bool>,
    favorite: Option<bool>,
}

impl RawItem {
    /// Canonical item, or `None` when the record has no usable id or timestamp.
    fn normalize(self) -> Option<Item> {
        // First spelling that resolves wins; an unreadable one falls through.
        let id = [self.id, self.underscore_id]
            .into_iter()
            .flatten()
            .find_map(RawId::resolve)?;
        let timestamp = [
            self.timestamp,
            self.created_at_camel,
            self.created_at,
            self.date,
        ]
        .into_iter()
        .flatten()
        .find_map(RawTimestamp::resolve)?;

        let mut flags = self.flags.unwrap_or_default();
        if self.is_favorite_camel.or(self.favorite).unwrap_or(false)
            && !flags.iter().any(|f| f == "favorite")
        {
            flags.push("favorite".to_string());
        }

        Some(Item {
            id,
            timestamp,
            category: self.category.or(self.author).or(self.source),
            flags,
        })
    }
}

/// One list element. Anything that does not deserialize as an item (a wrongly
/// typed field, a bare string) is kept as `Malformed` and dropped on
/// normalization instead of failing the whole list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Item(RawItem),
    Malformed(IgnoredAny),
}

impl RawEntry {
    fn normalize(self) -> Option<Item> {
        match self {
            Self::Item(raw) => raw.normalize(),
            Self::Malformed(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawItemList {
    Bare(Vec<RawEntry>),
    Wrapped {
        #[serde(alias = "data", alias = "quotes")]
        items: Vec<RawEntry>,
    },
}

impl RawItemList {
    pub(crate) fn into_items(self) -> Vec<Item> {
        let raw = match self {
            Self::Bare(items) | Self::Wrapped { items } => items,
        };
        let total = raw.len();
        let items: Vec<Item> = raw.into_iter().filter_map(RawEntry::normalize).collect();
        if items.len() < total {
            debug!(
                dropped = total - items.len(),
                "skipped malformed items or items without id or timestamp"
            );
        }
        items
    }
}

/// Normalize a snapshot body of any supported shape.
pub fn normalize_snapshot(body: &mut [u8]) -> Result<AggregateSnapshot> {
    let raw: RawSnapshot = parse_json_slice(body)?;
    Ok(raw.into())
}

/// Normalize an item-list body of any supported shape.
pub fn normalize_items(body: &mut [u8]) -> Result<Vec<Item>> {
    let raw: RawItemList = parse_json_slice(body)?;
    Ok(raw.into_items())
}

// ============================================================================
// REST provider
// ============================================================================

static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Shared HTTP client with connection pooling.
pub fn get_http_client() -> &'static reqwest::Client {
    HTTP_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

fn parse_json_error(body: &[u8]) -> Option<String> {
    if !body.iter().copied().find(|b| !b.is_ascii_whitespace()).is_some_and(|b| b == b'{') {
        return None;
    }
    let mut body = body.to_vec();
    parse_json_slice::<ErrorResponse>(&mut body)
        .ok()
        .map(|e| e.error)
}

fn describe_status(status: reqwest::StatusCode, body: &[u8]) -> String {
    let parsed = parse_json_error(body);
    match status.as_u16() {
        401 => "Unauthorized".to_string(),
        403 => "Invalid API token".to_string(),
        404 => "Stats endpoint not found".to_string(),
        429 => "Rate limited".to_string(),
        500 => "Server error".to_string(),
        502 => "Bad gateway".to_string(),
        503 => "Service unavailable".to_string(),
        504 => "Gateway timeout".to_string(),
        code => parsed.unwrap_or_else(|| format!("Error {code}")),
    }
}

/// Talks to the stats backend over HTTP.
#[derive(Debug, Clone)]
pub struct HttpItemProvider {
    base_url: Url,
    api_token: String,
}

impl HttpItemProvider {
    pub fn new(base_url: &str, api_token: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid server URL: {base_url}"))?;
        Ok(Self {
            base_url,
            api_token: api_token.into(),
        })
    }

    fn endpoint(&self, path: &str, scope: &Scope) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .with_context(|| format!("Invalid endpoint path: {path}"))?;
        url.query_pairs_mut().append_pair("user", scope.as_str());
        Ok(url)
    }

    async fn send(&self, url: Url) -> Result<reqwest::Response> {
        let mut request = get_http_client()
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json");
        if !self.api_token.is_empty() {
            request = request.bearer_auth(&self.api_token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            anyhow::bail!("{}", describe_status(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ItemProvider for HttpItemProvider {
    async fn fetch_aggregate_snapshot(&self, scope: &Scope) -> Result<AggregateSnapshot> {
        let url = self.endpoint("api/stats", scope)?;
        debug!(%url, "fetching aggregate snapshot");
        let raw: RawSnapshot = self
            .send(url)
            .await?
            .simd_json()
            .await
            .context("Failed to read aggregate snapshot")?;
        Ok(raw.into())
    }

    async fn fetch_item_list(&self, scope: &Scope) -> Result<Vec<Item>> {
        let url = self.endpoint("api/items", scope)?;
        debug!(%url, "fetching item list");
        let raw: RawItemList = self
            .send(url)
            .await?
            .simd_json()
            .await
            .context("Failed to read item list")?;
        Ok(raw.into_items())
    }
}
