//! Core Types for the Aggregation Engine
//!
//! Defines the data contracts shared by every stage of a lookup:
//! - **Providers:** `ProviderId`, `BookIdentifier`, `PartialBook`
//! - **Merge output:** `Book` with field-level `Provenance`
//! - **Lookups:** `LookupIntent`, `SearchQuery`, `LookupFilters`, `QueryFingerprint`
//! - **Errors:** `ProviderError`, `AggregationError`, `LookupError`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::normalize;

// ============================================================================
// Providers and Identifiers
// ============================================================================

/// External metadata source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Commerce catalog API (chapter and timing capable)
    Catalog,
    /// Public storefront search API
    Storefront,
    /// Community ratings site (scraped)
    Ratings,
    /// Publisher API (ISBN keyed)
    Publisher,
}

impl ProviderId {
    pub const ALL: [ProviderId; 4] = [
        ProviderId::Catalog,
        ProviderId::Storefront,
        ProviderId::Ratings,
        ProviderId::Publisher,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Storefront => "storefront",
            Self::Ratings => "ratings",
            Self::Publisher => "publisher",
        }
    }

    /// Default weight of this provider's rating in the weighted average
    pub fn default_trust_weight(self) -> f64 {
        match self {
            Self::Ratings => 1.0,
            Self::Catalog => 0.8,
            Self::Publisher => 0.6,
            Self::Storefront => 0.5,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "catalog" => Ok(Self::Catalog),
            "storefront" => Ok(Self::Storefront),
            "ratings" => Ok(Self::Ratings),
            "publisher" => Ok(Self::Publisher),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Provider-namespaced identifier, rendered as `<provider>:<value>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BookIdentifier {
    pub provider: ProviderId,
    pub value: String,
}

impl BookIdentifier {
    pub fn new(provider: ProviderId, value: impl Into<String>) -> Self {
        Self {
            provider,
            value: value.into().trim().to_string(),
        }
    }

    /// True for a 13 digit value (ISBN-13 / EAN)
    pub fn is_isbn13(&self) -> bool {
        self.value.len() == 13 && self.value.chars().all(|c| c.is_ascii_digit())
    }
}

impl fmt::Display for BookIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.value)
    }
}

impl FromStr for BookIdentifier {
    type Err = String;

    /// Accepts `provider:value`, or a bare value whose namespace is inferred:
    /// ASIN (`B0` + 8) -> catalog, 13 digits -> publisher, `GR-<n>` -> ratings,
    /// other digits -> storefront.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty identifier".to_string());
        }

        if let Some((ns, value)) = s.split_once(':') {
            let provider = ProviderId::from_str(ns)?;
            if value.trim().is_empty() {
                return Err(format!("identifier has no value: {}", s));
            }
            return Ok(Self::new(provider, value));
        }

        if s.len() == 10 && s.starts_with("B0") && s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Ok(Self::new(ProviderId::Catalog, s));
        }
        if let Some(rest) = s.strip_prefix("GR-") {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                return Ok(Self::new(ProviderId::Ratings, rest));
            }
        }
        if s.chars().all(|c| c.is_ascii_digit()) {
            let provider = if s.len() == 13 {
                ProviderId::Publisher
            } else {
                ProviderId::Storefront
            };
            return Ok(Self::new(provider, s));
        }

        Err(format!("cannot infer provider for identifier: {}", s))
    }
}

impl TryFrom<String> for BookIdentifier {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BookIdentifier> for String {
    fn from(id: BookIdentifier) -> Self {
        id.to_string()
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_offset_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub sequence: Option<String>,
}

/// Cover art candidate with its declared resolution (longest edge, px)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverImage {
    pub url: String,
    pub resolution: u32,
}

/// One provider's normalized contribution prior to merge
///
/// `chapters` is `None` when the provider does not supply chapter data at
/// all, and `Some(vec![])` only when it positively reports no chapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialBook {
    pub provider: ProviderId,
    pub identifiers: BTreeSet<BookIdentifier>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub authors: Vec<String>,
    pub narrators: Vec<String>,
    pub runtime_secs: Option<u64>,
    pub chapters: Option<Vec<Chapter>>,
    pub cover: Option<CoverImage>,
    pub rating: Option<f64>,
    pub rating_count: Option<u64>,
    pub language: Option<String>,
    pub publication_year: Option<i32>,
    pub series: Option<Series>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub genres: Vec<String>,
}

impl PartialBook {
    pub fn new(provider: ProviderId, id: impl Into<String>) -> Self {
        let mut identifiers = BTreeSet::new();
        identifiers.insert(BookIdentifier::new(provider, id));
        Self {
            provider,
            identifiers,
            title: None,
            subtitle: None,
            authors: Vec::new(),
            narrators: Vec::new(),
            runtime_secs: None,
            chapters: None,
            cover: None,
            rating: None,
            rating_count: None,
            language: None,
            publication_year: None,
            series: None,
            publisher: None,
            description: None,
            genres: Vec::new(),
        }
    }

    /// Title normalized for identity comparison
    pub fn match_title(&self) -> Option<String> {
        self.title
            .as_deref()
            .map(normalize::normalize_title)
            .filter(|t| !t.is_empty())
    }

    /// Author names normalized for overlap comparison
    pub fn match_authors(&self) -> BTreeSet<String> {
        self.authors
            .iter()
            .map(|a| normalize::normalize_name(a))
            .filter(|a| !a.is_empty())
            .collect()
    }
}

/// Alternative value that lost a field-level conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAlternative {
    pub field: String,
    pub provider: ProviderId,
    pub value: String,
}

/// Which provider supplied each winning field value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Every provider that contributed a partial record
    pub sources: BTreeSet<ProviderId>,
    pub fields: BTreeMap<String, ProviderId>,
    pub alternatives: Vec<FieldAlternative>,
}

/// Canonical merged record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub identifiers: BTreeSet<BookIdentifier>,
    pub title: String,
    pub subtitle: Option<String>,
    pub authors: Vec<String>,
    pub narrators: Vec<String>,
    pub runtime_secs: Option<u64>,
    pub chapters: Vec<Chapter>,
    pub cover_url: Option<String>,
    /// `None` when no provider reported a rating; 0.0 is a real rating
    pub rating: Option<f64>,
    pub rating_count: Option<u64>,
    pub language: Option<String>,
    pub publication_year: Option<i32>,
    pub series: Option<Series>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub genres: Vec<String>,
    pub provenance: Provenance,
    pub last_refreshed: DateTime<Utc>,
}

impl Book {
    /// First identifier in canonical order (the set is never empty)
    pub fn primary_identifier(&self) -> Option<&BookIdentifier> {
        self.identifiers.iter().next()
    }

    pub fn has_identifier(&self, id: &BookIdentifier) -> bool {
        self.identifiers.contains(id)
    }

    /// Providers whose partial records went into this book
    pub fn contributing_providers(&self) -> &BTreeSet<ProviderId> {
        &self.provenance.sources
    }
}

// ============================================================================
// Lookups
// ============================================================================

/// Optional narrowing applied to search lookups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupFilters {
    /// Two-letter language code
    pub language: Option<String>,
    pub min_rating: Option<f64>,
    /// Restrict fanout to these providers
    pub providers: Option<BTreeSet<ProviderId>>,
    /// Maximum number of merged books returned
    pub limit: Option<usize>,
}

impl LookupFilters {
    fn fingerprint_suffix(&self) -> String {
        let mut parts = Vec::new();
        if let Some(lang) = &self.language {
            parts.push(format!("lang={}", normalize::normalize_language(lang)));
        }
        if let Some(min) = self.min_rating {
            parts.push(format!("min_rating={:.2}", min));
        }
        if let Some(providers) = &self.providers {
            let names: Vec<&str> = providers.iter().map(|p| p.as_str()).collect();
            parts.push(format!("providers={}", names.join(",")));
        }
        if let Some(limit) = self.limit {
            parts.push(format!("limit={}", limit));
        }
        parts.join("|")
    }
}

/// Free-text search parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub title: Option<String>,
    pub author: Option<String>,
    pub isbn: Option<String>,
    #[serde(default)]
    pub filters: LookupFilters,
}

impl SearchQuery {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn isbn(isbn: impl Into<String>) -> Self {
        Self {
            isbn: Some(isbn.into()),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_filters(mut self, filters: LookupFilters) -> Self {
        self.filters = filters;
        self
    }

    /// At least one of title, author or isbn must carry text
    pub fn validate(&self) -> Result<(), LookupError> {
        let has_text = |v: &Option<String>| v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
        if has_text(&self.title) || has_text(&self.author) || has_text(&self.isbn) {
            Ok(())
        } else {
            Err(LookupError::InvalidQuery(
                "search requires a title, author or isbn".to_string(),
            ))
        }
    }

    /// Free-text term for providers with a single query box
    pub fn search_term(&self) -> String {
        if let Some(isbn) = self.isbn.as_deref().filter(|s| !s.trim().is_empty()) {
            return isbn.trim().to_string();
        }
        let parts: Vec<&str> = [self.title.as_deref(), self.author.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        normalize::collapse_whitespace(&parts.join(" "))
    }

    /// Normalized key: `title|author`, then `isbn:` and non-default filters
    pub fn normalized_key(&self) -> String {
        let title = self
            .title
            .as_deref()
            .map(normalize::normalize_title)
            .unwrap_or_default();
        let author = self
            .author
            .as_deref()
            .map(normalize::normalize_name)
            .unwrap_or_default();

        let mut key = format!("{}|{}", title, author);
        if let Some(isbn) = self.isbn.as_deref().filter(|s| !s.trim().is_empty()) {
            let digits: String = isbn.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            key.push_str(&format!("|isbn:{}", digits.to_ascii_lowercase()));
        }
        let suffix = self.filters.fingerprint_suffix();
        if !suffix.is_empty() {
            key.push('|');
            key.push_str(&suffix);
        }
        key
    }

    pub fn fingerprint(&self) -> QueryFingerprint {
        QueryFingerprint::from_key(&self.normalized_key())
    }
}

/// Deterministic hash of normalized search parameters (fast-tier key only)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryFingerprint(String);

impl QueryFingerprint {
    pub fn from_key(normalized_key: &str) -> Self {
        let digest = Sha256::digest(normalized_key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the caller wants resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LookupIntent {
    Search(SearchQuery),
    Identifier { id: BookIdentifier },
}

impl LookupIntent {
    pub fn identifier(id: BookIdentifier) -> Self {
        Self::Identifier { id }
    }

    /// Key used for single-flight and logging
    pub fn flight_key(&self) -> String {
        match self {
            Self::Search(query) => format!("search:{}", query.fingerprint()),
            Self::Identifier { id } => format!("id:{}", id),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Per-adapter failure; absorbed at fanout, never surfaced raw
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// Provider answered but has nothing for this request
    #[error("not found")]
    NotFound,

    /// Provider down, refused credentials or returned garbage
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Provider did not answer within its budget
    #[error("timed out")]
    Timeout,

    /// Provider asked us to back off
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
}

impl ProviderError {
    /// Whether this outcome counts against the provider's circuit breaker
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::NotFound)
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout => "timeout",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Lookup-level failure once every candidate provider has been exhausted
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("all providers failed: {}", summarize_failures(.failures))]
    AllProvidersFailed { failures: Vec<(ProviderId, ProviderError)> },

    /// Every provider is disabled, filtered out or behind an open circuit
    #[error("no provider available for this lookup")]
    NoActiveProviders,

    /// The in-flight computation this request was waiting on vanished
    #[error("in-flight lookup abandoned")]
    FlightAbandoned,
}

fn summarize_failures(failures: &[(ProviderId, ProviderError)]) -> String {
    failures
        .iter()
        .map(|(p, e)| format!("{}={}", p, e))
        .collect::<Vec<_>>()
        .join(", ")
}

/// User-visible lookup outcome other than a Book
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupError {
    #[error("no matching book")]
    NotFound,

    #[error("temporarily unavailable, retry later: {0}")]
    Unavailable(#[from] AggregationError),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}
