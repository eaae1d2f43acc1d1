//! Publisher API adapter
//!
//! Search: `GET {base}/search/views/search-display?q=..&docType=audiobook`
//! Detail: `GET {base}/titles/{isbn}/views/product-display`
//! Requires an API key; without one every call is `Unavailable`.

use super::http::{ProviderHttp, USER_AGENT};
use super::BookProvider;
use crate::config::ProviderConfig;
use crate::normalize;
use crate::types::{
    CoverImage, LookupIntent, PartialBook, ProviderError, ProviderId, SearchQuery, Series,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const COVER_BASE_URL: &str = "https://images.randomhouse.com/cover";
const COVER_RESOLUTION: u32 = 500;

#[derive(Debug, Deserialize)]
struct PublisherEnvelope {
    data: Option<PublisherData>,
}

#[derive(Debug, Deserialize)]
struct PublisherData {
    titles: Option<Vec<PublisherTitle>>,
    results: Option<Vec<PublisherTitle>>,
}

impl PublisherEnvelope {
    fn into_titles(self) -> Vec<PublisherTitle> {
        match self.data {
            Some(data) => data.titles.or(data.results).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

/// Raw publisher title; numeric fields arrive as numbers or strings
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherTitle {
    #[serde(default)]
    pub isbn: serde_json::Value,
    pub titleweb: Option<String>,
    pub subtitle: Option<String>,
    pub authorweb: Option<String>,
    pub flapcopy: Option<String>,
    pub series: Option<String>,
    #[serde(default)]
    pub seriesnumber: serde_json::Value,
    pub onsaledate: Option<String>,
    pub imprint: Option<String>,
}

fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// "Weir, Andy" -> "Andy Weir"; anything else is returned trimmed
pub fn flip_sort_name(name: &str) -> String {
    let parts: Vec<&str> = name.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [last, first] if !last.is_empty() && !first.is_empty() => format!("{} {}", first, last),
        _ => normalize::collapse_whitespace(name),
    }
}

pub fn normalize_title(title: &PublisherTitle) -> Option<PartialBook> {
    let isbn = value_to_string(&title.isbn)?;

    let mut book = PartialBook::new(ProviderId::Publisher, &isbn);
    book.title = normalize::non_empty(title.titleweb.as_deref());
    book.subtitle = normalize::non_empty(title.subtitle.as_deref());
    book.authors = title
        .authorweb
        .as_deref()
        .map(|a| normalize::clean_names([flip_sort_name(a)]))
        .unwrap_or_default();
    book.description = title
        .flapcopy
        .as_deref()
        .map(normalize::unescape_html)
        .filter(|d| !d.is_empty());
    book.series = normalize::non_empty(title.series.as_deref()).map(|name| Series {
        name,
        sequence: value_to_string(&title.seriesnumber),
    });
    book.publication_year = title.onsaledate.as_deref().and_then(normalize::extract_year);
    book.publisher = normalize::non_empty(title.imprint.as_deref());
    book.cover = Some(CoverImage {
        url: format!("{}/{}", COVER_BASE_URL, isbn),
        resolution: COVER_RESOLUTION,
    });
    Some(book)
}

pub struct PublisherProvider {
    http: ProviderHttp,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    search_limit: usize,
}

impl PublisherProvider {
    pub fn new(config: &ProviderConfig) -> libris_common::Result<Self> {
        Ok(Self {
            http: ProviderHttp::new(ProviderId::Publisher, config.requests_per_second, USER_AGENT)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout: config.timeout(),
            search_limit: config.search_limit,
        })
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable("publisher API key not configured".to_string()))
    }

    fn headers() -> Vec<(&'static str, String)> {
        vec![("Accept", "application/json".to_string())]
    }

    async fn search(&self, query: &SearchQuery, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!("{}/search/views/search-display", self.base_url);
        let params = [
            ("api_key", api_key.to_string()),
            ("q", query.search_term()),
            ("rows", self.search_limit.to_string()),
            ("docType", "audiobook".to_string()),
            ("sort", "relevancy".to_string()),
        ];
        let envelope: PublisherEnvelope = self.http.get_json(&url, &params, &Self::headers(), timeout).await?;
        Ok(envelope.into_titles().iter().filter_map(normalize_title).collect())
    }

    async fn detail(&self, isbn: &str, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!(
            "{}/titles/{}/views/product-display",
            self.base_url,
            urlencoding::encode(isbn)
        );
        let params = [("api_key", api_key.to_string())];
        let envelope: PublisherEnvelope = self.http.get_json(&url, &params, &Self::headers(), timeout).await?;
        match envelope.into_titles().first().and_then(normalize_title) {
            Some(book) => Ok(vec![book]),
            None => Err(ProviderError::NotFound),
        }
    }
}

#[async_trait]
impl BookProvider for PublisherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Publisher
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Accepts its own namespace plus any ISBN-13 shaped identifier
    fn supports(&self, intent: &LookupIntent) -> bool {
        match intent {
            LookupIntent::Search(_) => true,
            LookupIntent::Identifier { id } => id.provider == ProviderId::Publisher || id.is_isbn13(),
        }
    }

    async fn fetch(&self, intent: &LookupIntent, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        match intent {
            LookupIntent::Search(query) => self.search(query, timeout).await,
            LookupIntent::Identifier { id } if self.supports(intent) => self.detail(&id.value, timeout).await,
            LookupIntent::Identifier { .. } => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookIdentifier;

    #[test]
    fn test_normalize_search_display() {
        let json = r#"{"status":"ok","data":{"titles":[
            {"isbn": 9780593135204, "titleweb": "Project Hail Mary", "subtitle": "A Novel",
             "authorweb": "Weir, Andy", "flapcopy": "<p>Ryland Grace is the sole survivor&#39;s story</p>",
             "series": null, "onsaledate": "2021-05-04T00:00:00", "imprint": "Ballantine Books"}
        ]}}"#;
        let envelope: PublisherEnvelope = serde_json::from_str(json).unwrap();
        let books: Vec<PartialBook> = envelope.into_titles().iter().filter_map(normalize_title).collect();
        assert_eq!(books.len(), 1);

        let book = &books[0];
        assert!(book
            .identifiers
            .contains(&BookIdentifier::new(ProviderId::Publisher, "9780593135204")));
        assert_eq!(book.authors, vec!["Andy Weir".to_string()]);
        assert_eq!(book.subtitle.as_deref(), Some("A Novel"));
        assert_eq!(book.publication_year, Some(2021));
        assert_eq!(book.publisher.as_deref(), Some("Ballantine Books"));
        assert_eq!(book.description.as_deref(), Some("Ryland Grace is the sole survivor's story"));
        assert_eq!(
            book.cover.as_ref().map(|c| c.url.as_str()),
            Some("https://images.randomhouse.com/cover/9780593135204")
        );
    }

    #[test]
    fn test_results_key_and_series_number() {
        let json = r#"{"data":{"results":[
            {"isbn": "9780441013593", "titleweb": "Dune", "authorweb": "Frank Herbert",
             "series": "Dune Chronicles", "seriesnumber": 1}
        ]}}"#;
        let envelope: PublisherEnvelope = serde_json::from_str(json).unwrap();
        let book = normalize_title(&envelope.into_titles()[0]).unwrap();
        assert_eq!(
            book.series,
            Some(Series {
                name: "Dune Chronicles".to_string(),
                sequence: Some("1".to_string())
            })
        );
        assert_eq!(book.authors, vec!["Frank Herbert".to_string()]);
    }

    #[test]
    fn test_flip_sort_name() {
        assert_eq!(flip_sort_name("Weir, Andy"), "Andy Weir");
        assert_eq!(flip_sort_name("Andy Weir"), "Andy Weir");
        assert_eq!(flip_sort_name("Le Guin, Ursula K."), "Ursula K. Le Guin");
    }

    #[test]
    fn test_supports_isbn_shaped_identifiers() {
        let provider = PublisherProvider::new(&ProviderConfig::with_base_url("http://localhost")).unwrap();
        let isbn = LookupIntent::identifier(BookIdentifier::new(ProviderId::Storefront, "9780593135204"));
        let asin = LookupIntent::identifier(BookIdentifier::new(ProviderId::Catalog, "B08G9PRS1K"));
        assert!(provider.supports(&isbn));
        assert!(!provider.supports(&asin));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_unavailable() {
        let provider = PublisherProvider::new(&ProviderConfig::with_base_url("http://localhost")).unwrap();
        let result = provider
            .fetch(&LookupIntent::Search(SearchQuery::title("Dune")), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
    }
}
