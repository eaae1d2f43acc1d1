//! Commerce catalog adapter
//!
//! Search: `GET {base}/catalog/products?title=..&author=..`
//! Detail: `GET {base}/catalog/products/{asin}` plus chapter data from the
//! chapter service (`GET {chapters_url}/books/{asin}/chapters`). The only
//! chapter-capable provider.

use super::http::{ProviderHttp, USER_AGENT};
use super::BookProvider;
use crate::config::ProviderConfig;
use crate::normalize;
use crate::types::{
    Chapter, CoverImage, LookupIntent, PartialBook, ProviderError, ProviderId, SearchQuery, Series,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

const RESPONSE_GROUPS: &str = "product_attrs,product_desc,product_extended_attrs,media,contributors,rating,series,category_ladders";

#[derive(Debug, Deserialize)]
struct CatalogSearchResponse {
    #[serde(default)]
    products: Vec<CatalogProduct>,
}

#[derive(Debug, Deserialize)]
struct CatalogDetailResponse {
    product: CatalogProduct,
}

/// Raw catalog product
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogProduct {
    pub asin: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    #[serde(default)]
    pub authors: Vec<CatalogPerson>,
    #[serde(default)]
    pub narrators: Vec<CatalogPerson>,
    pub runtime_length_min: Option<u64>,
    pub language: Option<String>,
    pub release_date: Option<String>,
    pub publisher_name: Option<String>,
    pub publisher_summary: Option<String>,
    #[serde(default)]
    pub series: Vec<CatalogSeries>,
    /// Size in px -> URL
    #[serde(default)]
    pub product_images: BTreeMap<String, String>,
    pub rating: Option<CatalogRating>,
    #[serde(default)]
    pub category_ladders: Vec<CatalogLadder>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPerson {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSeries {
    pub title: String,
    pub sequence: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogRating {
    pub overall_distribution: Option<CatalogRatingDistribution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogRatingDistribution {
    pub average_rating: Option<f64>,
    pub num_ratings: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogLadder {
    #[serde(default)]
    pub ladder: Vec<CatalogCategory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogCategory {
    pub name: String,
}

/// Raw chapter service payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterInfo {
    #[serde(default)]
    pub chapters: Vec<RawChapter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChapter {
    pub title: String,
    pub start_offset_sec: Option<u64>,
    pub start_offset_ms: Option<u64>,
}

/// Map a catalog product onto a partial record
///
/// `chapters` is `None` for search results (chapter data not fetched).
pub fn normalize_product(product: &CatalogProduct, chapters: Option<Vec<Chapter>>) -> Option<PartialBook> {
    let asin = product.asin.trim();
    if asin.is_empty() {
        return None;
    }

    let mut book = PartialBook::new(ProviderId::Catalog, asin);
    book.title = normalize::non_empty(product.title.as_deref());
    book.subtitle = normalize::non_empty(product.subtitle.as_deref());
    book.authors = normalize::clean_names(product.authors.iter().map(|a| a.name.as_str()));
    book.narrators = normalize::clean_names(product.narrators.iter().map(|n| n.name.as_str()));
    book.runtime_secs = product.runtime_length_min.filter(|m| *m > 0).map(|m| m * 60);
    book.chapters = chapters;
    book.language = product.language.as_deref().map(normalize::normalize_language);
    book.publication_year = product.release_date.as_deref().and_then(normalize::extract_year);
    book.publisher = normalize::non_empty(product.publisher_name.as_deref());
    book.description = product
        .publisher_summary
        .as_deref()
        .map(normalize::unescape_html)
        .filter(|d| !d.is_empty());
    book.series = product.series.first().map(|s| Series {
        name: s.title.trim().to_string(),
        sequence: s.sequence.clone().filter(|q| !q.trim().is_empty()),
    });

    book.cover = product
        .product_images
        .iter()
        .filter_map(|(size, url)| size.parse::<u32>().ok().map(|px| (px, url)))
        .max_by_key(|(px, _)| *px)
        .map(|(px, url)| CoverImage {
            url: url.clone(),
            resolution: px,
        });

    if let Some(dist) = product.rating.as_ref().and_then(|r| r.overall_distribution.as_ref()) {
        let count = dist.num_ratings.unwrap_or(0);
        // A zero average with zero ratings means "unrated"
        if count > 0 {
            book.rating = dist.average_rating.map(|r| r.clamp(0.0, 5.0));
            book.rating_count = Some(count);
        }
    }

    book.genres = normalize::clean_names(
        product
            .category_ladders
            .iter()
            .filter_map(|l| l.ladder.last().map(|c| c.name.as_str())),
    );

    Some(book)
}

pub fn normalize_chapters(info: &ChapterInfo) -> Vec<Chapter> {
    info.chapters
        .iter()
        .map(|c| Chapter {
            title: normalize::collapse_whitespace(&c.title),
            start_offset_secs: c
                .start_offset_sec
                .or_else(|| c.start_offset_ms.map(|ms| ms / 1000))
                .unwrap_or(0),
        })
        .collect()
}

pub struct CatalogProvider {
    http: ProviderHttp,
    base_url: String,
    chapters_url: Option<String>,
    token: Option<String>,
    timeout: Duration,
    search_limit: usize,
}

impl CatalogProvider {
    pub fn new(config: &ProviderConfig) -> libris_common::Result<Self> {
        Ok(Self {
            http: ProviderHttp::new(ProviderId::Catalog, config.requests_per_second, USER_AGENT)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chapters_url: config
                .chapters_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            token: config.token.clone(),
            timeout: config.timeout(),
            search_limit: config.search_limit,
        })
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("Accept", "application/json".to_string())];
        if let Some(token) = &self.token {
            headers.push(("Authorization", format!("Bearer {}", token)));
        }
        headers
    }

    async fn search(&self, query: &SearchQuery, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        let mut params: Vec<(&str, String)> = vec![
            ("num_results", self.search_limit.to_string()),
            ("products_sort_by", "Relevance".to_string()),
            ("response_groups", RESPONSE_GROUPS.to_string()),
        ];
        if let Some(isbn) = query.isbn.as_deref().filter(|s| !s.trim().is_empty()) {
            params.push(("keywords", isbn.trim().to_string()));
        } else {
            if let Some(title) = query.title.as_deref().filter(|s| !s.trim().is_empty()) {
                params.push(("title", title.trim().to_string()));
            }
            if let Some(author) = query.author.as_deref().filter(|s| !s.trim().is_empty()) {
                params.push(("author", author.trim().to_string()));
            }
        }

        let url = format!("{}/catalog/products", self.base_url);
        let response: CatalogSearchResponse =
            self.http.get_json(&url, &params, &self.headers(), timeout).await?;

        Ok(response
            .products
            .iter()
            .filter_map(|p| normalize_product(p, None))
            .collect())
    }

    async fn detail(&self, asin: &str, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        let deadline = Instant::now() + timeout;
        let url = format!("{}/catalog/products/{}", self.base_url, urlencoding::encode(asin));
        let params = [("response_groups", RESPONSE_GROUPS.to_string())];
        let response: CatalogDetailResponse =
            self.http.get_json(&url, &params, &self.headers(), timeout).await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let chapters = self.fetch_chapters(asin, remaining).await;

        Ok(normalize_product(&response.product, chapters).into_iter().collect())
    }

    /// Chapter data is best effort: failures leave chapters unknown
    async fn fetch_chapters(&self, asin: &str, timeout: Duration) -> Option<Vec<Chapter>> {
        let base = self.chapters_url.as_ref()?;
        if timeout.is_zero() {
            return None;
        }
        let url = format!("{}/books/{}/chapters", base, urlencoding::encode(asin));
        match self.http.get_json::<ChapterInfo>(&url, &[], &[], timeout).await {
            Ok(info) => Some(normalize_chapters(&info)),
            Err(ProviderError::NotFound) => Some(Vec::new()),
            Err(e) => {
                tracing::warn!(asin = %asin, error = %e, "Chapter lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl BookProvider for CatalogProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Catalog
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, intent: &LookupIntent, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        match intent {
            LookupIntent::Search(query) => self.search(query, timeout).await,
            LookupIntent::Identifier { id } if id.provider == ProviderId::Catalog => {
                self.detail(&id.value, timeout).await
            }
            LookupIntent::Identifier { .. } => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT_JSON: &str = r#"{
        "product": {
            "asin": "B00B5HZGUG",
            "title": "The Martian",
            "subtitle": null,
            "authors": [{"asin": "B00G0WYW92", "name": "Andy Weir"}],
            "narrators": [{"name": "R. C. Bray"}, {"name": "r. c. bray"}],
            "runtime_length_min": 653,
            "language": "english",
            "release_date": "2013-03-22",
            "publisher_name": "Podium Publishing",
            "publisher_summary": "<p>Six days ago, astronaut Mark Watney became one of the first people to walk on Mars.&nbsp;</p>",
            "series": [],
            "product_images": {"500": "https://m.media-amazon.com/images/I/500.jpg", "1000": "https://m.media-amazon.com/images/I/1000.jpg"},
            "rating": {"overall_distribution": {"average_rating": 4.82, "num_ratings": 210345}},
            "category_ladders": [{"ladder": [{"name": "Science Fiction & Fantasy"}, {"name": "Science Fiction"}]}]
        }
    }"#;

    #[test]
    fn test_normalize_detail_product() {
        let response: CatalogDetailResponse = serde_json::from_str(PRODUCT_JSON).unwrap();
        let chapters = vec![Chapter {
            title: "Chapter 1".to_string(),
            start_offset_secs: 0,
        }];
        let book = normalize_product(&response.product, Some(chapters.clone())).unwrap();

        assert_eq!(book.provider, ProviderId::Catalog);
        assert_eq!(book.title.as_deref(), Some("The Martian"));
        assert_eq!(book.authors, vec!["Andy Weir".to_string()]);
        assert_eq!(book.narrators, vec!["R. C. Bray".to_string()]);
        assert_eq!(book.runtime_secs, Some(653 * 60));
        assert_eq!(book.language.as_deref(), Some("en"));
        assert_eq!(book.publication_year, Some(2013));
        assert_eq!(book.rating, Some(4.82));
        assert_eq!(book.rating_count, Some(210345));
        assert_eq!(book.genres, vec!["Science Fiction".to_string()]);
        assert_eq!(book.chapters, Some(chapters));
        assert_eq!(
            book.cover,
            Some(CoverImage {
                url: "https://m.media-amazon.com/images/I/1000.jpg".to_string(),
                resolution: 1000
            })
        );
        assert_eq!(
            book.description.as_deref(),
            Some("Six days ago, astronaut Mark Watney became one of the first people to walk on Mars.")
        );
    }

    #[test]
    fn test_unrated_product_has_no_rating() {
        let json = r#"{"products": [{"asin": "B0XXXXXXXX", "title": "New Release",
            "rating": {"overall_distribution": {"average_rating": 0.0, "num_ratings": 0}}}]}"#;
        let response: CatalogSearchResponse = serde_json::from_str(json).unwrap();
        let book = normalize_product(&response.products[0], None).unwrap();
        assert_eq!(book.rating, None);
        assert_eq!(book.chapters, None);
    }

    #[test]
    fn test_empty_asin_is_dropped() {
        let json = r#"{"asin": "  ", "title": "Ghost"}"#;
        let product: CatalogProduct = serde_json::from_str(json).unwrap();
        assert!(normalize_product(&product, None).is_none());
    }

    #[test]
    fn test_normalize_chapters_prefers_seconds() {
        let json = r#"{"chapters": [
            {"title": "Opening Credits", "startOffsetSec": 0, "startOffsetMs": 0, "lengthMs": 20000},
            {"title": "Chapter  1", "startOffsetMs": 20000}
        ], "runtimeLengthSec": 39180}"#;
        let info: ChapterInfo = serde_json::from_str(json).unwrap();
        let chapters = normalize_chapters(&info);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].title, "Chapter 1");
        assert_eq!(chapters[1].start_offset_secs, 20);
    }
}
