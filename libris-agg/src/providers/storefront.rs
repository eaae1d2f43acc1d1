//! Public storefront adapter
//!
//! Search: `GET {base}/search?media=audiobook&term=..`
//! Detail: `GET {base}/lookup?id={collection id}`

use super::http::{ProviderHttp, USER_AGENT};
use super::BookProvider;
use crate::config::ProviderConfig;
use crate::normalize;
use crate::types::{CoverImage, LookupIntent, PartialBook, ProviderError, ProviderId, SearchQuery};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const THUMBNAIL_SIZE: &str = "100x100bb";
const UPSCALED_SIZE: &str = "600x600bb";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorefrontResponse {
    #[serde(default)]
    results: Vec<StorefrontItem>,
}

/// Raw storefront collection entry
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorefrontItem {
    pub collection_id: Option<u64>,
    pub collection_name: Option<String>,
    pub artist_name: Option<String>,
    pub artwork_url100: Option<String>,
    pub release_date: Option<String>,
    pub primary_genre_name: Option<String>,
    pub description: Option<String>,
    pub copyright: Option<String>,
    pub track_time_millis: Option<u64>,
}

/// Swap the 100px artwork suffix for the 600px rendition
pub fn upscale_artwork(url: &str) -> CoverImage {
    if url.contains(THUMBNAIL_SIZE) {
        CoverImage {
            url: url.replace(THUMBNAIL_SIZE, UPSCALED_SIZE),
            resolution: 600,
        }
    } else {
        CoverImage {
            url: url.to_string(),
            resolution: 100,
        }
    }
}

pub fn normalize_item(item: &StorefrontItem) -> Option<PartialBook> {
    let collection_id = item.collection_id?;

    let mut book = PartialBook::new(ProviderId::Storefront, collection_id.to_string());
    book.title = normalize::non_empty(item.collection_name.as_deref());
    book.authors = item
        .artist_name
        .as_deref()
        .map(normalize::split_credit_line)
        .unwrap_or_default();
    book.cover = item
        .artwork_url100
        .as_deref()
        .filter(|u| !u.is_empty())
        .map(upscale_artwork);
    book.publication_year = item.release_date.as_deref().and_then(normalize::extract_year);
    book.genres = normalize::clean_names(item.primary_genre_name.iter());
    book.description = item
        .description
        .as_deref()
        .map(normalize::unescape_html)
        .filter(|d| !d.is_empty());
    book.publisher = normalize::non_empty(item.copyright.as_deref());
    book.runtime_secs = item.track_time_millis.filter(|ms| *ms > 0).map(|ms| ms / 1000);
    Some(book)
}

pub struct StorefrontProvider {
    http: ProviderHttp,
    base_url: String,
    timeout: Duration,
    search_limit: usize,
}

impl StorefrontProvider {
    pub fn new(config: &ProviderConfig) -> libris_common::Result<Self> {
        Ok(Self {
            http: ProviderHttp::new(ProviderId::Storefront, config.requests_per_second, USER_AGENT)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            search_limit: config.search_limit,
        })
    }

    /// Query parameters for a search; an author-only query is restricted to
    /// the author attribute
    pub fn search_params(query: &SearchQuery, limit: usize) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("media", "audiobook".to_string()),
            ("entity", "audiobook".to_string()),
            ("limit", limit.to_string()),
        ];

        let title = query.title.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let author = query.author.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let isbn = query.isbn.as_deref().map(str::trim).filter(|s| !s.is_empty());

        match (isbn, title, author) {
            (Some(isbn), _, _) => params.push(("term", isbn.to_string())),
            (None, None, Some(author)) => {
                params.push(("term", author.to_string()));
                params.push(("attribute", "authorTerm".to_string()));
            }
            _ => params.push(("term", query.search_term())),
        }
        params
    }

    async fn search(&self, query: &SearchQuery, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        let url = format!("{}/search", self.base_url);
        let params = Self::search_params(query, self.search_limit);
        let response: StorefrontResponse = self.http.get_json(&url, &params, &[], timeout).await?;
        Ok(response.results.iter().filter_map(normalize_item).collect())
    }

    async fn detail(&self, collection_id: &str, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        let url = format!("{}/lookup", self.base_url);
        let params = [("id", collection_id.to_string())];
        let response: StorefrontResponse = self.http.get_json(&url, &params, &[], timeout).await?;
        match response.results.first().and_then(normalize_item) {
            Some(book) => Ok(vec![book]),
            None => Err(ProviderError::NotFound),
        }
    }
}

#[async_trait]
impl BookProvider for StorefrontProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Storefront
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, intent: &LookupIntent, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        match intent {
            LookupIntent::Search(query) => self.search(query, timeout).await,
            LookupIntent::Identifier { id } if id.provider == ProviderId::Storefront => {
                self.detail(&id.value, timeout).await
            }
            LookupIntent::Identifier { .. } => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_JSON: &str = r#"{
        "resultCount": 2,
        "results": [
            {
                "wrapperType": "audiobook",
                "collectionId": 1545891111,
                "collectionName": "Project Hail Mary (Unabridged)",
                "artistName": "Andy Weir",
                "artworkUrl100": "https://is1-ssl.mzstatic.com/image/thumb/Music/100x100bb.jpg",
                "releaseDate": "2021-05-04T07:00:00Z",
                "primaryGenreName": "Sci-Fi & Fantasy",
                "description": "Ryland Grace is the sole survivor &amp; he must save Earth.",
                "copyright": "℗ 2021 Audible, Inc."
            },
            {"wrapperType": "audiobook", "collectionName": "No id"}
        ]
    }"#;

    #[test]
    fn test_normalize_search_results() {
        let response: StorefrontResponse = serde_json::from_str(SEARCH_JSON).unwrap();
        let books: Vec<PartialBook> = response.results.iter().filter_map(normalize_item).collect();
        assert_eq!(books.len(), 1);

        let book = &books[0];
        assert!(book
            .identifiers
            .contains(&crate::types::BookIdentifier::new(ProviderId::Storefront, "1545891111")));
        assert_eq!(book.title.as_deref(), Some("Project Hail Mary (Unabridged)"));
        assert_eq!(book.publication_year, Some(2021));
        assert_eq!(book.cover.as_ref().map(|c| c.resolution), Some(600));
        assert!(book.cover.as_ref().unwrap().url.ends_with("600x600bb.jpg"));
        assert_eq!(
            book.description.as_deref(),
            Some("Ryland Grace is the sole survivor & he must save Earth.")
        );
        assert_eq!(book.chapters, None);
        assert_eq!(book.rating, None);
    }

    #[test]
    fn test_author_only_search_uses_author_attribute() {
        let query = SearchQuery {
            author: Some("Andy Weir".to_string()),
            ..Default::default()
        };
        let params = StorefrontProvider::search_params(&query, 5);
        assert!(params.contains(&("attribute", "authorTerm".to_string())));
        assert!(params.contains(&("term", "Andy Weir".to_string())));

        let query = SearchQuery::title("The Martian").with_author("Andy Weir");
        let params = StorefrontProvider::search_params(&query, 5);
        assert!(params.contains(&("term", "The Martian Andy Weir".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "attribute"));
    }

    #[test]
    fn test_upscale_artwork_without_thumbnail_suffix() {
        let cover = upscale_artwork("https://example.com/art.jpg");
        assert_eq!(cover.resolution, 100);
    }
}
