//! List sources: turn a list page into lookup intents
//!
//! - **Catalog lists:** `data-asin` attributes, falling back to `/pd/` links
//! - **Ratings lists:** `tr[itemscope]` rows, `a.next_page` pagination
//!
//! Every source enforces a minimum interval between its page requests,
//! shared by all jobs using it.

use super::JobError;
use crate::config::{ImportConfig, ProvidersConfig};
use crate::providers::http::{ProviderHttp, BROWSER_USER_AGENT};
use crate::providers::ratings;
use crate::types::{BookIdentifier, LookupIntent, ProviderError, ProviderId, SearchQuery};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One discovered list entry
#[derive(Debug, Clone, PartialEq)]
pub struct ListItem {
    /// What the list called it (`catalog:B0..`, `ratings:123`)
    pub item_ref: String,
    pub intent: LookupIntent,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub title: Option<String>,
    pub items: Vec<ListItem>,
    pub next_url: Option<String>,
}

#[async_trait]
pub trait ListSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_page(&self, url: &str) -> Result<ListPage, ProviderError>;
}

/// Picks the source for a submitted URL
pub trait ListSourceFactory: Send + Sync {
    fn source_for(&self, url: &str) -> Result<Arc<dyn ListSource>, JobError>;
}

/// Enforces a minimum gap between consecutive requests
pub struct MinIntervalLimiter {
    interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl MinIntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: Mutex::new(None),
        }
    }

    /// Wait until the interval since the previous request has passed
    pub async fn wait(&self) {
        // Held across the sleep so concurrent callers queue up
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

fn selector(css: &str) -> Result<Selector, ProviderError> {
    Selector::parse(css).map_err(|e| ProviderError::Unavailable(format!("bad selector {}: {}", css, e)))
}

fn heading(document: &Html) -> Result<Option<String>, ProviderError> {
    let h1 = selector("h1")?;
    Ok(document
        .select(&h1)
        .next()
        .map(|el| crate::normalize::collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty() && t.to_lowercase() != "score"))
}

fn pd_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/pd/.*(B0[A-Z0-9]{8})").expect("valid regex"))
}

fn catalog_item(asin: &str) -> ListItem {
    let id = BookIdentifier::new(ProviderId::Catalog, asin);
    ListItem {
        item_ref: id.to_string(),
        intent: LookupIntent::identifier(id),
    }
}

/// Parse a catalog list page (charts, series pages, search results)
pub fn parse_catalog_list(html: &str) -> Result<ListPage, ProviderError> {
    let document = Html::parse_document(html);
    let mut asins: Vec<String> = Vec::new();

    let with_asin = selector("[data-asin]")?;
    for el in document.select(&with_asin) {
        if let Some(asin) = el.value().attr("data-asin") {
            let asin = asin.trim();
            if asin.len() == 10 && !asins.iter().any(|a| a == asin) {
                asins.push(asin.to_string());
            }
        }
    }

    if asins.is_empty() {
        let links = selector("a[href]")?;
        for link in document.select(&links) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            if let Some(m) = pd_link_pattern().captures(href).and_then(|c| c.get(1)) {
                if !asins.iter().any(|a| a == m.as_str()) {
                    asins.push(m.as_str().to_string());
                }
            }
        }
    }

    Ok(ListPage {
        title: heading(&document)?,
        items: asins.iter().map(|a| catalog_item(a)).collect(),
        next_url: None,
    })
}

/// Parse a ratings list page; `page_url` resolves the relative next link
pub fn parse_ratings_list(html: &str, page_url: &str) -> Result<ListPage, ProviderError> {
    let document = Html::parse_document(html);

    let items = ratings::parse_rows(&document)?
        .into_iter()
        .map(|row| {
            let mut query = SearchQuery::title(row.title.clone());
            if let Some(author) = row.author.clone() {
                query = query.with_author(author);
            }
            ListItem {
                item_ref: BookIdentifier::new(ProviderId::Ratings, row.work_id).to_string(),
                intent: LookupIntent::Search(query),
            }
        })
        .collect();

    let next = selector("a.next_page")?;
    let next_url = document
        .select(&next)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| Url::parse(page_url).ok()?.join(href).ok())
        .map(|u| u.to_string());

    Ok(ListPage {
        title: heading(&document)?,
        items,
        next_url,
    })
}

pub struct CatalogListSource {
    http: ProviderHttp,
    limiter: MinIntervalLimiter,
    page_timeout: Duration,
}

impl CatalogListSource {
    pub fn new(config: &ImportConfig) -> libris_common::Result<Self> {
        Ok(Self {
            http: ProviderHttp::new(ProviderId::Catalog, 1, BROWSER_USER_AGENT)?,
            limiter: MinIntervalLimiter::new(config.min_interval()),
            page_timeout: config.page_timeout(),
        })
    }
}

#[async_trait]
impl ListSource for CatalogListSource {
    fn name(&self) -> &'static str {
        "catalog"
    }

    async fn fetch_page(&self, url: &str) -> Result<ListPage, ProviderError> {
        self.limiter.wait().await;
        let html = self.http.get_text(url, &[], &[], self.page_timeout).await?;
        parse_catalog_list(&html)
    }
}

pub struct RatingsListSource {
    http: ProviderHttp,
    limiter: MinIntervalLimiter,
    page_timeout: Duration,
}

impl RatingsListSource {
    pub fn new(config: &ImportConfig) -> libris_common::Result<Self> {
        Ok(Self {
            http: ProviderHttp::new(ProviderId::Ratings, 1, BROWSER_USER_AGENT)?,
            limiter: MinIntervalLimiter::new(config.min_interval()),
            page_timeout: config.page_timeout(),
        })
    }
}

#[async_trait]
impl ListSource for RatingsListSource {
    fn name(&self) -> &'static str {
        "ratings"
    }

    async fn fetch_page(&self, url: &str) -> Result<ListPage, ProviderError> {
        self.limiter.wait().await;
        let headers = [("Accept-Language", "en-US,en;q=0.9".to_string())];
        let html = self.http.get_text(url, &[], &headers, self.page_timeout).await?;
        parse_ratings_list(&html, url)
    }
}

/// Last two host labels (`www.goodreads.com` -> `goodreads.com`)
fn site_of(host: &str) -> String {
    let labels: Vec<&str> = host.trim_end_matches('.').split('.').collect();
    let start = labels.len().saturating_sub(2);
    labels[start..].join(".").to_ascii_lowercase()
}

fn site_of_url(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(site_of)
}

/// HTTP list sources, matched by site against the provider base URLs
pub struct HttpListSources {
    catalog: (Option<String>, Arc<CatalogListSource>),
    ratings: (Option<String>, Arc<RatingsListSource>),
}

impl HttpListSources {
    pub fn new(import: &ImportConfig, providers: &ProvidersConfig) -> libris_common::Result<Self> {
        Ok(Self {
            catalog: (
                site_of_url(&providers.catalog.base_url),
                Arc::new(CatalogListSource::new(import)?),
            ),
            ratings: (
                site_of_url(&providers.ratings.base_url),
                Arc::new(RatingsListSource::new(import)?),
            ),
        })
    }
}

impl ListSourceFactory for HttpListSources {
    fn source_for(&self, url: &str) -> Result<Arc<dyn ListSource>, JobError> {
        let site = site_of_url(url).ok_or_else(|| JobError::UnsupportedSource(url.to_string()))?;

        if self.catalog.0.as_deref() == Some(site.as_str()) {
            Ok(self.catalog.1.clone())
        } else if self.ratings.0.as_deref() == Some(site.as_str()) {
            Ok(self.ratings.1.clone())
        } else {
            Err(JobError::UnsupportedSource(url.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG_PAGE: &str = r#"
        <html><body>
          <h1>Best Sci-Fi Listens</h1>
          <ul>
            <li data-asin="B08G9PRS1K">Project Hail Mary</li>
            <li data-asin="B00B5HZGUG">The Martian</li>
            <li data-asin="B08G9PRS1K">duplicate</li>
            <li data-asin="short">ignored</li>
          </ul>
        </body></html>
    "#;

    const RATINGS_PAGE: &str = r#"
        <html><body>
          <h1 class="gr-h1 gr-h1--serif">Best Science Fiction</h1>
          <table>
            <tr itemscope itemtype="http://schema.org/Book">
              <td><img class="bookCover" src="https://images.example/books/1s.jpg"></td>
              <td>
                <a class="bookTitle" href="/book/show/18007564-the-martian"><span>The Martian</span></a>
                <a class="authorName" href="/author/show/6540057"><span>Andy Weir</span></a>
                <span class="minirating">4.41 avg rating - 1,200,000 ratings</span>
              </td>
            </tr>
          </table>
          <a class="next_page" href="/list/show/19341.Best_Science_Fiction?page=2">next »</a>
        </body></html>
    "#;

    #[test]
    fn test_catalog_list_data_asin() {
        let page = parse_catalog_list(CATALOG_PAGE).unwrap();
        assert_eq!(page.title.as_deref(), Some("Best Sci-Fi Listens"));
        let refs: Vec<&str> = page.items.iter().map(|i| i.item_ref.as_str()).collect();
        assert_eq!(refs, vec!["catalog:B08G9PRS1K", "catalog:B00B5HZGUG"]);
        assert!(page.next_url.is_none());
    }

    #[test]
    fn test_catalog_list_pd_link_fallback() {
        let html = r#"<a href="/pd/Dune-Audiobook/B002V1OF70?ref=x">Dune</a>
                      <a href="/about">About</a>"#;
        let page = parse_catalog_list(html).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(
            page.items[0].intent,
            LookupIntent::identifier(BookIdentifier::new(ProviderId::Catalog, "B002V1OF70"))
        );
    }

    #[test]
    fn test_ratings_list_rows_and_next_page() {
        let page = parse_ratings_list(RATINGS_PAGE, "https://www.goodreads.com/list/show/19341.Best_Science_Fiction").unwrap();
        assert_eq!(page.title.as_deref(), Some("Best Science Fiction"));
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].item_ref, "ratings:18007564");
        match &page.items[0].intent {
            LookupIntent::Search(query) => {
                assert_eq!(query.title.as_deref(), Some("The Martian"));
                assert_eq!(query.author.as_deref(), Some("Andy Weir"));
            }
            other => panic!("unexpected intent {:?}", other),
        }
        assert_eq!(
            page.next_url.as_deref(),
            Some("https://www.goodreads.com/list/show/19341.Best_Science_Fiction?page=2")
        );
    }

    #[test]
    fn test_source_selection_by_site() {
        let sources = HttpListSources::new(&ImportConfig::default(), &ProvidersConfig::default()).unwrap();
        assert_eq!(
            sources.source_for("https://www.goodreads.com/list/show/1").unwrap().name(),
            "ratings"
        );
        assert_eq!(
            sources.source_for("https://www.audible.com/adblbestsellers").unwrap().name(),
            "catalog"
        );
        assert!(matches!(
            sources.source_for("https://example.org/list"),
            Err(JobError::UnsupportedSource(_))
        ));
        assert!(sources.source_for("not a url").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_between_requests() {
        let limiter = MinIntervalLimiter::new(Duration::from_millis(1500));
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(3000));
    }
}
