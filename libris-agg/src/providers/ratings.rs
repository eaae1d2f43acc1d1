//! Community ratings adapter (HTML scrape)
//!
//! Search: results page rows (`tr[itemscope]`).
//! Detail: book page, JSON-LD block plus a few page selectors.
//! Row parsing is shared with the ratings list source.

use super::http::{ProviderHttp, BROWSER_USER_AGENT};
use super::BookProvider;
use crate::config::ProviderConfig;
use crate::normalize;
use crate::types::{
    BookIdentifier, CoverImage, LookupIntent, PartialBook, ProviderError, ProviderId, Series,
};
use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

/// Nominal resolution of a cleaned full-size cover (the site does not declare one)
const FULL_SIZE_COVER_RESOLUTION: u32 = 400;
const MAX_GENRES: usize = 5;

fn selector(css: &str) -> Result<Selector, ProviderError> {
    Selector::parse(css).map_err(|e| ProviderError::Unavailable(format!("bad selector {}: {}", css, e)))
}

fn text_of(element: ElementRef<'_>) -> String {
    normalize::collapse_whitespace(&element.text().collect::<String>())
}

struct Patterns {
    work_id: Regex,
    avg: Regex,
    count: Regex,
    published: Regex,
    thumb_suffix: Regex,
    small_suffix: Regex,
    series: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        work_id: Regex::new(r"/show/(\d+)").expect("valid regex"),
        avg: Regex::new(r"(\d+\.\d+)\s+avg").expect("valid regex"),
        count: Regex::new(r"([\d,]+)\s+ratings?").expect("valid regex"),
        published: Regex::new(r"published\s+(\d{4})").expect("valid regex"),
        thumb_suffix: Regex::new(r"\._S[XY]\d+_").expect("valid regex"),
        small_suffix: Regex::new(r"(\d)s\.jpg").expect("valid regex"),
        series: Regex::new(r"^(.*?)\s+#([\d.]+)").expect("valid regex"),
    })
}

/// Work id from a book link (`/book/show/54493401-project-hail-mary`)
pub fn work_id_from_href(href: &str) -> Option<String> {
    patterns()
        .work_id
        .captures(href)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Turn a thumbnail URL into the full-size image URL
pub fn clean_cover_url(src: &str) -> Option<String> {
    let src = src.trim();
    if src.is_empty() {
        return None;
    }
    let p = patterns();
    let cover = p.thumb_suffix.replace_all(src, "");
    let cover = p.small_suffix.replace_all(&cover, "${1}.jpg");
    Some(cover.replace("..", "."))
}

/// One scraped results/list row, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RatingsRow {
    pub work_id: String,
    pub title: String,
    pub author: Option<String>,
    pub cover_src: Option<String>,
    /// Raw "4.36 avg rating - 281,112 ratings - published 2021" text
    pub minirating: Option<String>,
}

/// Parse every `tr[itemscope]` row with a book link
pub fn parse_rows(document: &Html) -> Result<Vec<RatingsRow>, ProviderError> {
    let row_sel = selector("tr[itemscope]")?;
    let title_sel = selector("a.bookTitle")?;
    let author_sel = selector("a.authorName")?;
    let cover_sel = selector("img.bookCover")?;
    let mini_sel = selector("span.minirating")?;

    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let Some(title_link) = row.select(&title_sel).next() else {
            continue;
        };
        let Some(work_id) = title_link.value().attr("href").and_then(work_id_from_href) else {
            continue;
        };

        rows.push(RatingsRow {
            work_id,
            title: text_of(title_link),
            author: row.select(&author_sel).next().map(text_of),
            cover_src: row
                .select(&cover_sel)
                .next()
                .and_then(|img| img.value().attr("src"))
                .map(str::to_string),
            minirating: row.select(&mini_sel).next().map(text_of),
        });
    }
    Ok(rows)
}

pub fn normalize_row(row: &RatingsRow) -> PartialBook {
    let p = patterns();
    let mut book = PartialBook::new(ProviderId::Ratings, &row.work_id);
    book.title = normalize::non_empty(Some(row.title.as_str()));
    book.authors = normalize::clean_names(row.author.iter());
    book.cover = row
        .cover_src
        .as_deref()
        .and_then(clean_cover_url)
        .map(|url| CoverImage {
            url,
            resolution: FULL_SIZE_COVER_RESOLUTION,
        });

    if let Some(text) = &row.minirating {
        book.rating = p
            .avg
            .captures(text)
            .and_then(|c| c[1].parse::<f64>().ok())
            .map(|r| r.clamp(0.0, 5.0));
        book.rating_count = p
            .count
            .captures(text)
            .and_then(|c| c[1].replace(',', "").parse::<u64>().ok());
        book.publication_year = p.published.captures(text).and_then(|c| c[1].parse().ok());
    }
    book
}

/// JSON-LD block of a book page
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingsJsonLd {
    pub name: Option<String>,
    #[serde(default)]
    pub author: serde_json::Value,
    pub image: Option<String>,
    pub in_language: Option<String>,
    pub isbn: Option<String>,
    pub aggregate_rating: Option<AggregateRating>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRating {
    #[serde(default)]
    pub rating_value: serde_json::Value,
    #[serde(default)]
    pub rating_count: serde_json::Value,
}

fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn json_ld_authors(value: &serde_json::Value) -> Vec<String> {
    let names: Vec<String> = match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|a| a.get("name").and_then(|n| n.as_str()).map(str::to_string))
            .collect(),
        serde_json::Value::Object(_) => value
            .get("name")
            .and_then(|n| n.as_str())
            .map(|n| vec![n.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    normalize::clean_names(names)
}

/// Parse a book page into a partial record
pub fn parse_book_page(html: &str, work_id: &str) -> Result<PartialBook, ProviderError> {
    let document = Html::parse_document(html);
    let ld_sel = selector(r#"script[type="application/ld+json"]"#)?;
    let title_sel = selector(r#"h1[data-testid="bookTitle"]"#)?;
    let genre_sel = selector(r#"div[data-testid="genresList"] a"#)?;
    let desc_sel = selector(r#"div[data-testid="description"]"#)?;
    let series_sel = selector(r#"a[href*="/series/"]"#)?;

    let json_ld: RatingsJsonLd = document
        .select(&ld_sel)
        .next()
        .map(|script| script.text().collect::<String>())
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    let title = normalize::non_empty(json_ld.name.as_deref())
        .or_else(|| document.select(&title_sel).next().map(text_of).filter(|t| !t.is_empty()));
    let Some(title) = title else {
        return Err(ProviderError::Unavailable(format!(
            "book page {} has no recognizable title",
            work_id
        )));
    };

    let mut book = PartialBook::new(ProviderId::Ratings, work_id);
    book.title = Some(title);
    book.authors = json_ld_authors(&json_ld.author);
    book.language = json_ld.in_language.as_deref().map(normalize::normalize_language);
    book.cover = json_ld
        .image
        .as_deref()
        .and_then(clean_cover_url)
        .map(|url| CoverImage {
            url,
            resolution: FULL_SIZE_COVER_RESOLUTION,
        });

    if let Some(agg) = &json_ld.aggregate_rating {
        let count = json_number(&agg.rating_count).map(|c| c as u64);
        if count.unwrap_or(0) > 0 {
            book.rating = json_number(&agg.rating_value).map(|r| r.clamp(0.0, 5.0));
            book.rating_count = count;
        }
    }

    if let Some(isbn) = json_ld.isbn.as_deref() {
        let id = BookIdentifier::new(ProviderId::Publisher, isbn);
        if id.is_isbn13() {
            book.identifiers.insert(id);
        }
    }

    let genres: Vec<String> = document
        .select(&genre_sel)
        .map(text_of)
        .filter(|g| !g.is_empty() && !g.contains("..."))
        .collect();
    book.genres = normalize::clean_names(genres).into_iter().take(MAX_GENRES).collect();

    book.description = document
        .select(&desc_sel)
        .next()
        .map(text_of)
        .filter(|d| !d.is_empty());

    book.series = document.select(&series_sel).next().map(text_of).and_then(|text| {
        if text.is_empty() {
            return None;
        }
        match patterns().series.captures(&text) {
            Some(c) => Some(Series {
                name: c[1].trim().to_string(),
                sequence: Some(c[2].to_string()),
            }),
            None => Some(Series {
                name: text,
                sequence: None,
            }),
        }
    });

    Ok(book)
}

pub struct RatingsProvider {
    http: ProviderHttp,
    base_url: String,
    timeout: Duration,
    search_limit: usize,
}

impl RatingsProvider {
    pub fn new(config: &ProviderConfig) -> libris_common::Result<Self> {
        Ok(Self {
            http: ProviderHttp::new(ProviderId::Ratings, config.requests_per_second, BROWSER_USER_AGENT)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            search_limit: config.search_limit,
        })
    }

    fn headers() -> Vec<(&'static str, String)> {
        vec![("Accept-Language", "en-US,en;q=0.9".to_string())]
    }
}

#[async_trait]
impl BookProvider for RatingsProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Ratings
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, intent: &LookupIntent, timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        match intent {
            LookupIntent::Search(query) => {
                let url = format!("{}/search", self.base_url);
                let params = [
                    ("q", query.search_term()),
                    ("search_type", "books".to_string()),
                ];
                let html = self.http.get_text(&url, &params, &Self::headers(), timeout).await?;
                let document = Html::parse_document(&html);
                let rows = parse_rows(&document)?;
                Ok(rows.iter().take(self.search_limit).map(normalize_row).collect())
            }
            LookupIntent::Identifier { id } if id.provider == ProviderId::Ratings => {
                let url = format!("{}/book/show/{}", self.base_url, urlencoding::encode(&id.value));
                let html = self.http.get_text(&url, &[], &Self::headers(), timeout).await?;
                Ok(vec![parse_book_page(&html, &id.value)?])
            }
            LookupIntent::Identifier { .. } => Ok(Vec::new()),
        }
    }
}
