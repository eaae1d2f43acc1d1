//! Lookup endpoints
//!
//! GET /search, GET /book/:identifier

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{ApiError, ApiResult};
use crate::types::{Book, BookIdentifier, LookupFilters, ProviderId, SearchQuery};
use crate::AppState;

/// GET /search query string
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub title: Option<String>,
    pub author: Option<String>,
    pub isbn: Option<String>,
    pub language: Option<String>,
    pub min_rating: Option<f64>,
    /// Comma-separated provider names
    pub providers: Option<String>,
    pub limit: Option<usize>,
}

impl SearchParams {
    pub fn into_query(self) -> ApiResult<SearchQuery> {
        let providers = match self.providers.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(list) => Some(
                list.split(',')
                    .map(|name| name.parse::<ProviderId>())
                    .collect::<Result<BTreeSet<_>, _>>()
                    .map_err(ApiError::BadRequest)?,
            ),
            None => None,
        };

        if let Some(min) = self.min_rating {
            if !(0.0..=5.0).contains(&min) {
                return Err(ApiError::BadRequest(format!(
                    "min_rating must be between 0 and 5, got {}",
                    min
                )));
            }
        }

        Ok(SearchQuery {
            title: self.title,
            author: self.author,
            isbn: self.isbn,
            filters: LookupFilters {
                language: self.language.filter(|l| !l.trim().is_empty()),
                min_rating: self.min_rating,
                providers,
                limit: self.limit.filter(|l| *l > 0),
            },
        })
    }
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub count: usize,
    pub books: Vec<Book>,
}

/// GET /search
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let query = params.into_query()?;
    let books = state.orchestrator.search(query).await?;
    Ok(Json(SearchResponse {
        count: books.len(),
        books,
    }))
}

/// GET /book/:identifier
///
/// Accepts `provider:value` or a bare ASIN / ISBN-13 / collection id.
pub async fn get_book(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> ApiResult<Json<Book>> {
    let id: BookIdentifier = identifier.parse().map_err(ApiError::BadRequest)?;
    let book = state.orchestrator.lookup(crate::types::LookupIntent::identifier(id)).await?;
    Ok(Json(book))
}

pub fn lookup_routes() -> Router<AppState> {
    Router::new()
        .route("/search", get(search))
        .route("/book/:identifier", get(get_book))
}
