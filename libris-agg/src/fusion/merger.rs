//! Book Merger
//!
//! Folds the partial records of one work into a canonical `Book`.
//!
//! # Field resolution
//! Each field is resolved independently from a fixed provider-priority
//! table; the first provider (in table order) that supplies a value wins and
//! every differing value is kept in `provenance.alternatives`.
//!
//! | field                             | priority                                  |
//! |-----------------------------------|-------------------------------------------|
//! | title, subtitle, authors, series, | catalog > publisher > storefront > ratings |
//! | year, language, publisher         |                                           |
//! | narrators, runtime, chapters      | catalog > publisher > storefront > ratings |
//! | description                       | publisher > catalog > storefront > ratings |
//! | genres, rating count              | ratings > catalog > storefront > publisher |
//!
//! Cover art goes to the highest declared resolution (priority breaks ties).
//! Rating is the trust-weighted mean when several providers report one.
//!
//! # Determinism
//! Input is deduplicated and sorted by (priority, canonical serialization)
//! before folding, so the output does not depend on arrival order and
//! merging a set with itself changes nothing.

use super::identity_resolver::group_partials;
use crate::normalize;
use crate::types::{
    Book, BookIdentifier, Chapter, FieldAlternative, PartialBook, Provenance, ProviderId, Series,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const DEFAULT_PRIORITY: [ProviderId; 4] = [
    ProviderId::Catalog,
    ProviderId::Publisher,
    ProviderId::Storefront,
    ProviderId::Ratings,
];

const DESCRIPTION_PRIORITY: [ProviderId; 4] = [
    ProviderId::Publisher,
    ProviderId::Catalog,
    ProviderId::Storefront,
    ProviderId::Ratings,
];

const COMMUNITY_PRIORITY: [ProviderId; 4] = [
    ProviderId::Ratings,
    ProviderId::Catalog,
    ProviderId::Storefront,
    ProviderId::Publisher,
];

fn rank(order: &[ProviderId; 4], provider: ProviderId) -> usize {
    order.iter().position(|p| *p == provider).unwrap_or(order.len())
}

/// Position of a provider in the default table (0 is best)
pub fn default_rank(provider: ProviderId) -> usize {
    rank(&DEFAULT_PRIORITY, provider)
}

fn canonical_key(partial: &PartialBook) -> String {
    serde_json::to_string(partial).unwrap_or_default()
}

fn render_names(names: &[String]) -> String {
    names.join(", ")
}

fn render_series(series: &Series) -> String {
    match &series.sequence {
        Some(seq) => format!("{} #{}", series.name, seq),
        None => series.name.clone(),
    }
}

fn render_chapters(chapters: &[Chapter]) -> String {
    format!("{} chapters", chapters.len())
}

/// Collects winners and alternatives for one merge
struct FieldResolver<'a> {
    partials: &'a [PartialBook],
    provenance: Provenance,
}

impl<'a> FieldResolver<'a> {
    fn new(partials: &'a [PartialBook]) -> Self {
        let sources = partials.iter().map(|p| p.provider).collect();
        Self {
            partials,
            provenance: Provenance {
                sources,
                ..Default::default()
            },
        }
    }

    /// Candidates in priority order; the sort is stable over the canonical
    /// input order so ties resolve deterministically
    fn ordered(&self, order: &[ProviderId; 4]) -> Vec<&'a PartialBook> {
        let mut ordered: Vec<&PartialBook> = self.partials.iter().collect();
        ordered.sort_by_key(|p| rank(order, p.provider));
        ordered
    }

    fn resolve<T, E, R>(&mut self, field: &str, order: &[ProviderId; 4], extract: E, render: R) -> Option<T>
    where
        T: Clone + PartialEq,
        E: Fn(&PartialBook) -> Option<T>,
        R: Fn(&T) -> String,
    {
        let mut winner: Option<T> = None;
        let mut seen: Vec<T> = Vec::new();

        for partial in self.ordered(order) {
            let Some(value) = extract(partial) else {
                continue;
            };
            match &winner {
                None => {
                    self.provenance.fields.insert(field.to_string(), partial.provider);
                    seen.push(value.clone());
                    winner = Some(value);
                }
                Some(_) if seen.contains(&value) => {}
                Some(_) => {
                    self.provenance.alternatives.push(FieldAlternative {
                        field: field.to_string(),
                        provider: partial.provider,
                        value: render(&value),
                    });
                    seen.push(value);
                }
            }
        }
        winner
    }

    fn text(&mut self, field: &str, order: &[ProviderId; 4], extract: impl Fn(&PartialBook) -> Option<String>) -> Option<String> {
        self.resolve(field, order, extract, |s: &String| s.clone())
    }

    fn names(&mut self, field: &str, order: &[ProviderId; 4], extract: impl Fn(&PartialBook) -> &Vec<String>) -> Vec<String> {
        self.resolve(
            field,
            order,
            |p| {
                let names = normalize::clean_names(extract(p).iter());
                (!names.is_empty()).then_some(names)
            },
            |names: &Vec<String>| render_names(names),
        )
        .unwrap_or_default()
    }

    fn record_source(&mut self, field: &str, provider: ProviderId) {
        self.provenance.fields.insert(field.to_string(), provider);
    }
}

/// Field-wise merger with configurable rating trust weights
#[derive(Debug, Clone)]
pub struct BookMerger {
    trust_weights: BTreeMap<ProviderId, f64>,
}

impl Default for BookMerger {
    fn default() -> Self {
        Self::new(
            ProviderId::ALL
                .iter()
                .map(|p| (*p, p.default_trust_weight()))
                .collect(),
        )
    }
}

impl BookMerger {
    pub fn new(trust_weights: BTreeMap<ProviderId, f64>) -> Self {
        Self { trust_weights }
    }

    fn weight(&self, provider: ProviderId) -> f64 {
        self.trust_weights
            .get(&provider)
            .copied()
            .unwrap_or_else(|| provider.default_trust_weight())
            .max(0.0)
    }

    /// Deduplicate and sort into canonical fold order
    fn canonicalize(partials: &[PartialBook]) -> Vec<PartialBook> {
        let mut keyed: Vec<(usize, String, &PartialBook)> = partials
            .iter()
            .map(|p| (default_rank(p.provider), canonical_key(p), p))
            .collect();
        keyed.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        keyed.dedup_by(|a, b| a.1 == b.1);
        keyed.into_iter().map(|(_, _, p)| p.clone()).collect()
    }

    /// Merge partials of one work; `None` for an empty set or when no
    /// partial carries a title
    pub fn merge_at(&self, partials: &[PartialBook], now: DateTime<Utc>) -> Option<Book> {
        let partials = Self::canonicalize(partials);
        if partials.is_empty() {
            return None;
        }

        let mut r = FieldResolver::new(&partials);

        let title = r.text("title", &DEFAULT_PRIORITY, |p| p.title.clone())?;
        let subtitle = r.text("subtitle", &DEFAULT_PRIORITY, |p| p.subtitle.clone());
        let authors = r.names("authors", &DEFAULT_PRIORITY, |p| &p.authors);
        let narrators = r.names("narrators", &DEFAULT_PRIORITY, |p| &p.narrators);
        let runtime_secs = r.resolve(
            "runtime_secs",
            &DEFAULT_PRIORITY,
            |p| p.runtime_secs,
            |v: &u64| v.to_string(),
        );
        let chapters = r
            .resolve(
                "chapters",
                &DEFAULT_PRIORITY,
                |p| p.chapters.clone().filter(|c| !c.is_empty()),
                |c: &Vec<Chapter>| render_chapters(c),
            )
            .unwrap_or_default();
        let language = r.text("language", &DEFAULT_PRIORITY, |p| p.language.clone());
        let publication_year = r.resolve(
            "publication_year",
            &DEFAULT_PRIORITY,
            |p| p.publication_year,
            |y: &i32| y.to_string(),
        );
        let series = r.resolve("series", &DEFAULT_PRIORITY, |p| p.series.clone(), render_series);
        let publisher = r.text("publisher", &DEFAULT_PRIORITY, |p| p.publisher.clone());
        let description = r.text("description", &DESCRIPTION_PRIORITY, |p| p.description.clone());
        let genres = r.names("genres", &COMMUNITY_PRIORITY, |p| &p.genres);
        let rating_count = r.resolve(
            "rating_count",
            &COMMUNITY_PRIORITY,
            |p| p.rating_count,
            |c: &u64| c.to_string(),
        );

        let cover_url = self.resolve_cover(&mut r, &partials);
        let rating = self.resolve_rating(&mut r, &partials);

        let identifiers: BTreeSet<BookIdentifier> = partials
            .iter()
            .flat_map(|p| p.identifiers.iter().cloned())
            .collect();

        debug!(
            title = %title,
            partials = partials.len(),
            alternatives = r.provenance.alternatives.len(),
            "Merged book"
        );

        Some(Book {
            identifiers,
            title,
            subtitle,
            authors,
            narrators,
            runtime_secs,
            chapters,
            cover_url,
            rating,
            rating_count,
            language,
            publication_year,
            series,
            publisher,
            description,
            genres,
            provenance: r.provenance,
            last_refreshed: now,
        })
    }

    pub fn merge(&self, partials: &[PartialBook]) -> Option<Book> {
        self.merge_at(partials, Utc::now())
    }

    /// Group partials by work, merge each group and rank the result
    ///
    /// Ranking: more contributing providers first, then the best provider
    /// priority present, then title.
    pub fn merge_all(&self, partials: Vec<PartialBook>, now: DateTime<Utc>) -> Vec<Book> {
        let mut books: Vec<Book> = group_partials(partials)
            .iter()
            .filter_map(|group| self.merge_at(group, now))
            .collect();
        rank_books(&mut books);
        books
    }

    /// Highest declared resolution wins; priority breaks ties
    fn resolve_cover(&self, r: &mut FieldResolver<'_>, partials: &[PartialBook]) -> Option<String> {
        let mut candidates: Vec<(&PartialBook, &crate::types::CoverImage)> = partials
            .iter()
            .filter_map(|p| p.cover.as_ref().map(|c| (p, c)))
            .collect();
        candidates.sort_by(|(pa, ca), (pb, cb)| {
            cb.resolution
                .cmp(&ca.resolution)
                .then(default_rank(pa.provider).cmp(&default_rank(pb.provider)))
                .then(ca.url.cmp(&cb.url))
        });

        let (winner, cover) = candidates.first().copied()?;
        r.record_source("cover_url", winner.provider);
        for (p, c) in candidates.iter().skip(1) {
            if c.url != cover.url {
                r.provenance.alternatives.push(FieldAlternative {
                    field: "cover_url".to_string(),
                    provider: p.provider,
                    value: c.url.clone(),
                });
            }
        }
        Some(cover.url.clone())
    }

    /// Trust-weighted mean over every reported rating (0.0 is a rating)
    fn resolve_rating(&self, r: &mut FieldResolver<'_>, partials: &[PartialBook]) -> Option<f64> {
        let reported: Vec<(ProviderId, f64)> = partials
            .iter()
            .filter_map(|p| p.rating.map(|v| (p.provider, v.clamp(0.0, 5.0))))
            .collect();

        match reported.as_slice() {
            [] => None,
            [(provider, value)] => {
                r.record_source("rating", *provider);
                Some(*value)
            }
            many => {
                let total_weight: f64 = many.iter().map(|(p, _)| self.weight(*p)).sum();
                let mean = if total_weight > 0.0 {
                    many.iter().map(|(p, v)| self.weight(*p) * v).sum::<f64>() / total_weight
                } else {
                    many.iter().map(|(_, v)| v).sum::<f64>() / many.len() as f64
                };

                // Provenance names the most trusted contributor
                let mut by_trust: Vec<&(ProviderId, f64)> = many.iter().collect();
                by_trust.sort_by(|a, b| {
                    self.weight(b.0)
                        .total_cmp(&self.weight(a.0))
                        .then(default_rank(a.0).cmp(&default_rank(b.0)))
                });
                r.record_source("rating", by_trust[0].0);
                for (provider, value) in &by_trust[1..] {
                    r.provenance.alternatives.push(FieldAlternative {
                        field: "rating".to_string(),
                        provider: *provider,
                        value: format!("{:.2}", value),
                    });
                }

                Some((mean * 100.0).round() / 100.0)
            }
        }
    }
}

/// Sort merged search results into presentation order
pub fn rank_books(books: &mut [Book]) {
    books.sort_by(|a, b| {
        let best = |book: &Book| {
            book.provenance
                .sources
                .iter()
                .map(|p| default_rank(*p))
                .min()
                .unwrap_or(usize::MAX)
        };
        b.provenance
            .sources
            .len()
            .cmp(&a.provenance.sources.len())
            .then(best(a).cmp(&best(b)))
            .then(a.title.to_lowercase().cmp(&b.title.to_lowercase()))
            .then(a.identifiers.cmp(&b.identifiers))
    });
}

fn pick_vec<T: Clone>(fresh: &[T], previous: &[T]) -> Vec<T> {
    if fresh.is_empty() {
        previous.to_vec()
    } else {
        fresh.to_vec()
    }
}

/// Reconcile a fresh merge with the durable record it replaces
///
/// Identifier sets union; fresh values win where present; previously known
/// values (chapters in particular) survive when the fresh merge lacks them.
pub fn reconcile(previous: &Book, fresh: Book) -> Book {
    let mut provenance = Provenance {
        sources: previous
            .provenance
            .sources
            .union(&fresh.provenance.sources)
            .copied()
            .collect(),
        fields: previous.provenance.fields.clone(),
        alternatives: fresh.provenance.alternatives.clone(),
    };
    // Fields the fresh merge resolved take its provenance
    for (field, provider) in &fresh.provenance.fields {
        provenance.fields.insert(field.clone(), *provider);
    }

    Book {
        identifiers: previous.identifiers.union(&fresh.identifiers).cloned().collect(),
        title: fresh.title,
        subtitle: fresh.subtitle.or_else(|| previous.subtitle.clone()),
        authors: pick_vec(&fresh.authors, &previous.authors),
        narrators: pick_vec(&fresh.narrators, &previous.narrators),
        runtime_secs: fresh.runtime_secs.or(previous.runtime_secs),
        chapters: pick_vec(&fresh.chapters, &previous.chapters),
        cover_url: fresh.cover_url.or_else(|| previous.cover_url.clone()),
        rating: fresh.rating.or(previous.rating),
        rating_count: fresh.rating_count.or(previous.rating_count),
        language: fresh.language.or_else(|| previous.language.clone()),
        publication_year: fresh.publication_year.or(previous.publication_year),
        series: fresh.series.or_else(|| previous.series.clone()),
        publisher: fresh.publisher.or_else(|| previous.publisher.clone()),
        description: fresh.description.or_else(|| previous.description.clone()),
        genres: pick_vec(&fresh.genres, &previous.genres),
        provenance,
        last_refreshed: fresh.last_refreshed.max(previous.last_refreshed),
    }
}
