//! Identity Resolver
//!
//! Groups partial records that describe the same logical work.
//!
//! Two partials belong together when they share any identifier, or when
//! their normalized titles are equal and their author sets overlap. The
//! relation is closed transitively (union-find), so A~B and B~C puts A, B
//! and C in one group even if A and C share nothing directly.
//!
//! The title fallback is skipped for two partials that carry different
//! identifiers in the same namespace: one provider listing two products
//! (abridged and unabridged editions, say) is not evidence they are one work.

use crate::types::{PartialBook, ProviderId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index becomes root so group order follows input order
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

fn namespaces(partial: &PartialBook) -> BTreeMap<ProviderId, BTreeSet<&str>> {
    let mut map: BTreeMap<ProviderId, BTreeSet<&str>> = BTreeMap::new();
    for id in &partial.identifiers {
        map.entry(id.provider).or_default().insert(id.value.as_str());
    }
    map
}

fn conflicting_identifiers(a: &PartialBook, b: &PartialBook) -> bool {
    let (na, nb) = (namespaces(a), namespaces(b));
    na.iter().any(|(ns, values)| {
        nb.get(ns)
            .map(|other| values.is_disjoint(other))
            .unwrap_or(false)
    })
}

/// Whether two partials describe the same work (before transitive closure)
pub fn same_work(a: &PartialBook, b: &PartialBook) -> bool {
    if !a.identifiers.is_disjoint(&b.identifiers) {
        return true;
    }
    if conflicting_identifiers(a, b) {
        return false;
    }
    match (a.match_title(), b.match_title()) {
        (Some(ta), Some(tb)) if ta == tb => !a.match_authors().is_disjoint(&b.match_authors()),
        _ => false,
    }
}

/// Partition partials into groups of the same work
///
/// Groups come back ordered by their first member's input position; members
/// keep input order.
pub fn group_partials(partials: Vec<PartialBook>) -> Vec<Vec<PartialBook>> {
    let count = partials.len();
    let mut set = DisjointSet::new(count);

    for i in 0..count {
        for j in (i + 1)..count {
            if same_work(&partials[i], &partials[j]) {
                set.union(i, j);
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<PartialBook>> = BTreeMap::new();
    for (i, partial) in partials.into_iter().enumerate() {
        let root = set.find(i);
        groups.entry(root).or_default().push(partial);
    }

    debug!(partials = count, groups = groups.len(), "Resolved partial identities");
    groups.into_values().collect()
}
