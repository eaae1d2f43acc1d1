//! Fusion: identity grouping and field-wise merge of partial records

pub mod identity_resolver;
pub mod merger;

pub use identity_resolver::{group_partials, same_work};
pub use merger::{rank_books, reconcile, BookMerger};
