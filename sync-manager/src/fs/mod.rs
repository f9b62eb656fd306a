//! Local filesystem helpers: source traversal, ownership, and directory
//! replacement.

pub mod metadata;
pub mod tree;
pub mod walker;

pub use metadata::Ownership;
pub use walker::{walk_source, EntryKind, SourceEntry, WalkOptions};
