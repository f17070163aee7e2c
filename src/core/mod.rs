//! In-memory event store and index helpers.

/// Helper index aliases.
pub mod indices;
/// Authoritative event, competitor and punch store.
pub mod store;
