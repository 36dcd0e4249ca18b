//! Caches for open fragments and decoded block indexes.

mod loading;

pub use loading::{CacheStats, LoadingCache};
