//! Cache module - reference-counted resource caching

pub mod ref_cache;

pub use ref_cache::{CacheSource, RefCache};
