#![warn(clippy::unwrap_used)]

pub mod client;
pub mod error;
pub mod kv;
pub mod local;
pub mod ordered;

pub use client::{connect, RedisCache};
pub use error::{CacheError, CacheResult};
pub use kv::{get_json, set_json, Cache};
pub use local::LocalCache;
pub use ordered::{LocalOrderedStore, OrderedStore, RedisOrderedStore};
