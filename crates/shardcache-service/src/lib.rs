#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod utils;

pub use shardcache_store as store;
