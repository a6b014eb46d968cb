//! Keys and remote stores for the shard cache.
//!
//! A [`CacheKey`] names a remote shard file and fixes where it lives below a cache root. A
//! [`RemoteStore`] is the only way the cache talks to the outside world: it downloads the
//! file for a key into a local destination.

#![warn(missing_docs)]

mod filesystem;
mod key;
mod store;

pub use filesystem::*;
pub use key::*;
pub use store::*;
